use crate::aio::{AioError, AioResult, IoRef, ReportLevel, ResultStatus, TargetData};
use crate::{buffer, storage};
use std::fmt;

/// Maximum number of callbacks one IO can carry.
pub const MAX_CALLBACKS: usize = 4;

/// Result ids are stored in 6 bits.
const MAX_REGISTERED_CALLBACKS: usize = 1 << 6;

/// Identifies a set of callbacks in the registry. Stored inside IO handles
/// and results instead of function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CallbackId(u8);

impl CallbackId {
    pub const INVALID: CallbackId = CallbackId(0);
    pub const MD_READV: CallbackId = CallbackId(1);
    pub const MD_WRITEV: CallbackId = CallbackId(2);
    pub const SHARED_BUFFER_READV: CallbackId = CallbackId(3);
    pub const LOCAL_BUFFER_READV: CallbackId = CallbackId(4);

    const NUM_BUILTIN: u8 = 5;

    /// Id assigned to the `n`-th set of callbacks passed to
    /// [`Builder::callbacks`](crate::Builder::callbacks).
    pub const fn custom(n: u8) -> CallbackId {
        CallbackId(Self::NUM_BUILTIN + n)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runs in the issuer right before the IO is staged.
pub type StageFn = fn(&mut IoRef<'_>, u8);

/// Runs once per IO, in whichever process handles its completion. Receives
/// the result distilled so far and returns the updated one.
pub type CompleteFn = fn(&mut IoRef<'_>, AioResult, u8) -> AioResult;

/// Turns a failed result into a log line or an error.
pub type ReportFn = fn(&AioResult, &TargetData, ReportLevel) -> Result<(), AioError>;

/// One entry of the callback registry.
///
/// Callbacks registered on an IO run in reverse registration order, so the
/// lowest layer (the one registered last) sees the raw result first.
#[derive(Debug, Default)]
pub struct CallbackOps {
    pub name: &'static str,
    pub stage: Option<StageFn>,
    pub complete_shared: Option<CompleteFn>,
    pub complete_local: Option<CompleteFn>,
    pub report: Option<ReportFn>,
}

static INVALID_CALLBACKS: CallbackOps = CallbackOps {
    name: "invalid",
    stage: None,
    complete_shared: None,
    complete_local: None,
    report: None,
};

pub(crate) struct CallbackRegistry {
    ops: Vec<&'static CallbackOps>,
}

impl CallbackRegistry {
    pub(crate) fn with_builtins() -> Self {
        CallbackRegistry {
            ops: vec![
                &INVALID_CALLBACKS,
                &storage::MD_READV_CALLBACKS,
                &storage::MD_WRITEV_CALLBACKS,
                &buffer::SHARED_BUFFER_READV_CALLBACKS,
                &buffer::LOCAL_BUFFER_READV_CALLBACKS,
            ],
        }
    }

    pub(crate) fn register(&mut self, ops: &'static CallbackOps) -> Result<CallbackId, AioError> {
        if ops.complete_shared.is_none() && ops.complete_local.is_none() {
            return Err(AioError::CallbackWithoutCompletion(ops.name));
        }
        if self.ops.len() >= MAX_REGISTERED_CALLBACKS {
            return Err(AioError::TooManyCallbacks(MAX_REGISTERED_CALLBACKS));
        }

        let id = CallbackId(self.ops.len() as u8);
        self.ops.push(ops);
        Ok(id)
    }

    /// Checks that `id` can be attached to an IO.
    pub(crate) fn validate(&self, id: CallbackId) -> Result<(), AioError> {
        match self.ops.get(id.0 as usize) {
            Some(_) if id == CallbackId::INVALID => Err(AioError::CallbackOutOfRange(id.0)),
            Some(ops) if ops.complete_shared.is_none() && ops.complete_local.is_none() => {
                Err(AioError::CallbackWithoutCompletion(ops.name))
            }
            Some(_) => Ok(()),
            None => Err(AioError::CallbackOutOfRange(id.0)),
        }
    }

    pub(crate) fn get(&self, id: CallbackId) -> &'static CallbackOps {
        self.ops
            .get(id.0 as usize)
            .copied()
            .unwrap_or(&INVALID_CALLBACKS)
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Runs the stage callbacks of `io`.
    pub(crate) fn call_stage(&self, io: &mut IoRef<'_>) {
        let (ids, data, n) = registered(io);
        for i in (0..n).rev() {
            let (id, cb_data) = (ids[i], data[i]);
            if let Some(stage) = self.get(id).stage {
                stage(io, cb_data);
            }
        }
    }

    /// Runs the shared completion callbacks and stores the distilled result
    /// in the handle.
    pub(crate) fn call_complete_shared(&self, io: &mut IoRef<'_>) {
        let mut result = AioResult::ok(io.data.result);

        let (ids, data, n) = registered(io);
        for i in (0..n).rev() {
            let (id, cb_data) = (ids[i], data[i]);
            if let Some(complete) = self.get(id).complete_shared {
                result = complete(io, result, cb_data);
                debug_assert!(result.status != ResultStatus::Unknown);
            }
        }

        io.data.distilled_result = result;
    }

    /// Runs the local completion callbacks. Their result is only visible to
    /// the issuer and never stored in the handle.
    pub(crate) fn call_complete_local(&self, io: &mut IoRef<'_>) -> AioResult {
        let mut result = io.data.distilled_result;

        let (ids, data, n) = registered(io);
        for i in (0..n).rev() {
            let (id, cb_data) = (ids[i], data[i]);
            if let Some(complete) = self.get(id).complete_local {
                result = complete(io, result, cb_data);
            }
        }

        result
    }
}

/// Copies the callbacks of `io` out of the handle, so they can borrow it
/// mutably while running. Completion runs in a critical section, nothing
/// here may allocate.
fn registered(io: &IoRef<'_>) -> ([CallbackId; MAX_CALLBACKS], [u8; MAX_CALLBACKS], usize) {
    (
        io.data.callbacks,
        io.data.callback_data,
        io.data.num_callbacks as usize,
    )
}
