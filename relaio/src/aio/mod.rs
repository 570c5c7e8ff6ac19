//! IO handles and their lifecycle.
//!
//! A backend acquires a handle, describes the IO (target, callbacks, handle
//! data), and starts it. The configured [`IoMethod`] decides where the IO
//! executes; completion callbacks run wherever it completes, and the owning
//! backend eventually reclaims the handle. Other backends observe an IO
//! through a [`WaitRef`].

use crate::buffer::{BufferKind, BufferPool};
use crate::config::AioConfig;
use crate::context::{self, Context, ProcKind, ProcSlots};
use crate::method::{IoMethod, IoWorkerPool, Method};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, info};

mod callbacks;
pub use callbacks::{CallbackId, CallbackOps, CompleteFn, MAX_CALLBACKS, ReportFn, StageFn};
pub(crate) use callbacks::CallbackRegistry;

mod errors;
pub use errors::AioError;

mod handle;
pub(crate) use handle::Handle;
pub use handle::{
    HandleData, HandleFlags, HandleState, IoOp, IoRef, IoVec, OpData, ProcNumber, RwOpData,
};

pub(crate) mod io;
pub use io::{
    IoHandle, acquire, acquire_nb, at_eoxact, check_iovecs, closing_fd, enter_batchmode,
    error_cleanup, exit_batchmode, have_staged, submit_staged,
};

mod pool;
pub(crate) use pool::HandlePool;

pub(crate) mod resowner;
pub use resowner::ResourceOwner;

mod result;
pub use result::{
    AioResult, AioReturn, AioReturnSlot, RESULT_ERROR_BITS, ReportLevel, ResultStatus,
    result_report,
};

mod snapshot;
pub use snapshot::HandleSnapshot;

pub(crate) mod target;
pub use target::{TargetData, TargetId, TargetOps, describe_identity};

mod wref;
pub use wref::WaitRef;

#[cfg(test)]
mod tests;

/// Staged IOs are submitted once this many accumulated in batch mode.
pub const SUBMIT_BATCH_SIZE: usize = 32;

/// Hook run on every IO right before its shared completion callbacks.
#[cfg(any(test, feature = "injection-points"))]
pub type CompletionHook = fn(&mut IoRef<'_>);

/// State visible to every backend and IO worker.
pub(crate) struct Shared {
    pub(crate) cfg: AioConfig,
    pub(crate) pool: HandlePool,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) method: Method,
    pub(crate) buffers: BufferPool,
    pub(crate) slots: ProcSlots,
    #[cfg(any(test, feature = "injection-points"))]
    pub(crate) completion_hook: parking_lot::RwLock<Option<CompletionHook>>,
}

/// An AIO subsystem instance: the shared handle pool, the IO method and
/// the shared buffer pool.
///
/// Threads take part by calling [`Aio::attach`], which makes them a
/// backend with their own range of handles.
pub struct Aio {
    shared: Arc<Shared>,
    workers: Option<IoWorkerPool>,
}

impl Aio {
    pub fn builder() -> crate::Builder {
        crate::Builder::new()
    }

    pub(crate) fn try_new(
        cfg: AioConfig,
        extra: &[&'static CallbackOps],
    ) -> Result<Self, AioError> {
        let mut callbacks = CallbackRegistry::with_builtins();
        for ops in extra {
            callbacks.register(ops)?;
        }

        let method = Method::try_new(&cfg)?;

        let shared = Arc::new(Shared {
            pool: HandlePool::new(&cfg),
            callbacks,
            method,
            buffers: BufferPool::try_new(cfg.shared_buffers, BufferKind::Shared)?,
            slots: ProcSlots::new(cfg.max_backends, cfg.io_workers),
            #[cfg(any(test, feature = "injection-points"))]
            completion_hook: parking_lot::RwLock::new(None),
            cfg,
        });

        let workers = match shared.cfg.io_method {
            IoMethod::Worker => Some(IoWorkerPool::start(&shared)?),
            IoMethod::Sync | IoMethod::IoUring => None,
        };

        info!(
            method = %shared.cfg.io_method,
            handles = shared.pool.len(),
            per_backend = shared.cfg.io_max_concurrency,
            io_workers = shared.cfg.io_workers,
            "aio: initialized"
        );

        Ok(Aio { shared, workers })
    }

    /// Makes the current thread a backend of this subsystem until the
    /// returned guard is dropped.
    pub fn attach(&self) -> Result<BackendGuard, AioError> {
        let ctx = context::attach(self.shared.clone(), ProcKind::Backend)?;
        Ok(BackendGuard { ctx })
    }

    pub fn config(&self) -> &AioConfig {
        &self.shared.cfg
    }

    pub fn io_method(&self) -> IoMethod {
        self.shared.cfg.io_method
    }

    /// Number of attached backends and IO workers.
    pub fn num_attached(&self) -> usize {
        self.shared.slots.num_attached()
    }

    /// Memory needed by the handle pool and the IO method.
    pub fn shmem_size(&self) -> usize {
        self.shared.pool.shmem_size() + self.shared.method.ops().shmem_size()
    }

    /// State of every non-idle handle, for diagnostics.
    pub fn snapshot(&self) -> Vec<HandleSnapshot> {
        snapshot::collect(&self.shared)
    }

    #[cfg(any(test, feature = "injection-points"))]
    pub fn set_completion_hook(&self, hook: Option<CompletionHook>) {
        *self.shared.completion_hook.write() = hook;
    }

    /// Stops the IO workers, if any. Attached backends keep working with
    /// the remaining method state but must not start new IO afterwards.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(workers) = self.workers.take() {
            if let Err(e) = workers.shutdown(&self.shared) {
                error!("error during IO worker shutdown: {:?}", e);
            }
        }
    }
}

impl Drop for Aio {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Attachment of the current thread to an [`Aio`] instance.
///
/// Dropping the guard waits for all of the backend's in-flight IO before
/// detaching, since its handles may still reference the backend's memory.
#[must_use = "the backend detaches when the guard is dropped"]
pub struct BackendGuard {
    ctx: Rc<Context>,
}

impl BackendGuard {
    pub fn procno(&self) -> ProcNumber {
        self.ctx.core.procno
    }
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        if let Err(e) = io::shutdown(&self.ctx) {
            error!(procno = self.ctx.core.procno, "aio: error draining IO at detach: {e}");
        }
        context::detach();
    }
}
