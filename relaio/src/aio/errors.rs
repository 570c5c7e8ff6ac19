use crate::aio::{HandleState, ResultStatus};
use std::io::{self, Error};

/// Recoverable failures of the AIO subsystem.
///
/// Conditions that indicate corrupted shared state, such as an illegal
/// handle transition or a method submitting fewer IOs than asked, are not
/// represented here: they panic, since no caller can meaningfully continue.
#[derive(thiserror::Error, Debug)]
pub enum AioError {
    /// A backend may only hold one handed-out handle at a time.
    #[error("API violation: only one IO can be handed out")]
    AlreadyHandedOut,

    #[error("release of IO {id} in unexpected state {state}")]
    ReleaseInvalidState { id: u32, state: HandleState },

    /// The referenced handle is not in a state anyone can wait on, e.g.
    /// another backend's handle that is still being defined.
    #[error("IO {id} in wrong state to wait on: {state}")]
    WaitInvalidState { id: u32, state: HandleState },

    /// Every handle of this backend is handed out or staged elsewhere and
    /// nothing is in flight that could free one.
    #[error("no free IOs despite no in-flight IOs")]
    NoInFlight,

    #[error("too much handle data: {len} > {max}")]
    HandleDataTooLarge { len: usize, max: usize },

    /// More iovecs than a handle has room for, see `io_max_combine_limit`.
    #[error("too many iovecs: {len} > {max}")]
    TooManyIovecs { len: usize, max: usize },

    /// Results are reported as `i32`, larger transfers cannot be told apart
    /// from an errno.
    #[error("IO of {0} bytes exceeds the maximum of {max} bytes", max = i32::MAX)]
    TransferTooLarge(u64),

    #[error("callback {0} is out of range")]
    CallbackOutOfRange(u8),

    #[error("callback {0} does not have a completion callback")]
    CallbackWithoutCompletion(&'static str),

    #[error("too many registered callbacks, the max is {0}")]
    TooManyCallbacks(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend is already attached to an AIO subsystem")]
    AlreadyAttached,

    #[error("all {0} backend slots are in use")]
    NoFreeSlot(usize),

    #[error("no unpinned buffers available among {0}")]
    NoUnpinnedBuffers(usize),

    #[error("could not setup io_uring queue: {source}{}", .hint.map(|h| format!(" (hint: {h})")).unwrap_or_default())]
    RingSetup {
        source: io::Error,
        hint: Option<&'static str>,
    },

    #[error("could not submit IOs to io_uring: {source}{}", .hint.map(|h| format!(" (hint: {h})")).unwrap_or_default())]
    RingSubmit {
        source: io::Error,
        hint: Option<&'static str>,
    },

    /// A completed IO reported a failure at ERROR level.
    #[error("{message}")]
    Report {
        status: ResultStatus,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl AioError {
    pub(crate) fn ring_setup(source: io::Error) -> Self {
        let hint = ring_hint(&source);
        AioError::RingSetup { source, hint }
    }

    pub(crate) fn ring_submit(source: io::Error) -> Self {
        let hint = ring_hint(&source);
        AioError::RingSubmit { source, hint }
    }

    /// Failures worth retrying after other IO made progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            AioError::NoInFlight | AioError::NoUnpinnedBuffers(_) => true,
            AioError::Report { status, .. } => *status == ResultStatus::Partial,
            AioError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EINTR)),
            _ => false,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AioError::Io(e) => e.raw_os_error(),
            AioError::RingSetup { source, .. } | AioError::RingSubmit { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

impl From<AioError> for io::Error {
    fn from(e: AioError) -> Self {
        match e {
            AioError::Io(io_err) => io_err,
            _ => Error::other(e.to_string()),
        }
    }
}

fn ring_hint(source: &io::Error) -> Option<&'static str> {
    match source.raw_os_error() {
        Some(libc::EPERM) => {
            Some("check if io_uring is disabled via /proc/sys/kernel/io_uring_disabled")
        }
        Some(libc::EMFILE) => Some("consider raising the open file limit (ulimit -n)"),
        Some(libc::ENOSYS) => Some("kernel does not support io_uring"),
        Some(libc::ENOMEM) => Some("consider raising the locked memory limit (ulimit -l)"),
        _ => None,
    }
}
