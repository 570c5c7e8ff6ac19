//! Strategies for executing staged IOs.
//!
//! * [`IoMethod::Sync`] executes every IO in the issuer before `start_*`
//!   returns.
//! * [`IoMethod::Worker`] hands IOs to a pool of IO worker threads through a
//!   bounded queue.
//! * [`IoMethod::IoUring`] submits IOs to a per-backend io_uring instance.

use crate::aio::{AioError, HandleData, ProcNumber};
use crate::config::AioConfig;
use crate::context::Context;
use std::fmt;
use std::str::FromStr;

mod ring;
pub(crate) use ring::RingMethod;
pub use ring::io_uring_supported;

mod sync;
pub(crate) use sync::SyncMethod;

mod worker;
pub(crate) use worker::{IoWorkerPool, WorkerMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IoMethod {
    Sync,
    #[default]
    Worker,
    IoUring,
}

impl IoMethod {
    pub fn name(&self) -> &'static str {
        match self {
            IoMethod::Sync => "sync",
            IoMethod::Worker => "worker",
            IoMethod::IoUring => "io_uring",
        }
    }
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IoMethod {
    type Err = AioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(IoMethod::Sync),
            "worker" => Ok(IoMethod::Worker),
            "io_uring" => Ok(IoMethod::IoUring),
            other => Err(AioError::Config(format!("invalid io_method \"{other}\""))),
        }
    }
}

/// Operations every IO method provides. Only `submit` is mandatory.
pub(crate) trait IoMethodOps: Send + Sync {
    /// Shared memory the method needs on top of the handle pool.
    fn shmem_size(&self) -> usize {
        0
    }

    /// Per-backend setup, run when a thread attaches.
    fn init_backend(&self, _procno: ProcNumber) -> Result<(), AioError> {
        Ok(())
    }

    /// Whether closing a file descriptor while IO on it is in flight would
    /// break the IO.
    fn wait_on_fd_before_close(&self) -> bool {
        false
    }

    /// Whether the IO has to be executed synchronously by the issuer.
    fn needs_synchronous_execution(&self, _io: &HandleData) -> bool {
        false
    }

    /// Hands the staged IOs to the executor. Must call `prepare_submit` on
    /// each of them and return how many were submitted.
    fn submit(&self, ctx: &Context, staged: &[u32]) -> usize;

    /// Whether the method can drive completion of a specific IO itself,
    /// instead of waiting for the executor to signal it.
    fn can_wait_one(&self) -> bool {
        false
    }

    fn wait_one(&self, _ctx: &Context, _index: u32, _ref_generation: u64) {
        unreachable!("IO method cannot wait for a single IO");
    }
}

pub(crate) enum Method {
    Sync(SyncMethod),
    Worker(WorkerMethod),
    IoUring(RingMethod),
}

impl Method {
    pub(crate) fn try_new(cfg: &AioConfig) -> Result<Self, AioError> {
        Ok(match cfg.io_method {
            IoMethod::Sync => Method::Sync(SyncMethod),
            IoMethod::Worker => Method::Worker(WorkerMethod::new(cfg)),
            IoMethod::IoUring => Method::IoUring(RingMethod::try_new(cfg)?),
        })
    }

    pub(crate) fn kind(&self) -> IoMethod {
        match self {
            Method::Sync(_) => IoMethod::Sync,
            Method::Worker(_) => IoMethod::Worker,
            Method::IoUring(_) => IoMethod::IoUring,
        }
    }

    pub(crate) fn ops(&self) -> &dyn IoMethodOps {
        match self {
            Method::Sync(m) => m,
            Method::Worker(m) => m,
            Method::IoUring(m) => m,
        }
    }

    pub(crate) fn as_worker(&self) -> Option<&WorkerMethod> {
        match self {
            Method::Worker(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sync("sync", IoMethod::Sync)]
    #[case::worker("worker", IoMethod::Worker)]
    #[case::io_uring("io_uring", IoMethod::IoUring)]
    fn test_parse_io_method(#[case] name: &str, #[case] expected: IoMethod) -> anyhow::Result<()> {
        let method: IoMethod = name.parse()?;
        assert_eq!(method, expected);
        assert_eq!(method.to_string(), name);
        Ok(())
    }

    #[test]
    fn test_parse_invalid_io_method() {
        assert!(matches!(
            "posix_aio".parse::<IoMethod>(),
            Err(AioError::Config(_))
        ));
    }
}
