use crate::aio::{Aio, AioError, CallbackOps};
use crate::method::IoMethod;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on iovecs per IO, and on blocks combined into one IO.
pub const PG_IOV_MAX: usize = 128;

/// Upper bound on the number of IO worker threads.
pub const MAX_IO_WORKERS: usize = 32;

/// `io_max_concurrency` value requesting automatic sizing.
const AUTO_MAX_CONCURRENCY: i32 = -1;

/// Cap for automatically sized `io_max_concurrency`.
const MAX_AUTO_CONCURRENCY: usize = 64;

/// Default number of blocks combined into a single read.
const IO_COMBINE_LIMIT: usize = 16;

const MAX_BACKENDS: usize = 8;

const IO_WORKERS: usize = 3;

/// Number of shared buffers, also used to size `io_max_concurrency`.
const SHARED_BUFFERS: usize = 1024;

const LOCAL_BUFFERS: usize = 64;

/// Ring method: in-flight count above which buffered IOs are pushed to the
/// kernel's async workers right away instead of trying a non-blocking
/// attempt first.
const RING_OFFLOAD_THRESHOLD: usize = 4;

/// Capacity of the worker method's submission queue.
const IO_WORKER_QUEUE_SIZE: usize = 64;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("relaio-io-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// How IOs get executed.
    io_method: IoMethod,

    /// Handles per backend. `-1` sizes it from `shared_buffers`.
    io_max_concurrency: i32,

    /// Blocks combined into one read by read streams, clamped to
    /// `io_max_combine_limit`.
    io_combine_limit: usize,

    /// Hard limit on iovecs per IO, fixes the size of each handle.
    io_max_combine_limit: usize,

    /// Regular backend slots.
    max_backends: usize,

    /// IO worker threads, only started by the worker method.
    io_workers: usize,

    shared_buffers: usize,

    /// Buffers of each backend's private pool, used for temp relations.
    local_buffers: usize,

    ring_offload_threshold: usize,

    io_worker_queue_size: usize,

    /// Name fn used for IO worker threads.
    thread_name: ThreadNameFn,

    /// Root of the relation files.
    data_dir: Option<PathBuf>,

    /// Extra callbacks, assigned ids in order via [`crate::CallbackId::custom`].
    callbacks: Vec<&'static CallbackOps>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            io_method: IoMethod::default(),
            io_max_concurrency: AUTO_MAX_CONCURRENCY,
            io_combine_limit: IO_COMBINE_LIMIT,
            io_max_combine_limit: IO_COMBINE_LIMIT,
            max_backends: MAX_BACKENDS,
            io_workers: IO_WORKERS,
            shared_buffers: SHARED_BUFFERS,
            local_buffers: LOCAL_BUFFERS,
            ring_offload_threshold: RING_OFFLOAD_THRESHOLD,
            io_worker_queue_size: IO_WORKER_QUEUE_SIZE,
            thread_name: default_thread_name_fn(),
            data_dir: None,
            callbacks: Vec::new(),
        }
    }

    pub fn io_method(mut self, val: IoMethod) -> Self {
        self.io_method = val;
        self
    }

    /// Number of handles each backend owns, `-1` for automatic sizing.
    pub fn io_max_concurrency(mut self, val: i32) -> Self {
        self.io_max_concurrency = val;
        self
    }

    #[track_caller]
    pub fn io_combine_limit(mut self, val: usize) -> Self {
        assert!(val > 0, "io_combine_limit must be greater than 0");
        self.io_combine_limit = val;
        self
    }

    #[track_caller]
    pub fn io_max_combine_limit(mut self, val: usize) -> Self {
        assert!(val > 0, "io_max_combine_limit must be greater than 0");
        self.io_max_combine_limit = val;
        self
    }

    #[track_caller]
    pub fn max_backends(mut self, val: usize) -> Self {
        assert!(val > 0, "max_backends must be greater than 0");
        self.max_backends = val;
        self
    }

    pub fn io_workers(mut self, val: usize) -> Self {
        self.io_workers = val;
        self
    }

    #[track_caller]
    pub fn shared_buffers(mut self, val: usize) -> Self {
        assert!(val > 0, "shared_buffers must be greater than 0");
        self.shared_buffers = val;
        self
    }

    #[track_caller]
    pub fn local_buffers(mut self, val: usize) -> Self {
        assert!(val > 0, "local_buffers must be greater than 0");
        self.local_buffers = val;
        self
    }

    pub fn ring_offload_threshold(mut self, val: usize) -> Self {
        self.ring_offload_threshold = val;
        self
    }

    #[track_caller]
    pub fn io_worker_queue_size(mut self, val: usize) -> Self {
        assert!(val > 0, "io_worker_queue_size must be greater than 0");
        self.io_worker_queue_size = val;
        self
    }

    /// Sets the name of IO worker threads.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    pub fn data_dir(mut self, val: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(val.into());
        self
    }

    /// Adds a set of callbacks to the registry. The `n`-th call (counting
    /// from 0) registers id `CallbackId::custom(n)`.
    pub fn callbacks(mut self, ops: &'static CallbackOps) -> Self {
        self.callbacks.push(ops);
        self
    }

    /// Sets up the shared handle pool, the IO method and, for the worker
    /// method, starts the IO workers.
    pub fn try_build(mut self) -> Result<Aio, AioError> {
        let callbacks = std::mem::take(&mut self.callbacks);
        let cfg = AioConfig::try_from(self)?;
        Aio::try_new(cfg, &callbacks)
    }
}

/// Resolved configuration, shared by all backends.
#[derive(Debug, Clone)]
pub struct AioConfig {
    pub io_method: IoMethod,
    pub io_max_concurrency: usize,
    pub io_combine_limit: usize,
    pub io_max_combine_limit: usize,
    pub max_backends: usize,
    /// Auxiliary slots, the number of IO workers under the worker method.
    pub io_workers: usize,
    pub shared_buffers: usize,
    pub local_buffers: usize,
    pub ring_offload_threshold: usize,
    pub io_worker_queue_size: usize,
    pub data_dir: PathBuf,
    pub(crate) thread_name: ThreadNameFn,
}

impl AioConfig {
    /// Backend plus auxiliary slots; each owns `io_max_concurrency` handles.
    pub fn num_procs(&self) -> usize {
        self.max_backends + self.io_workers
    }

    pub fn num_handles(&self) -> usize {
        self.num_procs() * self.io_max_concurrency
    }

    fn validate(&self) -> Result<(), AioError> {
        if self.io_max_combine_limit > PG_IOV_MAX {
            return Err(AioError::Config(format!(
                "io_max_combine_limit {} exceeds the maximum of {}",
                self.io_max_combine_limit, PG_IOV_MAX
            )));
        }
        if self.io_method == IoMethod::Worker && self.io_workers == 0 {
            return Err(AioError::Config(
                "io_method worker requires at least one IO worker".into(),
            ));
        }
        if self.io_workers > MAX_IO_WORKERS {
            return Err(AioError::Config(format!(
                "io_workers {} exceeds the maximum of {}",
                self.io_workers, MAX_IO_WORKERS
            )));
        }
        if self.num_handles() > u32::MAX as usize {
            return Err(AioError::Config("too many IO handles".into()));
        }
        Ok(())
    }
}

/// Handles per backend when sized automatically: a proportional share of
/// `shared_buffers`, at least 1 and at most 64.
fn choose_max_concurrency(shared_buffers: usize, num_procs: usize) -> usize {
    let proportional = shared_buffers / num_procs.max(1);
    proportional.clamp(1, MAX_AUTO_CONCURRENCY)
}

impl TryFrom<Builder> for AioConfig {
    type Error = AioError;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let data_dir = builder
            .data_dir
            .ok_or_else(|| AioError::Config("data_dir must be set".into()))?;

        let io_workers = match builder.io_method {
            IoMethod::Worker => builder.io_workers,
            IoMethod::Sync | IoMethod::IoUring => 0,
        };

        let io_max_concurrency = match builder.io_max_concurrency {
            AUTO_MAX_CONCURRENCY => {
                choose_max_concurrency(builder.shared_buffers, builder.max_backends + io_workers)
            }
            0 => {
                return Err(AioError::Config(
                    "io_max_concurrency must be -1 or greater than 0".into(),
                ));
            }
            n if n < 0 => {
                return Err(AioError::Config(format!(
                    "invalid io_max_concurrency {n}"
                )));
            }
            n => n as usize,
        };

        let cfg = AioConfig {
            io_method: builder.io_method,
            io_max_concurrency,
            io_combine_limit: builder.io_combine_limit.min(builder.io_max_combine_limit),
            io_max_combine_limit: builder.io_max_combine_limit,
            max_backends: builder.max_backends,
            io_workers,
            shared_buffers: builder.shared_buffers,
            local_buffers: builder.local_buffers,
            ring_offload_threshold: builder.ring_offload_threshold,
            io_worker_queue_size: builder.io_worker_queue_size,
            data_dir,
            thread_name: builder.thread_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
