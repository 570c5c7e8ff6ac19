use crate::aio::{
    AioError, HandleData, HandleFlags, IoRef, IoVec, SUBMIT_BATCH_SIZE, Shared, io, target,
};
use crate::config::AioConfig;
use crate::context::{self, Context, ProcKind};
use crate::method::IoMethodOps;
use crate::utils::ScopeGuard;
use crate::utils::sys;
use anyhow::{Result, anyhow};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, trace, warn};

/// Hands submitted IOs to IO worker threads through a bounded queue.
///
/// Workers are separate processes as far as handles go: they reopen the
/// target's file themselves, so IOs whose target cannot be reopened, or that
/// reference backend-local memory, execute in the issuer instead.
pub(crate) struct WorkerMethod {
    queue: ArrayQueue<u32>,
    lock: Mutex<()>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl WorkerMethod {
    pub(crate) fn new(cfg: &AioConfig) -> Self {
        Self {
            queue: ArrayQueue::new(cfg.io_worker_queue_size.next_power_of_two()),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn wake_workers(&self, queued: usize) {
        let _guard = self.lock.lock();
        if queued > 1 {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
    }

    fn request_shutdown(&self) {
        let _guard = self.lock.lock();
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl IoMethodOps for WorkerMethod {
    fn shmem_size(&self) -> usize {
        self.queue.capacity() * size_of::<u32>()
    }

    fn needs_synchronous_execution(&self, io: &HandleData) -> bool {
        io.flags().contains(HandleFlags::REFERENCES_LOCAL) || !target::can_reopen(io.target_data())
    }

    fn submit(&self, ctx: &Context, staged: &[u32]) -> usize {
        let pool = &ctx.shared.pool;
        let mut synchronous: SmallVec<[u32; SUBMIT_BATCH_SIZE]> = SmallVec::new();

        for &index in staged {
            io::prepare_submit(ctx, pool.get(index));
            if self.queue.push(index).is_err() {
                synchronous.push(index);
            }
        }

        let queued = staged.len() - synchronous.len();
        if queued > 0 {
            self.wake_workers(queued);
        }

        for index in synchronous {
            debug!(io = index, "aio: worker queue full, executing synchronously");
            let handle = pool.get(index);
            handle.lock().executed_synchronously = true;
            io::perform_synchronously(ctx, handle);
        }

        staged.len()
    }
}

/// The IO worker threads of an [`Aio`](crate::Aio) instance.
#[derive(Debug)]
pub(crate) struct IoWorkerPool {
    handles: Vec<(ThreadId, thread::JoinHandle<()>)>,
}

impl IoWorkerPool {
    pub(crate) fn start(shared: &Arc<Shared>) -> Result<Self, AioError> {
        let num_workers = shared.cfg.io_workers;

        let barrier = Arc::new(Barrier::new(num_workers + 1));
        let handles = (0..num_workers)
            .map(|_| spawn_io_worker(shared.clone(), barrier.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        // Every worker attached, or failed to, once this returns.
        barrier.wait();

        Ok(Self { handles })
    }

    pub(crate) fn shutdown(self, shared: &Shared) -> Result<()> {
        let method = shared
            .method
            .as_worker()
            .ok_or_else(|| anyhow!("IO workers running without worker method"))?;
        method.request_shutdown();

        let errors = self
            .handles
            .into_iter()
            .filter_map(|(thread_id, handle)| handle.join().err().map(|_| thread_id))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} IO worker(s) panicked", errors.len()))
        }
    }
}

fn spawn_io_worker(
    shared: Arc<Shared>,
    barrier: Arc<Barrier>,
) -> Result<(ThreadId, thread::JoinHandle<()>), AioError> {
    let handle = thread::Builder::new()
        .name(shared.cfg.thread_name.0())
        .spawn(move || {
            if let Err(e) = io_worker_main(shared, &barrier) {
                error!("IO worker {:?} failed: {}", thread::current().name(), e);
            }
        })?;

    Ok((handle.thread().id(), handle))
}

fn io_worker_main(shared: Arc<Shared>, barrier: &Barrier) -> Result<(), AioError> {
    let attached = context::attach(shared.clone(), ProcKind::IoWorker);
    barrier.wait();

    let ctx = attached?;
    let _detach = ScopeGuard::new(|| {
        context::detach();
    });

    let method = shared
        .method
        .as_worker()
        .ok_or_else(|| anyhow!("IO worker started without worker method"))?;

    info!(procno = ctx.core.procno, "aio: IO worker started");

    loop {
        if let Some(index) = method.queue.pop() {
            execute(&ctx, index);
            continue;
        }

        let mut guard = method.lock.lock();
        if method.queue.is_empty() {
            // Drain the queue before honoring shutdown.
            if method.shutdown.load(Ordering::Acquire) {
                break;
            }
            method.cv.wait(&mut guard);
        }
    }

    info!(procno = ctx.core.procno, "aio: IO worker exiting");
    Ok(())
}

/// Executes one IO on behalf of its issuer.
fn execute(ctx: &Context, index: u32) {
    let handle = ctx.shared.pool.get(index);
    let _crit = ctx.core.crit_section();

    let prepared = {
        let mut data = handle.lock();
        let reopened = target::reopen(&mut IoRef::new(&ctx.shared, handle, &mut data));
        reopened.map(|()| (data.op_data, SmallVec::<[IoVec; 16]>::from_slice(data.iovecs())))
    };

    let result = match prepared {
        Ok((op_data, iovecs)) => sys::perform_rw(&op_data, &iovecs),
        Err(e) => {
            warn!(io = index, "aio: could not reopen target: {e}");
            sys::neg_errno(&e)
        }
    };

    trace!(io = index, result, procno = ctx.core.procno, "aio: IO worker executed IO");
    io::process_completion(ctx, index, result);
}
