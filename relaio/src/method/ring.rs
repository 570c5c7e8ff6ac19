use crate::aio::{AioError, HandleData, HandleFlags, HandleState, OpData, io};
use crate::config::AioConfig;
use crate::context::Context;
use crate::method::IoMethodOps;
use io_uring::{IoUring, cqueue, opcode, squeue, types};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::io as stdio;
use tracing::{trace, warn};

/// Upper bound on completions processed per reaping pass.
const MAX_LOCAL_COMPLETED_IO: usize = 32;

/// Returns whether this kernel lets us create an io_uring instance.
pub fn io_uring_supported() -> bool {
    IoUring::new(2).is_ok()
}

/// Submits IOs to one io_uring instance per backend.
///
/// Any backend may reap completions from any ring, so that waiting on
/// another backend's IO does not depend on that backend making progress.
/// The per-ring mutex serializes submission and reaping.
pub(crate) struct RingMethod {
    rings: Box<[Mutex<CompletionRing>]>,
    entries: u32,
    offload_threshold: usize,
}

impl RingMethod {
    pub(crate) fn try_new(cfg: &AioConfig) -> Result<Self, AioError> {
        let entries = cfg.io_max_concurrency as u32;
        let rings = (0..cfg.num_procs())
            .map(|_| CompletionRing::try_new(entries).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();

        Ok(Self {
            rings,
            entries,
            offload_threshold: cfg.ring_offload_threshold,
        })
    }
}

impl IoMethodOps for RingMethod {
    fn shmem_size(&self) -> usize {
        let per_ring = self.entries as usize
            * (size_of::<squeue::Entry>() + 2 * size_of::<cqueue::Entry>());
        per_ring * self.rings.len()
    }

    fn wait_on_fd_before_close(&self) -> bool {
        true
    }

    fn needs_synchronous_execution(&self, io: &HandleData) -> bool {
        io.flags().contains(HandleFlags::REFERENCES_LOCAL)
    }

    fn submit(&self, ctx: &Context, staged: &[u32]) -> usize {
        let pool = &ctx.shared.pool;
        let mut ring = self.rings[ctx.core.procno as usize].lock();
        let mut in_flight = ctx.core.in_flight.borrow().len();

        for &index in staged {
            let handle = pool.get(index);
            let (entry, op) = {
                let data = handle.lock();
                let offload = should_offload(&data, in_flight, self.offload_threshold);
                prep_entry(index, &data, offload)
            };
            trace!(io = index, ?op, "aio: pushing to io_uring");

            io::prepare_submit(ctx, handle);
            in_flight += 1;
            ring.push(&entry);
        }

        if let Err(e) = ring.submit() {
            panic!("{}", AioError::ring_submit(e));
        }

        staged.len()
    }

    fn can_wait_one(&self) -> bool {
        true
    }

    fn wait_one(&self, ctx: &Context, index: u32, ref_generation: u64) {
        let handle = ctx.shared.pool.get(index);
        let ring = &self.rings[handle.owner() as usize];

        loop {
            let mut ring = ring.lock();

            // Another backend may have reaped the completion while we were
            // waiting for the lock.
            let (recycled, state) = handle.was_recycled(ref_generation);
            if recycled || state != HandleState::Submitted {
                return;
            }

            if !ring.has_ready_cqes() {
                if let Err(e) = ring.wait() {
                    panic!("could not wait for io_uring completion: {e}");
                }
            }

            let completions = ring.reap(MAX_LOCAL_COMPLETED_IO);
            let _crit = ctx.core.crit_section();
            for (completed, result) in completions {
                io::process_completion(ctx, completed, result);
            }
        }
    }
}

/// Opcode chosen for an IO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingOp {
    Read,
    Readv,
    Write,
    Writev,
}

/// Once enough IOs are in flight, buffered IOs skip the kernel's
/// non-blocking first attempt, which would likely fail anyway.
pub(crate) fn should_offload(io: &HandleData, in_flight: usize, threshold: usize) -> bool {
    io.flags().contains(HandleFlags::BUFFERED) && in_flight >= threshold
}

/// Builds the submission entry for a staged IO. Single-iovec IOs use the
/// plain read/write opcodes. `offload` sends the IO straight to the kernel's
/// async workers.
pub(crate) fn prep_entry(index: u32, io: &HandleData, offload: bool) -> (squeue::Entry, RingOp) {
    let iovecs = io.iovecs();

    // Transfers were capped at i32::MAX bytes when the IO was started.
    let (entry, op) = match (io.op_data(), iovecs) {
        (OpData::Readv(rw), [iov]) => (
            opcode::Read::new(types::Fd(rw.fd), iov.base(), iov.len() as u32)
                .offset(rw.offset)
                .build(),
            RingOp::Read,
        ),
        (OpData::Readv(rw), iovs) => (
            opcode::Readv::new(types::Fd(rw.fd), iovs.as_ptr().cast(), iovs.len() as u32)
                .offset(rw.offset)
                .build(),
            RingOp::Readv,
        ),
        (OpData::Writev(rw), [iov]) => (
            opcode::Write::new(types::Fd(rw.fd), iov.base().cast_const(), iov.len() as u32)
                .offset(rw.offset)
                .build(),
            RingOp::Write,
        ),
        (OpData::Writev(rw), iovs) => (
            opcode::Writev::new(types::Fd(rw.fd), iovs.as_ptr().cast(), iovs.len() as u32)
                .offset(rw.offset)
                .build(),
            RingOp::Writev,
        ),
        (OpData::Invalid, _) => panic!("trying to prepare invalid IO {index} for execution"),
    };

    let mut entry = entry.user_data(index as u64);
    if offload {
        entry = entry.flags(squeue::Flags::ASYNC);
    }

    (entry, op)
}

/// An io_uring instance shared between its owning backend, which submits,
/// and any backend reaping completions.
struct CompletionRing {
    ring: IoUring,
}

// SAFETY: the ring is only ever accessed through the mutex wrapping it.
unsafe impl Send for CompletionRing {}

impl CompletionRing {
    fn try_new(entries: u32) -> Result<Self, AioError> {
        let ring = IoUring::builder()
            // Keep submitting after a failed SQE; the failure shows up as a
            // CQE for that IO only.
            .setup_submit_all()
            .build(entries)
            .map_err(AioError::ring_setup)?;

        if !ring.params().is_feature_nodrop() {
            warn!(
                "IORING_FEAT_NODROP is not enabled for this kernel. The kernel will silently drop completions if the CQ ring is full."
            );
        }

        Ok(Self { ring })
    }

    fn push(&mut self, entry: &squeue::Entry) {
        // SAFETY: the entry points at the handle's iovec array, which lives
        // as long as the pool, and at memory the issuer keeps alive until
        // the IO completes.
        if unsafe { self.ring.submission().push(entry) }.is_err() {
            panic!("io_uring submission queue full");
        }
    }

    fn submit(&mut self) -> stdio::Result<usize> {
        loop {
            match self.ring.submit() {
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                res => return res,
            }
        }
    }

    fn has_ready_cqes(&mut self) -> bool {
        !self.ring.completion().is_empty()
    }

    /// Blocks until at least one completion is ready.
    fn wait(&mut self) -> stdio::Result<()> {
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn reap(&mut self, max: usize) -> SmallVec<[(u32, i32); MAX_LOCAL_COMPLETED_IO]> {
        let mut cq = self.ring.completion();
        cq.sync();
        cq.by_ref()
            .take(max)
            .map(|cqe| (cqe.user_data() as u32, cqe.result()))
            .collect()
    }
}
