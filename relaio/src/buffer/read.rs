use crate::aio::{
    self, AioError, AioReturnSlot, CallbackId, IoVec, ReportLevel, ResultStatus, WaitRef,
    describe_identity, result_report,
};
use crate::buffer::{Buffer, BufferFlags, BufferPool, BufferTag};
use crate::context;
use crate::storage::{BLCKSZ, BlockNumber, ForkNumber, SmgrRelation, max_combine};
use smallvec::SmallVec;
use tracing::debug;

/// A read of a range of consecutive blocks into pinned buffers.
///
/// Started with [`start_read_buffers`], which pins a buffer for every block
/// and starts reading the first run of blocks that are not valid yet.
/// [`wait_read_buffers`] then drives the read to completion, reading again
/// what a short read left out and blocks whose IO by another backend failed.
/// Once it returns, every buffer is valid and pinned for the caller.
#[derive(Debug)]
pub struct ReadBuffersOperation {
    rel: SmgrRelation,
    fork: ForkNumber,
    blocknum: BlockNumber,
    buffers: SmallVec<[Buffer; 16]>,
    /// Leading buffers known to be valid.
    nblocks_done: usize,
    io_wref: WaitRef,
    io_nblocks: usize,
    io_return: AioReturnSlot,
}

impl ReadBuffersOperation {
    pub fn blocknum(&self) -> BlockNumber {
        self.blocknum
    }

    /// Number of blocks read. May be fewer than requested, when the range
    /// crosses a segment boundary or the combine limit.
    pub fn nblocks(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Whether [`wait_read_buffers`] has anything left to do.
    pub fn wait_needed(&self) -> bool {
        self.nblocks_done < self.buffers.len()
    }

    fn with_pool<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&BufferPool) -> R,
    {
        context::with_context(|ctx| {
            if self.rel.is_temp() {
                f(&ctx.local_buffers)
            } else {
                f(&ctx.shared.buffers)
            }
        })
    }

    fn skip_valid(&mut self) {
        let buffers = &self.buffers;
        let done = self.with_pool(|pool| {
            buffers[self.nblocks_done..]
                .iter()
                .take_while(|buf| pool.flags(buf.index()).contains(BufferFlags::VALID))
                .count()
        });
        self.nblocks_done += done;
    }

    /// Starts one IO for the run of buffers beginning at `nblocks_done`.
    fn start_io(&mut self) -> Result<(), AioError> {
        let first = self.nblocks_done;
        let ioh = aio::acquire(None, Some(&self.io_return))?;
        let buffers = self.buffers.clone();

        let claimed = self.with_pool(|pool| -> Result<SmallVec<[u32; 16]>, AioError> {
            let mut claimed = SmallVec::new();
            // Waits for another backend's IO on the first block, but never
            // on later blocks: the run ends there.
            if !pool.start_buffer_io(buffers[first].index(), true)? {
                return Ok(claimed);
            }
            claimed.push(buffers[first].index());

            for buf in &buffers[first + 1..] {
                if !pool.start_buffer_io(buf.index(), false)? {
                    break;
                }
                claimed.push(buf.index());
            }
            Ok(claimed)
        });

        let claimed = match claimed {
            Ok(claimed) if claimed.is_empty() => {
                // Read by someone else meanwhile.
                ioh.release()?;
                self.nblocks_done += 1;
                return Ok(());
            }
            Ok(claimed) => claimed,
            Err(e) => {
                ioh.release()?;
                return Err(e);
            }
        };

        let (iovecs, callbacks) = self.with_pool(|pool| {
            let iovecs: SmallVec<[IoVec; 16]> = claimed
                .iter()
                .map(|&index| IoVec::new(pool.page(index), BLCKSZ))
                .collect();
            let callbacks = if self.rel.is_temp() {
                CallbackId::LOCAL_BUFFER_READV
            } else {
                CallbackId::SHARED_BUFFER_READV
            };
            (iovecs, callbacks)
        });

        let mut ioh = ioh;
        let prepared = ioh
            .set_handle_data_32(&claimed)
            .and_then(|()| ioh.register_callbacks(callbacks, 0));
        if let Err(e) = prepared {
            self.abort_buffer_io(&claimed);
            ioh.release()?;
            return Err(e);
        }

        self.io_wref = ioh.wref();
        self.io_nblocks = claimed.len();
        let blocknum = self.blocknum + first as BlockNumber;
        debug!(
            blocknum,
            nblocks = claimed.len(),
            io = self.io_wref.id(),
            "buffer: starting read"
        );

        // SAFETY: the buffers are pinned and marked IO_IN_PROGRESS, nobody
        // else touches their pages until the IO terminates them.
        let started = unsafe { self.rel.start_readv(ioh, self.fork, blocknum, &iovecs) };
        if let Err(e) = started {
            self.io_wref.clear();
            self.abort_buffer_io(&claimed);
            return Err(e);
        }
        Ok(())
    }

    fn abort_buffer_io(&self, claimed: &[u32]) {
        self.with_pool(|pool| {
            for &index in claimed {
                pool.terminate_buffer_io(index, BufferFlags::IO_ERROR, false);
            }
        });
    }

    fn release_pins(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.with_pool(|pool| {
            for buf in &buffers {
                pool.unpin(buf.index());
            }
        });
        self.nblocks_done = 0;
    }
}

/// Pins buffers for up to `nblocks` blocks starting at `blocknum` and
/// starts reading the first of them that are not valid yet.
///
/// Fewer blocks are read if the range crosses a segment boundary, exceeds
/// the combine limit, or not enough buffers can be pinned.
pub fn start_read_buffers(
    rel: SmgrRelation,
    fork: ForkNumber,
    blocknum: BlockNumber,
    nblocks: u32,
) -> Result<ReadBuffersOperation, AioError> {
    assert!(nblocks > 0, "reading zero blocks");
    let limit = context::with_shared(|shared| shared.cfg.io_max_combine_limit) as u32;
    let nblocks = nblocks.min(limit).min(max_combine(blocknum));

    let mut op = ReadBuffersOperation {
        rel,
        fork,
        blocknum,
        buffers: SmallVec::new(),
        nblocks_done: 0,
        io_wref: WaitRef::invalid(),
        io_nblocks: 0,
        io_return: AioReturnSlot::new(),
    };

    let pinned = op.with_pool(|pool| -> Result<SmallVec<[Buffer; 16]>, AioError> {
        let mut pinned: SmallVec<[Buffer; 16]> = SmallVec::new();
        for block in blocknum..blocknum + nblocks {
            match pool.pin_block(BufferTag { rel, fork, block }) {
                Ok((index, _)) => pinned.push(pool.buffer(index)),
                // Read what we could pin.
                Err(AioError::NoUnpinnedBuffers(_)) if !pinned.is_empty() => break,
                Err(e) => {
                    for buf in &pinned {
                        pool.unpin(buf.index());
                    }
                    return Err(e);
                }
            }
        }
        Ok(pinned)
    })?;
    op.buffers = pinned;

    op.skip_valid();
    if op.wait_needed() {
        if let Err(e) = op.start_io() {
            op.release_pins();
            return Err(e);
        }
    }
    Ok(op)
}

/// Waits for the read to finish, reading again what is still missing.
///
/// IO failures are reported at ERROR level and returned. The operation's
/// pins are released in that case.
pub fn wait_read_buffers(op: &mut ReadBuffersOperation) -> Result<(), AioError> {
    while op.wait_needed() {
        if op.io_wref.is_valid() {
            let io_id = op.io_wref.id();
            op.io_wref.wait()?;
            op.io_wref.clear();

            let ret = op.io_return.get();
            op.io_return.reset();

            let done = match ret.result.status {
                ResultStatus::Ok => op.io_nblocks,
                ResultStatus::Warning => {
                    result_report(&ret.result, &ret.target_data, ReportLevel::Warning)?;
                    op.io_nblocks
                }
                ResultStatus::Partial => {
                    result_report(&ret.result, &ret.target_data, ReportLevel::Debug)?;
                    ret.result.result as usize
                }
                ResultStatus::Error => {
                    let err = result_report(&ret.result, &ret.target_data, ReportLevel::Error)
                        .err()
                        .unwrap_or_else(|| AioError::Report {
                            status: ret.result.status,
                            message: format!(
                                "could not read {}",
                                describe_identity(&ret.target_data)
                            ),
                        });
                    op.release_pins();
                    return Err(err);
                }
                ResultStatus::Unknown => {
                    panic!("read IO {io_id} finished without a result")
                }
            };
            op.nblocks_done += done;
        }

        op.skip_valid();
        if op.wait_needed() {
            if let Err(e) = op.start_io() {
                op.release_pins();
                return Err(e);
            }
        }
    }
    Ok(())
}
