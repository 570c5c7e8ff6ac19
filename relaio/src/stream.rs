//! Look-ahead reading of relation blocks.
//!
//! A [`ReadStream`] asks a callback for the blocks it will need and reads
//! them ahead of time, combining consecutive blocks into larger reads. How
//! far ahead it reads adapts to whether blocks need IO at all: the distance
//! doubles every time a read needs IO and decays by one on every read that
//! found all its blocks in buffers.

use crate::aio::{self, AioError};
use crate::buffer::{
    Buffer, ReadBuffersOperation, release_buffer, start_read_buffers, wait_read_buffers,
};
use crate::context;
use crate::storage::{BlockNumber, ForkNumber, SmgrRelation};
use bitflags::bitflags;
use std::collections::VecDeque;
use tracing::{error, trace};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadStreamFlags: u8 {
        /// Start at the full look-ahead distance instead of ramping up.
        const FULL = 1 << 0;
        /// Stage the reads of one look-ahead round in batch mode. The block
        /// callback must then not wait on anything.
        const USE_BATCHING = 1 << 1;
    }
}

#[derive(Debug)]
struct InProgress {
    op: ReadBuffersOperation,
    /// Next buffer of `op` to hand out.
    next: usize,
}

/// A stream of pinned, valid buffers for the blocks produced by `next_block`.
pub struct ReadStream<F>
where
    F: FnMut() -> Option<BlockNumber>,
{
    rel: SmgrRelation,
    fork: ForkNumber,
    flags: ReadStreamFlags,
    next_block: F,

    io_combine_limit: u32,
    max_pinned_buffers: usize,
    distance: usize,
    /// Pins held by the stream, not yet handed out.
    pinned_buffers: usize,

    /// Consecutive blocks collected for the next read.
    pending: Option<(BlockNumber, u32)>,
    /// Block returned by the callback that did not fit the pending read.
    unget: Option<BlockNumber>,
    exhausted: bool,

    reads: VecDeque<InProgress>,
}

impl<F> ReadStream<F>
where
    F: FnMut() -> Option<BlockNumber>,
{
    pub fn new(rel: SmgrRelation, fork: ForkNumber, flags: ReadStreamFlags, next_block: F) -> Self {
        let (io_combine_limit, max_ios, pool_len) = context::with_context(|ctx| {
            let pool_len = if rel.is_temp() {
                ctx.local_buffers.len()
            } else {
                ctx.shared.buffers.len()
            };
            (
                ctx.shared.cfg.io_combine_limit,
                ctx.shared.cfg.io_max_concurrency,
                pool_len,
            )
        });

        // Leave most of the pool to everybody else.
        let max_pinned_buffers = ((max_ios + 1) * io_combine_limit)
            .min(pool_len / 4)
            .max(1);

        let distance = if flags.contains(ReadStreamFlags::FULL) {
            io_combine_limit.min(max_pinned_buffers)
        } else {
            1
        };

        ReadStream {
            rel,
            fork,
            flags,
            next_block,
            io_combine_limit: io_combine_limit as u32,
            max_pinned_buffers,
            distance,
            pinned_buffers: 0,
            pending: None,
            unget: None,
            exhausted: false,
            reads: VecDeque::new(),
        }
    }

    pub fn distance(&self) -> usize {
        self.distance
    }

    fn pending_nblocks(&self) -> usize {
        self.pending.map_or(0, |(_, n)| n as usize)
    }

    fn get_block(&mut self) -> Option<BlockNumber> {
        if let Some(block) = self.unget.take() {
            return Some(block);
        }
        if self.exhausted {
            return None;
        }

        let block = (self.next_block)();
        if block.is_none() {
            self.exhausted = true;
        }
        block
    }

    /// Starts reading the pending blocks. A read may cover fewer blocks than
    /// pending; the rest stays pending.
    fn start_pending_read(&mut self) -> Result<(), AioError> {
        let Some((blocknum, nblocks)) = self.pending.take() else {
            return Ok(());
        };

        let op = start_read_buffers(self.rel, self.fork, blocknum, nblocks)?;
        let got = op.nblocks() as u32;
        if got < nblocks {
            self.pending = Some((blocknum + got, nblocks - got));
        }

        if op.wait_needed() {
            self.distance = (self.distance * 2).min(self.max_pinned_buffers);
        } else if self.distance > 1 {
            self.distance -= 1;
        }

        trace!(
            blocknum,
            nblocks = got,
            io = op.wait_needed(),
            distance = self.distance,
            "stream: started read"
        );

        self.pinned_buffers += got as usize;
        self.reads.push_back(InProgress { op, next: 0 });
        Ok(())
    }

    fn look_ahead(&mut self) -> Result<(), AioError> {
        let batching = self.flags.contains(ReadStreamFlags::USE_BATCHING);
        if batching {
            aio::enter_batchmode();
        }

        let res = self.look_ahead_inner();

        if batching {
            aio::exit_batchmode();
        }
        res
    }

    fn look_ahead_inner(&mut self) -> Result<(), AioError> {
        while self.pinned_buffers + self.pending_nblocks() < self.distance {
            let Some(block) = self.get_block() else {
                break;
            };

            match self.pending {
                Some((start, n)) if start + n == block && n < self.io_combine_limit => {
                    self.pending = Some((start, n + 1));
                }
                Some(_) => {
                    self.unget = Some(block);
                    self.start_pending_read()?;
                    continue;
                }
                None => self.pending = Some((block, 1)),
            }

            if self.pending_nblocks() == self.io_combine_limit as usize {
                self.start_pending_read()?;
            }
        }

        // Keep collecting into a short pending read while there is
        // something else to hand out meanwhile.
        if self.pending.is_some()
            && (self.exhausted
                || self.pinned_buffers == 0
                || self.pending_nblocks() >= self.distance)
        {
            self.start_pending_read()?;
        }
        Ok(())
    }

    /// Returns the next buffer of the stream, pinned for the caller, or
    /// `None` once the block callback is exhausted.
    pub fn next_buffer(&mut self) -> Result<Option<Buffer>, AioError> {
        if self.reads.is_empty() {
            self.look_ahead()?;
        }

        let Some(front) = self.reads.front_mut() else {
            return Ok(None);
        };

        if front.op.wait_needed() {
            let remaining = front.op.nblocks() - front.next;
            if let Err(e) = wait_read_buffers(&mut front.op) {
                // The failed read released its pins.
                self.pinned_buffers -= remaining;
                self.reads.pop_front();
                return Err(e);
            }
        }

        let buf = front.op.buffers()[front.next];
        front.next += 1;
        if front.next == front.op.nblocks() {
            self.reads.pop_front();
        }
        self.pinned_buffers -= 1;

        self.look_ahead()?;
        Ok(Some(buf))
    }

    /// Drops everything read ahead and starts over with the next block the
    /// callback produces.
    pub fn reset(&mut self) -> Result<(), AioError> {
        let mut first_err = None;
        while let Some(mut read) = self.reads.pop_front() {
            let remaining = read.op.nblocks() - read.next;
            if read.op.wait_needed() {
                if let Err(e) = wait_read_buffers(&mut read.op) {
                    self.pinned_buffers -= remaining;
                    first_err.get_or_insert(e);
                    continue;
                }
            }
            for &buf in &read.op.buffers()[read.next..] {
                release_buffer(buf);
            }
            self.pinned_buffers -= remaining;
        }
        debug_assert_eq!(self.pinned_buffers, 0);

        self.pending = None;
        self.unget = None;
        self.exhausted = false;
        self.distance = 1;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Releases the stream's remaining pins.
    pub fn end(mut self) -> Result<(), AioError> {
        self.reset()
    }
}

impl<F> Drop for ReadStream<F>
where
    F: FnMut() -> Option<BlockNumber>,
{
    fn drop(&mut self) {
        if self.reads.is_empty() {
            return;
        }
        if let Err(e) = self.reset() {
            error!("stream: error releasing read-ahead buffers: {e}");
        }
    }
}
