use crate::aio::{Aio, IoRef};
use crate::config::Builder;
use crate::context;
use crate::storage::{BLCKSZ, BlockNumber, ForkNumber, RelFileLocator, SmgrRelation};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Database all test relations live in.
pub(crate) const TEST_DB: u32 = 5;

/// Builds a subsystem over a fresh data directory, for tests that need
/// more control than `#[relaio::test]` offers. The directory must outlive
/// the subsystem.
pub(crate) fn init_aio(builder: Builder) -> anyhow::Result<(TempDir, Aio)> {
    let data_dir = TempDir::new()?;
    let aio = builder.data_dir(data_dir.path()).try_build()?;
    Ok((data_dir, aio))
}

/// Recognizable contents of block `blocknum`: the block number followed by
/// a byte pattern derived from it.
pub(crate) fn pattern_block(blocknum: BlockNumber) -> Vec<u8> {
    let mut block: Vec<u8> = (0..BLCKSZ)
        .map(|i| (i + blocknum as usize * 31) as u8)
        .collect();
    block[..4].copy_from_slice(&blocknum.to_le_bytes());
    block
}

fn fill_rel(rel: SmgrRelation, nblocks: u32) -> io::Result<SmgrRelation> {
    rel.create(ForkNumber::Main)?;
    for blocknum in 0..nblocks {
        rel.extend(ForkNumber::Main, blocknum, &pattern_block(blocknum))?;
    }
    Ok(rel)
}

/// Creates relation `rel_number` with `nblocks` blocks of
/// [`pattern_block`] contents.
pub(crate) fn create_rel(rel_number: u32, nblocks: u32) -> io::Result<SmgrRelation> {
    fill_rel(SmgrRelation::new(RelFileLocator::new(TEST_DB, rel_number)), nblocks)
}

/// Like [`create_rel`], for a temp relation of the calling backend.
pub(crate) fn create_temp_rel(rel_number: u32, nblocks: u32) -> io::Result<SmgrRelation> {
    fill_rel(SmgrRelation::temp(RelFileLocator::new(TEST_DB, rel_number)), nblocks)
}

/// Pins held on shared buffers, by anyone.
pub(crate) fn shared_pins() -> u32 {
    context::with_shared(|shared| {
        (0..shared.buffers.len() as u32)
            .map(|index| shared.buffers.refcount(index))
            .sum()
    })
}

/// Number of idle handles of the calling backend.
pub(crate) fn num_idle() -> usize {
    context::with_core(|core| core.idle.borrow().len())
}

pub(crate) fn num_in_flight() -> usize {
    context::with_core(|core| core.in_flight.borrow().len())
}

/// Block aligned, owned memory to point iovecs at.
pub(crate) fn block_buffer(nblocks: usize) -> Vec<u8> {
    vec![0u8; nblocks * BLCKSZ]
}

/// Callbacks that count their invocations and pass results through.
///
/// Tests run in parallel, so every test declares its own set with
/// [`counting_callbacks!`].
pub(crate) struct CountingCallbacks {
    pub(crate) stage: AtomicUsize,
    pub(crate) shared: AtomicUsize,
    pub(crate) local: AtomicUsize,
}

impl CountingCallbacks {
    pub(crate) const fn new() -> Self {
        CountingCallbacks {
            stage: AtomicUsize::new(0),
            shared: AtomicUsize::new(0),
            local: AtomicUsize::new(0),
        }
    }

    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.stage.load(Ordering::SeqCst),
            self.shared.load(Ordering::SeqCst),
            self.local.load(Ordering::SeqCst),
        )
    }
}

/// Declares module `$name` holding `OPS`, a [`CallbackOps`] counting its
/// invocations into `COUNTS` and passing results through.
macro_rules! counting_callbacks {
    ($name:ident) => {
        mod $name {
            use std::sync::atomic::Ordering;
            use $crate::aio::{AioResult, CallbackOps, IoRef};
            use $crate::test_utils::CountingCallbacks;

            pub(crate) static COUNTS: CountingCallbacks = CountingCallbacks::new();

            pub(crate) static OPS: CallbackOps = CallbackOps {
                name: stringify!($name),
                stage: Some(stage),
                complete_shared: Some(complete_shared),
                complete_local: Some(complete_local),
                report: None,
            };

            fn stage(_io: &mut IoRef<'_>, _cb_data: u8) {
                COUNTS.stage.fetch_add(1, Ordering::SeqCst);
            }

            fn complete_shared(_io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
                COUNTS.shared.fetch_add(1, Ordering::SeqCst);
                prior
            }

            fn complete_local(_io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
                COUNTS.local.fetch_add(1, Ordering::SeqCst);
                prior
            }
        }
    };
}
pub(crate) use counting_callbacks;

/// Completion hook dropping the last block of every multi-block transfer,
/// so reads get retried for the rest.
pub(crate) fn drop_last_block_hook(io: &mut IoRef<'_>) {
    if io.result() > BLCKSZ as i32 {
        io.set_result(io.result() - BLCKSZ as i32);
    }
}

/// Completion hook failing every IO with EIO.
pub(crate) fn eio_hook(io: &mut IoRef<'_>) {
    io.set_result(-libc::EIO);
}
