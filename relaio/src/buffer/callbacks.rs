use crate::aio::{AioResult, CallbackOps, IoRef, ResultStatus};
use crate::buffer::{BufferFlags, BufferPool};
use crate::context;

// Handle data of buffer reads holds one buffer index per block.

pub(crate) static SHARED_BUFFER_READV_CALLBACKS: CallbackOps = CallbackOps {
    name: "shared_buffer_readv",
    stage: Some(shared_buffer_readv_stage),
    complete_shared: Some(shared_buffer_readv_complete),
    complete_local: None,
    report: None,
};

/// Local buffers are only reachable from their backend, so they complete
/// in the local half.
pub(crate) static LOCAL_BUFFER_READV_CALLBACKS: CallbackOps = CallbackOps {
    name: "local_buffer_readv",
    stage: Some(local_buffer_readv_stage),
    complete_shared: None,
    complete_local: Some(local_buffer_readv_complete),
    report: None,
};

/// The IO takes its own pin on each buffer and becomes what others wait on.
fn buffer_stage_common(pool: &BufferPool, io: &IoRef<'_>) {
    let wref = io.wref();
    for &index in io.handle_data() {
        let index = index as u32;
        debug_assert!(pool.flags(index).contains(BufferFlags::IO_IN_PROGRESS));
        pool.pin(index);
        pool.set_io_wref(index, wref);
    }
}

/// Marks the blocks the IO read as valid and the rest as failed, so they
/// get read again by whoever needs them next.
fn buffer_readv_complete_common(pool: &BufferPool, io: &IoRef<'_>, prior: AioResult) {
    for (off, &index) in io.handle_data().iter().enumerate() {
        let failed = prior.status == ResultStatus::Error || prior.result <= off as i32;
        let flags = if failed {
            BufferFlags::IO_ERROR
        } else {
            BufferFlags::VALID
        };
        pool.terminate_buffer_io(index as u32, flags, true);
    }
}

fn shared_buffer_readv_stage(io: &mut IoRef<'_>, _cb_data: u8) {
    buffer_stage_common(&io.shared().buffers, io);
}

fn shared_buffer_readv_complete(io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
    buffer_readv_complete_common(&io.shared().buffers, io, prior);
    prior
}

fn local_buffer_readv_stage(io: &mut IoRef<'_>, _cb_data: u8) {
    context::with_context(|ctx| buffer_stage_common(&ctx.local_buffers, io));
}

fn local_buffer_readv_complete(io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
    context::with_context(|ctx| buffer_readv_complete_common(&ctx.local_buffers, io, prior));
    prior
}
