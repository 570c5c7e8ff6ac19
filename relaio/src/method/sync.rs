use crate::aio::HandleData;
use crate::context::Context;
use crate::method::IoMethodOps;

/// Executes every IO in the issuer while it is being staged.
pub(crate) struct SyncMethod;

impl IoMethodOps for SyncMethod {
    fn needs_synchronous_execution(&self, _io: &HandleData) -> bool {
        true
    }

    fn submit(&self, _ctx: &Context, staged: &[u32]) -> usize {
        unreachable!("sync method staged {} IOs for submission", staged.len());
    }
}
