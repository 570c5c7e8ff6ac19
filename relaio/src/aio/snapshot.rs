use crate::aio::{
    HandleFlags, HandleState, IoOp, ProcNumber, ResultStatus, Shared, describe_identity,
};

/// Point-in-time view of one handle.
///
/// Taken without stopping other backends, so fields may belong to slightly
/// different moments of the handle's life. Handles recycled while being
/// read are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSnapshot {
    pub id: u32,
    pub generation: u64,
    pub owner: ProcNumber,
    pub state: HandleState,
    pub op: IoOp,
    pub flags: HandleFlags,
    pub target: String,
    pub num_callbacks: usize,
    pub result: i32,
    pub status: ResultStatus,
}

pub(super) fn collect(shared: &Shared) -> Vec<HandleSnapshot> {
    shared
        .pool
        .iter()
        .filter_map(|handle| {
            let generation = handle.generation();
            let state = handle.state();
            if state == HandleState::Idle {
                return None;
            }

            let snapshot = {
                let data = handle.lock();
                HandleSnapshot {
                    id: handle.index(),
                    generation,
                    owner: handle.owner(),
                    state,
                    op: data.op(),
                    flags: data.flags(),
                    target: describe_identity(data.target_data()),
                    num_callbacks: data.num_callbacks as usize,
                    result: data.result(),
                    status: data.distilled_result().status,
                }
            };

            let (recycled, _) = handle.was_recycled(generation);
            (!recycled).then_some(snapshot)
        })
        .collect()
}
