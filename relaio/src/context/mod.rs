use crate::aio::{AioError, ProcNumber, Shared};
use crate::buffer::{BufferKind, BufferPool};
use crate::storage::Smgr;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::thread_local;
use tracing::debug;

mod core;
pub(crate) use core::Core;

pub(crate) mod slots;
pub(crate) use slots::{ProcKind, ProcSlots};

/// Everything a backend needs to issue and complete IO: the subsystem it is
/// attached to plus the state only this backend may touch.
pub(crate) struct Context {
    pub(crate) shared: Arc<Shared>,
    pub(crate) core: Core,
    pub(crate) smgr: RefCell<Smgr>,
    pub(crate) local_buffers: BufferPool,
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<Context>>> = const { RefCell::new(None) };
}

/// Attaches the current thread to `shared` as a process of the given kind.
pub(crate) fn attach(shared: Arc<Shared>, kind: ProcKind) -> Result<Rc<Context>, AioError> {
    if is_attached() {
        return Err(AioError::AlreadyAttached);
    }

    let thread_id = thread::current().id();
    let procno = shared.slots.reserve(thread_id, kind)?;

    let ctx = match init_context(&shared, procno, kind) {
        Ok(ctx) => Rc::new(ctx),
        Err(e) => {
            shared.slots.free(&thread_id);
            return Err(e);
        }
    };

    CONTEXT.with(|c| *c.borrow_mut() = Some(ctx.clone()));
    debug!(procno, ?kind, "aio: attached");
    Ok(ctx)
}

fn init_context(
    shared: &Arc<Shared>,
    procno: ProcNumber,
    kind: ProcKind,
) -> Result<Context, AioError> {
    shared.method.ops().init_backend(procno)?;

    let handles = shared.pool.backend_range(procno);
    Ok(Context {
        shared: shared.clone(),
        core: Core::new(procno, kind, handles),
        smgr: RefCell::new(Smgr::new(&shared.cfg.data_dir, procno)),
        local_buffers: BufferPool::try_new(shared.cfg.local_buffers, BufferKind::Local)?,
    })
}

/// Removes the current thread's context and frees its slot.
pub(crate) fn detach() -> Option<Rc<Context>> {
    let ctx = CONTEXT.with(|c| c.borrow_mut().take())?;
    ctx.shared.slots.free(&thread::current().id());
    debug!(procno = ctx.core.procno, "aio: detached");
    Some(ctx)
}

pub(crate) fn is_attached() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

pub(crate) fn try_current() -> Option<Rc<Context>> {
    CONTEXT.with(|c| c.borrow().clone())
}

// The Rc is cloned out of the cell before running `f`, so callbacks invoked
// from `f` can re-enter.
#[track_caller]
pub(crate) fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&Context) -> R,
{
    let ctx = try_current().expect("thread is not attached to an AIO subsystem");
    f(&ctx)
}

#[inline(always)]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    with_context(|ctx| f(&ctx.core))
}

#[inline(always)]
pub(crate) fn with_shared<F, R>(f: F) -> R
where
    F: FnOnce(&Shared) -> R,
{
    with_context(|ctx| f(&ctx.shared))
}

#[inline(always)]
pub(crate) fn with_smgr_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Smgr) -> R,
{
    with_context(|ctx| f(&mut ctx.smgr.borrow_mut()))
}

pub(crate) fn my_procno() -> ProcNumber {
    with_core(|core| core.procno)
}
