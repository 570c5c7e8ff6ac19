use crate::aio::{
    AioError, AioReturn, AioReturnSlot, CallbackId, Handle, HandleData, HandleFlags, HandleState,
    IoRef, IoVec, MAX_CALLBACKS, OpData, ResourceOwner, RwOpData, SUBMIT_BATCH_SIZE, Shared,
    TargetData, WaitRef,
};
use crate::context::{self, Context};
use crate::utils::sys;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// An IO handle handed out to the current backend.
///
/// Exactly one handle can be handed out per backend. It must be either
/// started with [`IoHandle::start_readv`]/[`IoHandle::start_writev`] or
/// given back with [`IoHandle::release`].
#[derive(Debug)]
#[must_use = "a handed out IO must be started or released"]
pub struct IoHandle {
    index: u32,
    // Handles belong to the backend thread that acquired them.
    _not_send: PhantomData<Rc<()>>,
}

/// Checks that `iovecs` fit into a handle and that the transfer size can be
/// reported as a result.
pub fn check_iovecs(iovecs: &[IoVec]) -> Result<(), AioError> {
    let max = context::with_shared(|shared| shared.pool.max_iovecs());
    if iovecs.len() > max {
        return Err(AioError::TooManyIovecs {
            len: iovecs.len(),
            max,
        });
    }

    let total: u64 = iovecs.iter().map(|iov| iov.len() as u64).sum();
    if total > i32::MAX as u64 {
        return Err(AioError::TransferTooLarge(total));
    }
    Ok(())
}

/// Acquires an idle handle, waiting for one of this backend's in-flight IOs
/// to complete if none is idle.
///
/// `resowner` is responsible for the handle until it is reclaimed, `ret`
/// receives the outcome when it is.
pub fn acquire(
    resowner: Option<&ResourceOwner>,
    ret: Option<&AioReturnSlot>,
) -> Result<IoHandle, AioError> {
    context::with_context(|ctx| loop {
        if let Some(ioh) = acquire_nb_in(ctx, resowner, ret)? {
            return Ok(ioh);
        }
        wait_for_free(ctx)?;
    })
}

/// Like [`acquire`], but returns `None` instead of waiting.
pub fn acquire_nb(
    resowner: Option<&ResourceOwner>,
    ret: Option<&AioReturnSlot>,
) -> Result<Option<IoHandle>, AioError> {
    context::with_context(|ctx| acquire_nb_in(ctx, resowner, ret))
}

fn acquire_nb_in(
    ctx: &Context,
    resowner: Option<&ResourceOwner>,
    ret: Option<&AioReturnSlot>,
) -> Result<Option<IoHandle>, AioError> {
    let core = &ctx.core;

    if core.num_staged() >= SUBMIT_BATCH_SIZE {
        debug_assert!(core.in_batchmode.get());
        submit_staged_in(ctx);
    }

    if core.handed_out.get().is_some() {
        return Err(AioError::AlreadyHandedOut);
    }

    let Some(index) = core.idle.borrow_mut().pop_front() else {
        return Ok(None);
    };

    let handle = ctx.shared.pool.get(index);
    debug_assert_eq!(handle.owner(), core.procno);

    handle.bump_generation();
    handle.update_state(HandleState::HandedOut);
    core.handed_out.set(Some(index));

    {
        let mut local = core.local(index);
        if let Some(owner) = resowner {
            owner.remember(index);
            local.resowner = Some(owner.downgrade());
        }
        if let Some(ret) = ret {
            ret.reset();
            local.report_return = Some(ret.clone());
        }
    }

    trace!(io = index, generation = handle.generation(), "aio: acquired");
    Ok(Some(IoHandle {
        index,
        _not_send: PhantomData,
    }))
}

impl IoHandle {
    /// Index of the handle in the shared pool.
    pub fn id(&self) -> u32 {
        self.index
    }

    pub fn wref(&self) -> WaitRef {
        self.with_handle(|_, handle| handle.wref())
    }

    pub fn set_flag(&mut self, flag: HandleFlags) {
        self.with_handle(|_, handle| handle.lock().flags |= flag);
    }

    /// Sets what the IO operates on. Can only be done once per IO.
    pub fn set_target(&mut self, target: TargetData) {
        self.with_handle(|_, handle| {
            let mut data = handle.lock();
            assert_eq!(
                data.target_data,
                TargetData::Invalid,
                "IO {} already has a target",
                self.index
            );
            data.target_data = target;
        });
    }

    /// Attaches a set of registered callbacks along with one byte of
    /// callback specific data.
    pub fn register_callbacks(&mut self, id: CallbackId, cb_data: u8) -> Result<(), AioError> {
        self.with_handle(|ctx, handle| {
            ctx.shared.callbacks.validate(id)?;

            let mut data = handle.lock();
            let n = data.num_callbacks as usize;
            assert!(
                n < MAX_CALLBACKS,
                "too many callbacks, the max is {MAX_CALLBACKS}"
            );
            data.callbacks[n] = id;
            data.callback_data[n] = cb_data;
            data.num_callbacks += 1;
            Ok(())
        })
    }

    pub fn set_handle_data_32(&mut self, values: &[u32]) -> Result<(), AioError> {
        self.set_handle_data(values.iter().map(|&v| v as u64), values.len())
    }

    pub fn set_handle_data_64(&mut self, values: &[u64]) -> Result<(), AioError> {
        self.set_handle_data(values.iter().copied(), values.len())
    }

    fn set_handle_data(
        &mut self,
        values: impl Iterator<Item = u64>,
        len: usize,
    ) -> Result<(), AioError> {
        self.with_handle(|ctx, handle| {
            let max = ctx.shared.pool.max_handle_data();
            if len > max {
                return Err(AioError::HandleDataTooLarge { len, max });
            }

            let mut data = handle.lock();
            for (slot, value) in data.handle_data.iter_mut().zip(values) {
                *slot = value;
            }
            data.handle_data_len = len as u8;
            Ok(())
        })
    }

    /// Starts a positioned vectored read into `iovecs`.
    ///
    /// The handle must have a target. Depending on the IO method and flags
    /// the read is executed synchronously before this returns, staged for
    /// later submission in batch mode, or submitted right away.
    ///
    /// # Safety
    ///
    /// The memory `iovecs` point to must stay valid, and must not be accessed
    /// by anything else, until the IO completed. The read may be executed by
    /// another thread.
    ///
    /// Fails, releasing the handle, if `iovecs` do not pass [`check_iovecs`].
    pub unsafe fn start_readv(
        self,
        fd: RawFd,
        iovecs: &[IoVec],
        offset: u64,
    ) -> Result<(), AioError> {
        let rw = RwOpData {
            fd,
            iov_length: iovecs.len() as u16,
            offset,
        };
        self.start(OpData::Readv(rw), iovecs)
    }

    /// Starts a positioned vectored write from `iovecs`.
    ///
    /// # Safety
    ///
    /// Same as [`IoHandle::start_readv`]: the memory must outlive the IO and
    /// must not be modified while it is in flight.
    pub unsafe fn start_writev(
        self,
        fd: RawFd,
        iovecs: &[IoVec],
        offset: u64,
    ) -> Result<(), AioError> {
        let rw = RwOpData {
            fd,
            iov_length: iovecs.len() as u16,
            offset,
        };
        self.start(OpData::Writev(rw), iovecs)
    }

    fn start(self, op_data: OpData, iovecs: &[IoVec]) -> Result<(), AioError> {
        assert!(!iovecs.is_empty(), "IO {} started without iovecs", self.index);
        if let Err(e) = check_iovecs(iovecs) {
            self.release()?;
            return Err(e);
        }

        self.with_handle(|ctx, handle| {
            {
                let mut data = handle.lock();
                assert_ne!(
                    data.target_data,
                    TargetData::Invalid,
                    "IO {} started without a target",
                    self.index
                );

                data.iovecs[..iovecs.len()].copy_from_slice(iovecs);
                data.op_data = op_data;
                data.result = 0;
            }
            stage(ctx, handle);
        });
        Ok(())
    }

    /// Returns the handle to the idle list without performing any IO.
    pub fn release(self) -> Result<(), AioError> {
        context::with_context(|ctx| {
            let handle = ctx.shared.pool.get(self.index);
            if ctx.core.handed_out.get() != Some(self.index) {
                return Err(AioError::ReleaseInvalidState {
                    id: self.index,
                    state: handle.state(),
                });
            }

            ctx.core.handed_out.set(None);
            reclaim(ctx, handle);
            Ok(())
        })
    }

    #[track_caller]
    fn with_handle<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Context, &Handle) -> R,
    {
        context::with_context(|ctx| {
            let handle = ctx.shared.pool.get(self.index);
            assert_eq!(
                handle.state(),
                HandleState::HandedOut,
                "IO {} is no longer handed out",
                self.index
            );
            f(ctx, handle)
        })
    }
}

fn needs_synchronous_execution(shared: &Shared, data: &HandleData) -> bool {
    data.flags.contains(HandleFlags::SYNCHRONOUS)
        || shared.method.ops().needs_synchronous_execution(data)
}

fn stage(ctx: &Context, handle: &Handle) {
    let core = &ctx.core;
    debug_assert_eq!(core.handed_out.get(), Some(handle.index()));

    handle.update_state(HandleState::Defined);
    core.handed_out.set(None);

    let needs_sync = {
        let mut data = handle.lock();
        ctx.shared
            .callbacks
            .call_stage(&mut IoRef::new(&ctx.shared, handle, &mut data));

        let needs_sync = needs_synchronous_execution(&ctx.shared, &data);
        data.executed_synchronously = needs_sync;

        debug!(
            io = handle.index(),
            op = data.op().name(),
            target = data.target_data.id() as u8,
            callbacks = data.num_callbacks,
            needs_sync,
            "aio: staged"
        );
        needs_sync
    };

    handle.update_state(HandleState::Staged);

    if needs_sync {
        // Never submitted, the IO goes straight from STAGED to COMPLETED_IO.
        core.in_flight.borrow_mut().push_back(handle.index());
        perform_synchronously(ctx, handle);
    } else {
        core.staged.borrow_mut().push(handle.index());
        if !core.in_batchmode.get() {
            submit_staged_in(ctx);
        }
    }
}

/// Marks a staged IO as submitted and tracks it as in flight. Called by IO
/// methods for every IO they are about to hand to the executor.
pub(crate) fn prepare_submit(ctx: &Context, handle: &Handle) {
    handle.update_state(HandleState::Submitted);
    ctx.core.in_flight.borrow_mut().push_back(handle.index());
}

/// Executes a staged or submitted IO in the current thread and processes
/// its completion.
pub(crate) fn perform_synchronously(ctx: &Context, handle: &Handle) {
    let _crit = ctx.core.crit_section();

    let (op_data, iovecs) = {
        let data = handle.lock();
        (data.op_data, SmallVec::<[IoVec; 16]>::from_slice(data.iovecs()))
    };

    let result = sys::perform_rw(&op_data, &iovecs);
    process_completion(ctx, handle.index(), result);
}

pub fn submit_staged() {
    context::with_context(submit_staged_in)
}

pub(crate) fn submit_staged_in(ctx: &Context) {
    let staged = std::mem::take(&mut *ctx.core.staged.borrow_mut());
    if staged.is_empty() {
        return;
    }

    let method = ctx.shared.method.ops();
    let submitted = {
        let _crit = ctx.core.crit_section();
        method.submit(ctx, &staged)
    };

    assert_eq!(
        submitted,
        staged.len(),
        "io method {} submitted {} of {} staged IOs",
        ctx.shared.method.kind(),
        submitted,
        staged.len()
    );

    debug!(
        count = submitted,
        method = %ctx.shared.method.kind(),
        "aio: submitted staged IOs"
    );
}

/// Records the raw result of an IO and runs its shared completion
/// callbacks. Runs in whichever process executed or reaped the IO; the owner
/// reclaims the handle right away.
pub(crate) fn process_completion(ctx: &Context, index: u32, result: i32) {
    let shared = &ctx.shared;
    let handle = shared.pool.get(index);

    let state = handle.state();
    assert!(
        matches!(state, HandleState::Submitted | HandleState::Staged),
        "IO {index} completed in unexpected state {state}"
    );
    debug_assert!(ctx.core.in_crit_section());

    handle.lock().result = result;
    handle.update_state(HandleState::CompletedIo);

    {
        let mut data = handle.lock();
        let mut io = IoRef::new(shared, handle, &mut data);

        #[cfg(any(test, feature = "injection-points"))]
        if let Some(hook) = *shared.completion_hook.read() {
            hook(&mut io);
        }

        shared.callbacks.call_complete_shared(&mut io);

        trace!(
            io = index,
            result = data.result,
            status = data.distilled_result.status.name(),
            "aio: completed"
        );
    }

    handle.update_state(HandleState::CompletedShared);

    if handle.owner() == ctx.core.procno {
        reclaim(ctx, handle);
    }
}

/// Returns one of our handles to the idle list, running local completion
/// callbacks and filling the report return slot on the way.
pub(crate) fn reclaim(ctx: &Context, handle: &Handle) {
    let core = &ctx.core;
    let index = handle.index();
    let state = handle.state();

    assert_eq!(handle.owner(), core.procno, "reclaiming IO {} of another backend", index);
    assert!(
        matches!(state, HandleState::HandedOut | HandleState::CompletedShared),
        "reclaiming IO {} in state {}",
        index,
        state
    );

    let local_result = if state == HandleState::CompletedShared {
        let result = {
            let mut data = handle.lock();
            ctx.shared
                .callbacks
                .call_complete_local(&mut IoRef::new(&ctx.shared, handle, &mut data))
        };
        handle.update_state(HandleState::CompletedLocal);
        Some(result)
    } else {
        None
    };

    let (report_return, resowner) = {
        let mut local = core.local(index);
        (local.report_return.take(), local.resowner.take())
    };

    {
        let mut data = handle.lock();
        debug!(
            io = index,
            state = state.name(),
            op = data.op().name(),
            result = data.result,
            status = data.distilled_result.status.name(),
            "aio: reclaiming"
        );

        if state != HandleState::HandedOut {
            core.remove_in_flight(index);

            if let Some(slot) = report_return {
                slot.set(AioReturn {
                    result: local_result.unwrap_or(data.distilled_result),
                    target_data: data.target_data,
                });
            }
        }

        data.reset();
    }

    if let Some(owner) = resowner.and_then(|weak| weak.upgrade()) {
        owner.forget(index);
    }

    handle.update_state(HandleState::Idle);
    core.idle.borrow_mut().push_front(index);
}

/// Frees up at least one handle of this backend, either by reclaiming
/// completed IOs or by waiting for the oldest in-flight one.
fn wait_for_free(ctx: &Context) -> Result<(), AioError> {
    let core = &ctx.core;
    let pool = &ctx.shared.pool;

    let mut reclaimed = 0;
    for index in core.handles() {
        let handle = pool.get(index);
        if handle.state() == HandleState::CompletedShared {
            reclaim(ctx, handle);
            reclaimed += 1;
        }
    }
    if reclaimed > 0 {
        trace!(reclaimed, "aio: reclaimed completed IOs");
        return Ok(());
    }

    // IOs may complete synchronously during submission.
    if core.num_staged() > 0 {
        submit_staged_in(ctx);
        if !core.idle.borrow().is_empty() {
            return Ok(());
        }
    }

    let Some(head) = core.in_flight.borrow().front().copied() else {
        return Err(AioError::NoInFlight);
    };

    let handle = pool.get(head);
    let generation = handle.generation();
    match handle.state() {
        HandleState::Submitted | HandleState::CompletedIo => {
            debug!(io = head, "aio: waiting for oldest IO to free a handle");
            wait_in(ctx, head, generation)?;
        }
        HandleState::CompletedShared => reclaim(ctx, handle),
        state => panic!("in-flight IO {} in unexpected state {}", head, state),
    }

    if core.idle.borrow().is_empty() {
        panic!("no idle IO after waiting for IO {} to terminate", head);
    }
    Ok(())
}

/// Waits until the IO at `index` moved past `ref_generation` or completed.
pub(crate) fn wait_in(ctx: &Context, index: u32, ref_generation: u64) -> Result<(), AioError> {
    let shared = &ctx.shared;
    let handle = shared.pool.get(index);
    let am_owner = handle.owner() == ctx.core.procno;
    let method = shared.method.ops();

    loop {
        let (recycled, state) = handle.was_recycled(ref_generation);
        if recycled {
            return Ok(());
        }

        match state {
            HandleState::Idle => return Ok(()),
            HandleState::HandedOut => {
                return Err(AioError::WaitInvalidState { id: index, state });
            }
            HandleState::Defined if am_owner => {
                return Err(AioError::WaitInvalidState { id: index, state });
            }
            // Waiting on our own unsubmitted IO would never finish.
            HandleState::Staged if am_owner => submit_staged_in(ctx),
            HandleState::Submitted
                if method.can_wait_one() && !handle.lock().is_synchronous() =>
            {
                method.wait_one(ctx, index, ref_generation);
            }
            HandleState::Defined
            | HandleState::Staged
            | HandleState::Submitted
            | HandleState::CompletedIo => handle.wait_state_change(ref_generation, state),
            HandleState::CompletedShared if am_owner => {
                reclaim(ctx, handle);
                return Ok(());
            }
            HandleState::CompletedShared | HandleState::CompletedLocal => return Ok(()),
        }
    }
}

pub(crate) fn wref_wait(wref: &WaitRef) -> Result<(), AioError> {
    assert!(wref.is_valid(), "waiting on an invalid wait reference");
    context::with_context(|ctx| wait_in(ctx, wref.id(), wref.generation()))
}

pub(crate) fn wref_check_done(wref: &WaitRef) -> bool {
    assert!(wref.is_valid(), "checking an invalid wait reference");
    context::with_context(|ctx| {
        let handle = ctx.shared.pool.get_by_wref(wref);
        let (recycled, state) = handle.was_recycled(wref.generation());
        if recycled {
            return true;
        }

        match state {
            HandleState::Idle => true,
            HandleState::CompletedShared => {
                if handle.owner() == ctx.core.procno {
                    reclaim(ctx, handle);
                }
                true
            }
            HandleState::CompletedLocal => true,
            _ => false,
        }
    })
}

/// Defers submission of started IOs until [`exit_batchmode`] or an
/// explicit [`submit_staged`].
///
/// While in batch mode the caller must not block on anything another
/// backend could be waiting on in turn, since that backend might be waiting
/// for one of our unsubmitted IOs.
pub fn enter_batchmode() {
    context::with_core(|core| {
        assert!(!core.in_batchmode.get(), "starting batch while batch already in progress");
        core.in_batchmode.set(true);
    })
}

pub fn exit_batchmode() {
    context::with_context(|ctx| {
        assert!(ctx.core.in_batchmode.get(), "exiting batch mode while not in batch mode");
        submit_staged_in(ctx);
        ctx.core.in_batchmode.set(false);
    })
}

pub fn have_staged() -> bool {
    context::with_core(|core| {
        debug_assert!(core.in_batchmode.get() || core.num_staged() == 0);
        core.num_staged() > 0
    })
}

/// Must be called before closing `fd`: submits staged IOs and, if the IO
/// method cannot tolerate it, waits for in-flight IOs that use `fd`.
pub fn closing_fd(fd: RawFd) -> Result<(), AioError> {
    let Some(ctx) = context::try_current() else {
        return Ok(());
    };

    submit_staged_in(&ctx);

    if !ctx.shared.method.ops().wait_on_fd_before_close() {
        return Ok(());
    }

    loop {
        let found = ctx.core.in_flight.borrow().iter().copied().find(|&index| {
            ctx.shared.pool.get(index).lock().op_data.fd() == Some(fd)
        });

        let Some(index) = found else {
            return Ok(());
        };

        debug!(io = index, fd, "aio: waiting for IO before closing fd");
        let generation = ctx.shared.pool.get(index).generation();
        wait_in(&ctx, index, generation)?;
    }
}

/// Restores a consistent state after an error escaped in the middle of
/// issuing IO: leaves batch mode, submitting whatever was staged.
pub fn error_cleanup() {
    if let Some(ctx) = context::try_current() {
        error_cleanup_in(&ctx);
    }
}

fn error_cleanup_in(ctx: &Context) {
    let core = &ctx.core;
    if core.in_batchmode.get() {
        core.in_batchmode.set(false);
        submit_staged_in(ctx);
    }
    debug_assert_eq!(core.num_staged(), 0);
}

/// End-of-transaction hook. On commit everything must already have been
/// cleaned up; on abort a leftover batch is tolerated.
pub fn at_eoxact(is_commit: bool) {
    let Some(ctx) = context::try_current() else {
        return;
    };

    if ctx.core.in_batchmode.get() {
        if is_commit {
            warn!("aio: batch mode still active at commit");
        }
        error_cleanup_in(&ctx);
    }

    if let Some(index) = ctx.core.handed_out.get() {
        warn!(io = index, is_commit, "aio: IO still handed out at transaction end");
    }
}

/// Resource owner cleanup for one of its IOs.
pub(crate) fn release_resowner(index: u32, on_error: bool) -> Result<(), AioError> {
    context::with_context(|ctx| {
        let core = &ctx.core;
        let handle = ctx.shared.pool.get(index);
        core.local(index).resowner = None;

        match handle.state() {
            HandleState::Idle => {
                return Err(AioError::ReleaseInvalidState {
                    id: index,
                    state: HandleState::Idle,
                });
            }
            HandleState::HandedOut => {
                if core.handed_out.get() == Some(index) {
                    core.handed_out.set(None);
                }
                if !on_error {
                    warn!(io = index, "aio: leaked AIO handle");
                }
                reclaim(ctx, handle);
            }
            HandleState::Defined | HandleState::Staged => {
                if !on_error {
                    warn!(io = index, "aio: AIO handle was not submitted");
                }
                submit_staged_in(ctx);
            }
            HandleState::Submitted
            | HandleState::CompletedIo
            | HandleState::CompletedShared
            | HandleState::CompletedLocal => {}
        }

        // The IO keeps running, but nobody is interested in its outcome.
        core.local(index).report_return = None;
        Ok(())
    })
}

/// Drains this backend's IO before it detaches.
pub(crate) fn shutdown(ctx: &Context) -> Result<(), AioError> {
    let core = &ctx.core;

    if core.in_batchmode.get() {
        warn!("aio: detaching in batch mode");
        error_cleanup_in(ctx);
    }

    if let Some(index) = core.handed_out.get() {
        warn!(io = index, "aio: releasing handed out IO at shutdown");
        core.handed_out.set(None);
        reclaim(ctx, ctx.shared.pool.get(index));
    }

    submit_staged_in(ctx);

    loop {
        let Some(head) = core.in_flight.borrow().front().copied() else {
            return Ok(());
        };
        let generation = ctx.shared.pool.get(head).generation();
        wait_in(ctx, head, generation)?;
    }
}
