use crate::aio::{AioResult, CallbackId, MAX_CALLBACKS, TargetData, TargetId, WaitRef};
use crate::aio::Shared;
use crate::utils::sys::CACHE_LINE_SIZE;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::trace;

/// Index of a backend or auxiliary process (IO worker) slot.
pub type ProcNumber = u32;

/// Lifecycle of an IO handle.
///
/// ```text
/// IDLE -> HANDED_OUT -> DEFINED -> STAGED -> SUBMITTED -> COMPLETED_IO
///   ^         |                       \______________________/ |
///   |         +--(release)--> IDLE          (synchronous)      v
///   +------------- COMPLETED_LOCAL <------------------ COMPLETED_SHARED
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleState {
    Idle = 0,
    HandedOut,
    Defined,
    Staged,
    Submitted,
    CompletedIo,
    CompletedShared,
    CompletedLocal,
}

impl HandleState {
    pub fn name(&self) -> &'static str {
        match self {
            HandleState::Idle => "IDLE",
            HandleState::HandedOut => "HANDED_OUT",
            HandleState::Defined => "DEFINED",
            HandleState::Staged => "STAGED",
            HandleState::Submitted => "SUBMITTED",
            HandleState::CompletedIo => "COMPLETED_IO",
            HandleState::CompletedShared => "COMPLETED_SHARED",
            HandleState::CompletedLocal => "COMPLETED_LOCAL",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Idle,
            1 => HandleState::HandedOut,
            2 => HandleState::Defined,
            3 => HandleState::Staged,
            4 => HandleState::Submitted,
            5 => HandleState::CompletedIo,
            6 => HandleState::CompletedShared,
            7 => HandleState::CompletedLocal,
            _ => unreachable!("invalid handle state {v}"),
        }
    }

    pub(crate) fn can_transition_to(self, next: HandleState) -> bool {
        use HandleState::*;

        matches!(
            (self, next),
            (Idle, HandedOut)
                | (HandedOut, Idle)
                | (HandedOut, Defined)
                | (Defined, Staged)
                | (Staged, Submitted)
                | (Staged, CompletedIo)
                | (Submitted, CompletedIo)
                | (CompletedIo, CompletedShared)
                | (CompletedShared, CompletedLocal)
                | (CompletedLocal, Idle)
        )
    }

    /// States in which the IO may still be executing.
    pub(crate) fn is_in_flight(self) -> bool {
        matches!(
            self,
            HandleState::Defined
                | HandleState::Staged
                | HandleState::Submitted
                | HandleState::CompletedIo
        )
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Invalid,
    Readv,
    Writev,
}

impl IoOp {
    pub fn name(&self) -> &'static str {
        match self {
            IoOp::Invalid => "invalid",
            IoOp::Readv => "readv",
            IoOp::Writev => "writev",
        }
    }
}

/// Arguments of a positioned vectored read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwOpData {
    pub fd: RawFd,
    pub iov_length: u16,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpData {
    #[default]
    Invalid,
    Readv(RwOpData),
    Writev(RwOpData),
}

impl OpData {
    pub fn op(&self) -> IoOp {
        match self {
            OpData::Invalid => IoOp::Invalid,
            OpData::Readv(_) => IoOp::Readv,
            OpData::Writev(_) => IoOp::Writev,
        }
    }

    pub fn rw(&self) -> Option<&RwOpData> {
        match self {
            OpData::Readv(rw) | OpData::Writev(rw) => Some(rw),
            OpData::Invalid => None,
        }
    }

    pub(crate) fn rw_mut(&mut self) -> Option<&mut RwOpData> {
        match self {
            OpData::Readv(rw) | OpData::Writev(rw) => Some(rw),
            OpData::Invalid => None,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.rw().map(|rw| rw.fd)
    }
}

/// A single scatter/gather element, layout compatible with `struct iovec`.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct IoVec(libc::iovec);

// SAFETY: an IoVec is a plain pointer/length pair. Whoever starts an IO
// guarantees the memory stays valid and unaliased until the IO completes,
// whichever thread ends up executing it.
unsafe impl Send for IoVec {}
unsafe impl Sync for IoVec {}

impl IoVec {
    pub const EMPTY: IoVec = IoVec(libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    });

    pub fn new(base: *mut u8, len: usize) -> Self {
        IoVec(libc::iovec {
            iov_base: base.cast(),
            iov_len: len,
        })
    }

    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        IoVec::new(buf.as_mut_ptr(), buf.len())
    }

    pub fn base(&self) -> *mut u8 {
        self.0.iov_base.cast()
    }

    pub fn len(&self) -> usize {
        self.0.iov_len
    }

    pub fn is_empty(&self) -> bool {
        self.0.iov_len == 0
    }
}

impl fmt::Debug for IoVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoVec")
            .field("base", &self.0.iov_base)
            .field("len", &self.0.iov_len)
            .finish()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandleFlags: u8 {
        /// Execute the IO synchronously in the issuing backend.
        const SYNCHRONOUS = 1 << 0;
        /// The IO references backend-local memory and can only complete
        /// in the issuing backend.
        const REFERENCES_LOCAL = 1 << 1;
        /// The IO goes through the kernel page cache.
        const BUFFERED = 1 << 2;
    }
}

/// Everything about an IO that is not its state or generation.
///
/// Protected by the handle's data lock. The owner writes it between
/// acquisition and staging, the executor and completion callbacks access it
/// while the IO is in flight, and the owner resets it on reclaim.
#[derive(Debug)]
pub struct HandleData {
    pub(crate) op_data: OpData,
    pub(crate) target_data: TargetData,
    pub(crate) flags: HandleFlags,
    pub(crate) num_callbacks: u8,
    pub(crate) callbacks: [CallbackId; MAX_CALLBACKS],
    pub(crate) callback_data: [u8; MAX_CALLBACKS],
    pub(crate) handle_data: Box<[u64]>,
    pub(crate) handle_data_len: u8,
    pub(crate) iovecs: Box<[IoVec]>,
    /// Raw result: bytes transferred or a negative errno.
    pub(crate) result: i32,
    pub(crate) distilled_result: AioResult,
    /// Set when the IO bypassed the method and ran in the issuer.
    pub(crate) executed_synchronously: bool,
}

impl HandleData {
    pub(crate) fn new(max_handle_data: usize, max_iovecs: usize) -> Self {
        HandleData {
            op_data: OpData::Invalid,
            target_data: TargetData::Invalid,
            flags: HandleFlags::empty(),
            num_callbacks: 0,
            callbacks: [CallbackId::INVALID; MAX_CALLBACKS],
            callback_data: [0; MAX_CALLBACKS],
            handle_data: vec![0; max_handle_data].into_boxed_slice(),
            handle_data_len: 0,
            iovecs: vec![IoVec::EMPTY; max_iovecs].into_boxed_slice(),
            result: 0,
            distilled_result: AioResult::UNKNOWN,
            executed_synchronously: false,
        }
    }

    pub fn op(&self) -> IoOp {
        self.op_data.op()
    }

    pub fn op_data(&self) -> &OpData {
        &self.op_data
    }

    pub fn target_id(&self) -> TargetId {
        self.target_data.id()
    }

    pub fn target_data(&self) -> &TargetData {
        &self.target_data
    }

    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    pub fn handle_data(&self) -> &[u64] {
        &self.handle_data[..self.handle_data_len as usize]
    }

    /// The iovecs the IO was started with.
    pub fn iovecs(&self) -> &[IoVec] {
        let len = self.op_data.rw().map_or(0, |rw| rw.iov_length as usize);
        &self.iovecs[..len]
    }

    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn distilled_result(&self) -> AioResult {
        self.distilled_result
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        self.executed_synchronously || self.flags.contains(HandleFlags::SYNCHRONOUS)
    }

    pub(crate) fn reset(&mut self) {
        self.op_data = OpData::Invalid;
        self.target_data = TargetData::Invalid;
        self.flags = HandleFlags::empty();
        self.num_callbacks = 0;
        self.callbacks.fill(CallbackId::INVALID);
        self.callback_data.fill(0);
        self.handle_data_len = 0;
        self.result = 0;
        self.distilled_result = AioResult::UNKNOWN;
        self.executed_synchronously = false;
    }
}

/// An IO handle living in the shared pool.
///
/// `state` and `generation` are read without locks by waiters on other
/// backends, everything else sits behind `data`. State changes at or after
/// submission are published under `cv_lock` so a waiter checking the state
/// under the same lock cannot miss the wakeup.
#[repr(align(64))]
pub(crate) struct Handle {
    index: u32,
    owner_procno: ProcNumber,
    state: AtomicU8,
    generation: AtomicU64,
    data: Mutex<HandleData>,
    cv_lock: Mutex<()>,
    cv: Condvar,
}

static_assertions::const_assert!(std::mem::align_of::<Handle>() == CACHE_LINE_SIZE);

impl Handle {
    pub(crate) fn new(
        index: u32,
        owner_procno: ProcNumber,
        max_handle_data: usize,
        max_iovecs: usize,
    ) -> Self {
        Handle {
            index,
            owner_procno,
            state: AtomicU8::new(HandleState::Idle as u8),
            generation: AtomicU64::new(1),
            data: Mutex::new(HandleData::new(max_handle_data, max_iovecs)),
            cv_lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn owner(&self) -> ProcNumber {
        self.owner_procno
    }

    pub(crate) fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleData> {
        self.data.lock()
    }

    pub(crate) fn wref(&self) -> WaitRef {
        WaitRef::new(self.index, self.generation())
    }

    /// Starts a new incarnation of the handle. Only the owner calls this,
    /// while the handle is idle.
    pub(crate) fn bump_generation(&self) {
        debug_assert_eq!(self.state(), HandleState::Idle);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Moves the handle to `next`, panicking on an illegal transition.
    pub(crate) fn update_state(&self, next: HandleState) {
        let prev = self.state();
        assert!(
            prev.can_transition_to(next),
            "AIO handle {}: illegal state transition {} -> {}",
            self.index,
            prev,
            next
        );

        trace!(
            io = self.index,
            generation = self.generation(),
            from = prev.name(),
            to = next.name(),
            "aio: updating state"
        );

        if next >= HandleState::Submitted || next == HandleState::Idle {
            {
                let _guard = self.cv_lock.lock();
                self.state.store(next as u8, Ordering::Release);
            }
            self.cv.notify_all();
        } else {
            self.state.store(next as u8, Ordering::Release);
        }
    }

    /// Returns whether the handle moved on from `ref_generation`, along with
    /// the state observed. The state is read first so that a state belonging
    /// to a later incarnation is always paired with a mismatching generation.
    pub(crate) fn was_recycled(&self, ref_generation: u64) -> (bool, HandleState) {
        let state = self.state();
        let generation = self.generation();
        (generation != ref_generation, state)
    }

    /// Blocks until the handle leaves `observed` or is recycled.
    pub(crate) fn wait_state_change(&self, ref_generation: u64, observed: HandleState) {
        let mut guard = self.cv_lock.lock();
        loop {
            let (recycled, state) = self.was_recycled(ref_generation);
            if recycled || state != observed {
                return;
            }
            self.cv.wait(&mut guard);
        }
    }
}

/// View of an in-flight IO handed to callbacks and targets.
pub struct IoRef<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) index: u32,
    pub(crate) owner: ProcNumber,
    pub(crate) generation: u64,
    pub(crate) data: &'a mut HandleData,
}

impl<'a> IoRef<'a> {
    pub(crate) fn new(shared: &'a Shared, handle: &Handle, data: &'a mut HandleData) -> Self {
        IoRef {
            shared,
            index: handle.index(),
            owner: handle.owner(),
            generation: handle.generation(),
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.index
    }

    pub fn owner(&self) -> ProcNumber {
        self.owner
    }

    pub fn wref(&self) -> WaitRef {
        WaitRef::new(self.index, self.generation)
    }

    pub fn op(&self) -> IoOp {
        self.data.op()
    }

    pub fn op_data(&self) -> &OpData {
        self.data.op_data()
    }

    pub fn target_data(&self) -> &TargetData {
        self.data.target_data()
    }

    pub fn flags(&self) -> HandleFlags {
        self.data.flags()
    }

    pub fn handle_data(&self) -> &[u64] {
        self.data.handle_data()
    }

    pub fn iovecs(&self) -> &[IoVec] {
        self.data.iovecs()
    }

    pub fn result(&self) -> i32 {
        self.data.result()
    }

    pub(crate) fn shared(&self) -> &'a Shared {
        self.shared
    }

    /// Points the IO at a file descriptor valid in the executing process.
    pub(crate) fn set_fd(&mut self, fd: RawFd) {
        if let Some(rw) = self.data.op_data.rw_mut() {
            rw.fd = fd;
        }
    }

    /// Overrides the raw result before completion callbacks run.
    #[cfg(any(test, feature = "injection-points"))]
    pub fn set_result(&mut self, result: i32) {
        self.data.result = result;
    }
}

impl fmt::Debug for IoRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRef")
            .field("id", &self.index)
            .field("owner", &self.owner)
            .field("op", &self.data.op())
            .field("result", &self.data.result)
            .finish()
    }
}
