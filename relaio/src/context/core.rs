use crate::aio::{AioReturnSlot, ProcNumber, SUBMIT_BATCH_SIZE};
use crate::aio::resowner::ResourceOwnerInner;
use crate::context::ProcKind;
use crate::utils::ScopeGuard;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::ops::Range;
use std::rc::Weak;

/// Backend-local bookkeeping attached to one of our handles.
#[derive(Debug, Default)]
pub(crate) struct LocalHandleState {
    pub(crate) report_return: Option<AioReturnSlot>,
    pub(crate) resowner: Option<Weak<ResourceOwnerInner>>,
}

/// Per-backend AIO state. Only the owning thread touches it, so all fields
/// use interior mutability instead of locks.
pub(crate) struct Core {
    pub(crate) procno: ProcNumber,
    pub(crate) kind: ProcKind,

    /// First pool index owned by this backend.
    io_handle_off: u32,

    pub(crate) idle: RefCell<VecDeque<u32>>,

    /// The single handle currently handed out, if any.
    pub(crate) handed_out: Cell<Option<u32>>,

    /// Handles staged but not yet submitted, in staging order.
    pub(crate) staged: RefCell<SmallVec<[u32; SUBMIT_BATCH_SIZE]>>,

    /// Submitted handles not yet reclaimed, oldest first.
    pub(crate) in_flight: RefCell<VecDeque<u32>>,

    pub(crate) in_batchmode: Cell<bool>,

    crit_section_count: Cell<u32>,

    local: RefCell<Vec<LocalHandleState>>,
}

impl Core {
    pub(crate) fn new(procno: ProcNumber, kind: ProcKind, handles: Range<u32>) -> Self {
        let count = handles.len();
        Core {
            procno,
            kind,
            io_handle_off: handles.start,
            idle: RefCell::new(handles.collect()),
            handed_out: Cell::new(None),
            staged: RefCell::new(SmallVec::new()),
            in_flight: RefCell::new(VecDeque::with_capacity(count)),
            in_batchmode: Cell::new(false),
            crit_section_count: Cell::new(0),
            local: RefCell::new((0..count).map(|_| LocalHandleState::default()).collect()),
        }
    }

    pub(crate) fn handles(&self) -> Range<u32> {
        let count = self.local.borrow().len() as u32;
        self.io_handle_off..self.io_handle_off + count
    }

    pub(crate) fn local(&self, index: u32) -> RefMut<'_, LocalHandleState> {
        let off = (index - self.io_handle_off) as usize;
        RefMut::map(self.local.borrow_mut(), |local| &mut local[off])
    }

    pub(crate) fn num_staged(&self) -> usize {
        self.staged.borrow().len()
    }

    pub(crate) fn remove_in_flight(&self, index: u32) {
        let mut in_flight = self.in_flight.borrow_mut();
        if let Some(pos) = in_flight.iter().position(|&i| i == index) {
            in_flight.remove(pos);
        }
    }

    pub(crate) fn in_crit_section(&self) -> bool {
        self.crit_section_count.get() > 0
    }

    /// Enters a critical section that lasts until the returned guard drops.
    /// A panic inside one is not expected to be recoverable: the state it
    /// protects is shared with other backends.
    pub(crate) fn crit_section(&self) -> ScopeGuard<impl FnOnce() + '_> {
        self.crit_section_count.set(self.crit_section_count.get() + 1);
        ScopeGuard::new(move || {
            self.crit_section_count
                .set(self.crit_section_count.get() - 1)
        })
    }
}
