use crate::aio::{AioError, io};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Tracks the IOs acquired on behalf of one scope of work, so they can be
/// cleaned up together when the scope ends or fails.
///
/// Handles acquired with an owner are remembered until reclaimed. Releasing
/// the owner releases handed-out IOs, submits unsubmitted ones and
/// disassociates the in-flight ones from their return slots.
#[derive(Debug, Clone)]
pub struct ResourceOwner {
    inner: Rc<ResourceOwnerInner>,
}

#[derive(Debug)]
pub(crate) struct ResourceOwnerInner {
    name: &'static str,
    ios: RefCell<Vec<u32>>,
}

impl ResourceOwner {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Rc::new(ResourceOwnerInner {
                name,
                ios: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn num_ios(&self) -> usize {
        self.inner.ios.borrow().len()
    }

    pub(crate) fn remember(&self, index: u32) {
        self.inner.ios.borrow_mut().push(index);
    }

    pub(crate) fn downgrade(&self) -> Weak<ResourceOwnerInner> {
        Rc::downgrade(&self.inner)
    }

    /// Releases every IO still associated with this owner, most recent
    /// first. Unless `on_error` is set, finding a handed-out or unsubmitted
    /// IO is logged as a leak.
    pub fn release(&self, on_error: bool) -> Result<(), AioError> {
        let ios = std::mem::take(&mut *self.inner.ios.borrow_mut());
        for index in ios.into_iter().rev() {
            io::release_resowner(index, on_error)?;
        }
        Ok(())
    }
}

impl ResourceOwnerInner {
    pub(crate) fn forget(&self, index: u32) {
        let mut ios = self.ios.borrow_mut();
        if let Some(pos) = ios.iter().rposition(|&i| i == index) {
            ios.remove(pos);
        }
    }
}
