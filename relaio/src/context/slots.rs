use crate::aio::{AioError, ProcNumber};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::thread::ThreadId;

/// Kind of process occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcKind {
    Backend,
    IoWorker,
}

/// Hands out process numbers to attaching threads. Regular backends get
/// slots `0..max_backends`, auxiliary processes the slots after that. The
/// procno fixes which range of the handle pool a process owns.
#[derive(Debug)]
pub(crate) struct ProcSlots {
    mapping: Mutex<SlotsMapping>,
}

impl ProcSlots {
    pub(crate) fn new(max_backends: usize, num_aux: usize) -> Self {
        Self {
            mapping: Mutex::new(SlotsMapping::new(max_backends, num_aux)),
        }
    }

    pub(crate) fn reserve(
        &self,
        thread_id: ThreadId,
        kind: ProcKind,
    ) -> Result<ProcNumber, AioError> {
        self.mapping.lock().reserve_slot(thread_id, kind)
    }

    pub(crate) fn free(&self, thread_id: &ThreadId) -> Option<ProcNumber> {
        self.mapping.lock().free_slot(thread_id)
    }

    pub(crate) fn num_attached(&self) -> usize {
        self.mapping.lock().mapping.len()
    }
}

#[derive(Debug)]
struct SlotsMapping {
    mapping: HashMap<ThreadId, ProcNumber>,
    free_backends: VecDeque<ProcNumber>,
    free_aux: VecDeque<ProcNumber>,
    max_backends: usize,
    num_aux: usize,
}

impl SlotsMapping {
    fn new(max_backends: usize, num_aux: usize) -> Self {
        let total = (max_backends + num_aux) as ProcNumber;
        Self {
            mapping: HashMap::with_capacity(total as usize),
            free_backends: (0..max_backends as ProcNumber).collect(),
            free_aux: (max_backends as ProcNumber..total).collect(),
            max_backends,
            num_aux,
        }
    }

    fn reserve_slot(
        &mut self,
        thread_id: ThreadId,
        kind: ProcKind,
    ) -> Result<ProcNumber, AioError> {
        if self.mapping.contains_key(&thread_id) {
            return Err(AioError::AlreadyAttached);
        }

        let slot = match kind {
            ProcKind::Backend => self
                .free_backends
                .pop_front()
                .ok_or(AioError::NoFreeSlot(self.max_backends))?,
            ProcKind::IoWorker => self
                .free_aux
                .pop_front()
                .ok_or(AioError::NoFreeSlot(self.num_aux))?,
        };

        self.mapping.insert(thread_id, slot);
        Ok(slot)
    }

    fn free_slot(&mut self, thread_id: &ThreadId) -> Option<ProcNumber> {
        let slot = self.mapping.remove(thread_id)?;

        if (slot as usize) < self.max_backends {
            self.free_backends.push_back(slot);
        } else {
            self.free_aux.push_back(slot);
        }

        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_free() -> anyhow::Result<()> {
        let slots = ProcSlots::new(2, 1);
        let me = std::thread::current().id();

        assert_eq!(slots.reserve(me, ProcKind::Backend)?, 0);
        assert!(matches!(
            slots.reserve(me, ProcKind::Backend),
            Err(AioError::AlreadyAttached)
        ));

        let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        assert_eq!(slots.reserve(other, ProcKind::IoWorker)?, 2);
        assert_eq!(slots.num_attached(), 2);

        assert_eq!(slots.free(&me), Some(0));
        assert_eq!(slots.free(&me), None);
        assert_eq!(slots.free(&other), Some(2));
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> anyhow::Result<()> {
        let slots = ProcSlots::new(1, 0);
        let ids: Vec<_> = (0..2)
            .map(|_| std::thread::spawn(|| std::thread::current().id()).join().unwrap())
            .collect();

        slots.reserve(ids[0], ProcKind::Backend)?;
        assert!(matches!(
            slots.reserve(ids[1], ProcKind::Backend),
            Err(AioError::NoFreeSlot(1))
        ));
        assert!(matches!(
            slots.reserve(ids[1], ProcKind::IoWorker),
            Err(AioError::NoFreeSlot(0))
        ));
        Ok(())
    }
}
