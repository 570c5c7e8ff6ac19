use crate::aio::AioError;
use crate::aio::io;
use static_assertions::const_assert_eq;

/// A reference to one incarnation of an IO handle.
///
/// Stays meaningful after the handle was reclaimed and reused: waiting on a
/// stale reference returns immediately. The generation is split into two
/// 32-bit halves so the struct packs into 12 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitRef {
    aio_index: u32,
    generation_upper: u32,
    generation_lower: u32,
}

const_assert_eq!(std::mem::size_of::<WaitRef>(), 12);

impl WaitRef {
    pub const fn invalid() -> Self {
        WaitRef {
            aio_index: u32::MAX,
            generation_upper: 0,
            generation_lower: 0,
        }
    }

    pub(crate) fn new(aio_index: u32, generation: u64) -> Self {
        debug_assert!(generation != 0);
        WaitRef {
            aio_index,
            generation_upper: (generation >> 32) as u32,
            generation_lower: generation as u32,
        }
    }

    pub fn clear(&mut self) {
        *self = WaitRef::invalid();
    }

    pub fn is_valid(&self) -> bool {
        self.generation_upper != 0 || self.generation_lower != 0
    }

    /// Index of the referenced handle in the shared pool.
    pub fn id(&self) -> u32 {
        debug_assert!(self.is_valid());
        self.aio_index
    }

    pub(crate) fn generation(&self) -> u64 {
        ((self.generation_upper as u64) << 32) | self.generation_lower as u64
    }

    /// Blocks until the referenced IO completed, or returns immediately if
    /// the handle was already recycled.
    pub fn wait(&self) -> Result<(), AioError> {
        io::wref_wait(self)
    }

    /// Non-blocking check whether the referenced IO completed.
    pub fn check_done(&self) -> bool {
        io::wref_check_done(self)
    }
}

impl Default for WaitRef {
    fn default() -> Self {
        WaitRef::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_and_clear() {
        assert!(!WaitRef::invalid().is_valid());
        assert!(!WaitRef::default().is_valid());

        let mut wref = WaitRef::new(7, 1);
        assert!(wref.is_valid());
        assert_eq!(wref.id(), 7);

        wref.clear();
        assert!(!wref.is_valid());
    }

    #[test]
    fn test_generation_split() {
        let generation = (5u64 << 32) | 9;
        let wref = WaitRef::new(1, generation);
        assert_eq!(wref.generation(), generation);

        // A generation only using the upper half is still valid.
        assert!(WaitRef::new(0, 1 << 32).is_valid());
    }
}
