use crate::aio::{Handle, ProcNumber, WaitRef};
use crate::config::AioConfig;
use std::ops::Range;

/// All IO handles of the subsystem. Handle `i` belongs to procno
/// `i / io_max_concurrency` for its whole life.
pub(crate) struct HandlePool {
    handles: Box<[Handle]>,
    per_backend: u32,
    max_handle_data: usize,
    max_iovecs: usize,
}

impl HandlePool {
    pub(crate) fn new(cfg: &AioConfig) -> Self {
        let per_backend = cfg.io_max_concurrency as u32;
        let max_iovecs = cfg.io_max_combine_limit;
        let max_handle_data = cfg.io_max_combine_limit;

        let handles = (0..cfg.num_handles() as u32)
            .map(|index| Handle::new(index, index / per_backend, max_handle_data, max_iovecs))
            .collect();

        Self {
            handles,
            per_backend,
            max_handle_data,
            max_iovecs,
        }
    }

    #[track_caller]
    pub(crate) fn get(&self, index: u32) -> &Handle {
        match self.handles.get(index as usize) {
            Some(handle) => handle,
            None => panic!(
                "IO handle {} out of range, pool has {} handles",
                index,
                self.handles.len()
            ),
        }
    }

    pub(crate) fn get_by_wref(&self, wref: &WaitRef) -> &Handle {
        self.get(wref.id())
    }

    pub(crate) fn backend_range(&self, procno: ProcNumber) -> Range<u32> {
        let start = procno * self.per_backend;
        start..start + self.per_backend
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn max_handle_data(&self) -> usize {
        self.max_handle_data
    }

    pub(crate) fn max_iovecs(&self) -> usize {
        self.max_iovecs
    }

    /// Bytes taken by handles and their out-of-line arrays.
    pub(crate) fn shmem_size(&self) -> usize {
        let per_handle = size_of::<Handle>()
            + self.max_handle_data * size_of::<u64>()
            + self.max_iovecs * size_of::<libc::iovec>();
        per_handle * self.handles.len()
    }
}
