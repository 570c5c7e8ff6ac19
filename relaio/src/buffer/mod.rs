//! Buffer pools and the buffer side of the read IO handshake.
//!
//! A buffer under IO carries `IO_IN_PROGRESS` from the moment a backend
//! decides to read it until the IO's completion callback marks it `VALID`
//! or `IO_ERROR`. Once the IO is staged, the buffer also records the IO's
//! [`WaitRef`], which is what other backends wait on.

use crate::aio::{AioError, WaitRef};
use crate::context::{self, Context};
use crate::storage::{BLCKSZ, BlockNumber, ForkNumber, SmgrRelation};
use crate::utils::sys::get_page_size;
use anyhow::anyhow;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::trace;

mod callbacks;
pub(crate) use callbacks::{LOCAL_BUFFER_READV_CALLBACKS, SHARED_BUFFER_READV_CALLBACKS};

mod read;
pub use read::{ReadBuffersOperation, start_read_buffers, wait_read_buffers};

const REFCOUNT_ONE: u32 = 1;
const REFCOUNT_MASK: u32 = (1 << 18) - 1;

bitflags! {
    /// Flag bits of a buffer's state word, above the reference count.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const TAG_VALID = 1 << 18;
        const VALID = 1 << 19;
        const IO_IN_PROGRESS = 1 << 20;
        const IO_ERROR = 1 << 21;
    }
}

/// A pinned buffer. Positive values are shared buffers, negative values are
/// buffers of the backend's local pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer(i32);

impl Buffer {
    pub const INVALID: Buffer = Buffer(0);

    fn new(kind: BufferKind, index: u32) -> Self {
        let id = index as i32 + 1;
        match kind {
            BufferKind::Shared => Buffer(id),
            BufferKind::Local => Buffer(-id),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn is_local(&self) -> bool {
        self.0 < 0
    }

    pub(crate) fn index(&self) -> u32 {
        debug_assert!(self.is_valid());
        self.0.unsigned_abs() - 1
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the block a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub rel: SmgrRelation,
    pub fork: ForkNumber,
    pub block: BlockNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    Shared,
    Local,
}

struct BufferDesc {
    /// Reference count in the low bits, [`BufferFlags`] above.
    state: AtomicU32,
    tag: Mutex<Option<BufferTag>>,
    /// IO currently reading into the buffer, once staged.
    io_wref: Mutex<WaitRef>,
    io_cv: Condvar,
}

impl BufferDesc {
    fn new() -> Self {
        BufferDesc {
            state: AtomicU32::new(0),
            tag: Mutex::new(None),
            io_wref: Mutex::new(WaitRef::invalid()),
            io_cv: Condvar::new(),
        }
    }

    fn flags(&self) -> BufferFlags {
        BufferFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn refcount(&self) -> u32 {
        self.state.load(Ordering::Acquire) & REFCOUNT_MASK
    }
}

/// Contiguous, page aligned memory backing the pages of a pool.
struct PageArena {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: pages are only accessed through raw pointers whose use is
// serialized by the buffer IO handshake and pins.
unsafe impl Send for PageArena {}
unsafe impl Sync for PageArena {}

impl PageArena {
    fn try_new(nbuffers: usize) -> Result<Self, AioError> {
        let layout = Layout::from_size_align(nbuffers * BLCKSZ, get_page_size())
            .map_err(|e| anyhow!("invalid buffer pool layout: {e}"))?;

        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| anyhow!("OOM: failed to allocate {} buffers", nbuffers))?;

        Ok(PageArena { ptr, layout })
    }

    fn page(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize + 1) * BLCKSZ <= self.layout.size());
        unsafe { self.ptr.as_ptr().add(index as usize * BLCKSZ) }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A fixed set of buffers plus the mapping from block to buffer.
pub(crate) struct BufferPool {
    kind: BufferKind,
    descs: Box<[BufferDesc]>,
    pages: PageArena,
    mapping: Mutex<HashMap<BufferTag, u32>>,
    clock_hand: AtomicUsize,
}

impl BufferPool {
    pub(crate) fn try_new(nbuffers: usize, kind: BufferKind) -> Result<Self, AioError> {
        Ok(BufferPool {
            kind,
            descs: (0..nbuffers).map(|_| BufferDesc::new()).collect(),
            pages: PageArena::try_new(nbuffers)?,
            mapping: Mutex::new(HashMap::with_capacity(nbuffers)),
            clock_hand: AtomicUsize::new(0),
        })
    }

    pub(crate) fn kind(&self) -> BufferKind {
        self.kind
    }

    pub(crate) fn len(&self) -> usize {
        self.descs.len()
    }

    pub(crate) fn buffer(&self, index: u32) -> Buffer {
        Buffer::new(self.kind, index)
    }

    pub(crate) fn page(&self, index: u32) -> *mut u8 {
        self.pages.page(index)
    }

    pub(crate) fn flags(&self, index: u32) -> BufferFlags {
        self.descs[index as usize].flags()
    }

    pub(crate) fn refcount(&self, index: u32) -> u32 {
        self.descs[index as usize].refcount()
    }

    pub(crate) fn tag(&self, index: u32) -> Option<BufferTag> {
        *self.descs[index as usize].tag.lock()
    }

    /// Pins the buffer holding `tag`, assigning it an unpinned buffer if
    /// it is not in the pool yet. Returns the buffer index and whether the
    /// block was already mapped.
    pub(crate) fn pin_block(&self, tag: BufferTag) -> Result<(u32, bool), AioError> {
        let mut mapping = self.mapping.lock();
        if let Some(&index) = mapping.get(&tag) {
            self.pin(index);
            return Ok((index, true));
        }

        let index = self.clock_sweep()?;
        let desc = &self.descs[index as usize];
        if let Some(old) = desc.tag.lock().replace(tag) {
            mapping.remove(&old);
        }
        mapping.insert(tag, index);

        trace!(buffer = %self.buffer(index), block = tag.block, "buffer: assigned");
        Ok((index, false))
    }

    /// Claims an unpinned buffer without IO, returning it pinned once with
    /// only `TAG_VALID` set.
    fn clock_sweep(&self) -> Result<u32, AioError> {
        let n = self.descs.len();
        for _ in 0..2 * n {
            let index = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
            let desc = &self.descs[index];

            let state = desc.state.load(Ordering::Acquire);
            let flags = BufferFlags::from_bits_truncate(state);
            if state & REFCOUNT_MASK != 0 || flags.contains(BufferFlags::IO_IN_PROGRESS) {
                continue;
            }

            let claimed = REFCOUNT_ONE | BufferFlags::TAG_VALID.bits();
            if desc
                .state
                .compare_exchange(state, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(index as u32);
            }
        }
        Err(AioError::NoUnpinnedBuffers(n))
    }

    pub(crate) fn pin(&self, index: u32) {
        self.descs[index as usize]
            .state
            .fetch_add(REFCOUNT_ONE, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self, index: u32) {
        let prev = self.descs[index as usize]
            .state
            .fetch_sub(REFCOUNT_ONE, Ordering::AcqRel);
        assert!(
            prev & REFCOUNT_MASK > 0,
            "unpinning unpinned buffer {}",
            self.buffer(index)
        );
    }

    /// Claims the right to read into the buffer.
    ///
    /// Returns false if the buffer turned valid meanwhile, or, when `wait`
    /// is false, if another IO is already reading it. With `wait`, IO
    /// started by someone else is waited for first.
    pub(crate) fn start_buffer_io(&self, index: u32, wait: bool) -> Result<bool, AioError> {
        let desc = &self.descs[index as usize];
        loop {
            let mut wref = desc.io_wref.lock();
            let flags = desc.flags();

            if flags.contains(BufferFlags::IO_IN_PROGRESS) {
                if !wait {
                    return Ok(false);
                }
                drop(wref);
                self.wait_io(index)?;
                continue;
            }
            if flags.contains(BufferFlags::VALID) {
                return Ok(false);
            }

            desc.state
                .fetch_or(BufferFlags::IO_IN_PROGRESS.bits(), Ordering::AcqRel);
            wref.clear();
            return Ok(true);
        }
    }

    /// Records the IO reading into the buffer and wakes backends waiting
    /// for it to be known.
    pub(crate) fn set_io_wref(&self, index: u32, io_wref: WaitRef) {
        let desc = &self.descs[index as usize];
        let mut wref = desc.io_wref.lock();
        debug_assert!(desc.flags().contains(BufferFlags::IO_IN_PROGRESS));
        *wref = io_wref;
        desc.io_cv.notify_all();
    }

    /// Ends the buffer's IO, setting `set_flags` and dropping the pin the IO
    /// held if `release_aio_pin`.
    pub(crate) fn terminate_buffer_io(
        &self,
        index: u32,
        set_flags: BufferFlags,
        release_aio_pin: bool,
    ) {
        let desc = &self.descs[index as usize];
        let mut wref = desc.io_wref.lock();

        let clear = (BufferFlags::IO_IN_PROGRESS | BufferFlags::IO_ERROR).bits();
        let mut state = desc.state.load(Ordering::Acquire);
        loop {
            let mut next = (state & !clear) | set_flags.bits();
            if release_aio_pin {
                debug_assert!(next & REFCOUNT_MASK > 0);
                next -= REFCOUNT_ONE;
            }
            match desc
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        wref.clear();
        desc.io_cv.notify_all();
    }

    /// Waits until no IO is in progress on the buffer.
    pub(crate) fn wait_io(&self, index: u32) -> Result<(), AioError> {
        let desc = &self.descs[index as usize];
        loop {
            let mut wref = desc.io_wref.lock();
            if !desc.flags().contains(BufferFlags::IO_IN_PROGRESS) {
                return Ok(());
            }

            if wref.is_valid() {
                let io = *wref;
                drop(wref);
                io.wait()?;
                continue;
            }

            // IO claimed but not staged yet.
            desc.io_cv.wait(&mut wref);
        }
    }
}

impl Context {
    pub(crate) fn buffer_pool(&self, buf: Buffer) -> &BufferPool {
        if buf.is_local() {
            &self.local_buffers
        } else {
            &self.shared.buffers
        }
    }
}

/// Drops a pin obtained through [`ReadBuffersOperation`] or a read stream.
pub fn release_buffer(buf: Buffer) {
    assert!(buf.is_valid(), "releasing invalid buffer");
    context::with_context(|ctx| ctx.buffer_pool(buf).unpin(buf.index()))
}

/// Block held by a pinned buffer.
pub fn buffer_tag(buf: Buffer) -> Option<BufferTag> {
    context::with_context(|ctx| ctx.buffer_pool(buf).tag(buf.index()))
}

/// Runs `f` on the contents of a pinned, valid buffer.
pub fn with_page<F, R>(buf: Buffer, f: F) -> R
where
    F: FnOnce(&[u8]) -> R,
{
    context::with_context(|ctx| {
        let pool = ctx.buffer_pool(buf);
        let index = buf.index();
        assert!(pool.refcount(index) > 0, "buffer {buf} is not pinned");
        assert!(
            pool.flags(index).contains(BufferFlags::VALID),
            "buffer {buf} is not valid"
        );

        // SAFETY: a valid, pinned buffer is neither evicted nor read into.
        let page = unsafe { std::slice::from_raw_parts(pool.page(index), BLCKSZ) };
        f(page)
    })
}
