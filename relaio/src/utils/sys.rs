use crate::aio::{IoVec, OpData};
use std::io;
use std::sync::OnceLock;

pub(crate) const CACHE_LINE_SIZE: usize = 64;

pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Last OS error of the calling thread as a raw errno, `EIO` if unknown.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

pub(crate) fn strerror(errno: i32) -> &'static str {
    nix::errno::Errno::from_raw(errno).desc()
}

/// Converts an `io::Error` into the negative errno convention used for raw
/// IO results.
pub(crate) fn neg_errno(err: &io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}

/// Executes the vectored read or write described by `op_data` with a
/// blocking syscall. Returns the number of bytes transferred, or a negative
/// errno on failure.
pub(crate) fn perform_rw(op_data: &OpData, iovecs: &[IoVec]) -> i32 {
    let (rw, is_read) = match op_data {
        OpData::Readv(rw) => (rw, true),
        OpData::Writev(rw) => (rw, false),
        OpData::Invalid => panic!("trying to execute IO with invalid op"),
    };
    debug_assert_eq!(rw.iov_length as usize, iovecs.len());

    let iov = iovecs.as_ptr().cast::<libc::iovec>();
    let iovcnt = iovecs.len() as libc::c_int;
    let offset = rw.offset as libc::off_t;

    // SAFETY: `IoVec` is `repr(transparent)` over `libc::iovec` and the
    // issuer keeps the referenced memory alive until the IO completes.
    let ret = unsafe {
        if is_read {
            libc::preadv(rw.fd, iov, iovcnt, offset)
        } else {
            libc::pwritev(rw.fd, iov, iovcnt, offset)
        }
    };

    // Transfers are capped at i32::MAX bytes when started.
    if ret < 0 { -errno() } else { ret as i32 }
}
