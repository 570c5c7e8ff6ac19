use crate::aio::{
    self, AioError, AioResult, CallbackId, CallbackOps, HandleFlags, IoHandle, IoOp, IoRef, IoVec,
    ProcNumber, ReportLevel, ResultStatus, TargetData,
};
use crate::storage::{
    BLCKSZ, BlockNumber, ForkNumber, RELSEG_SIZE, SmgrRelation, SmgrTargetData, max_combine,
    seg_offset, segpath,
};
use crate::utils::sys;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Per-backend cache of open segment files.
#[derive(Debug)]
pub(crate) struct Smgr {
    data_dir: PathBuf,
    procno: ProcNumber,
    files: HashMap<(SmgrRelation, ForkNumber), Vec<Option<File>>>,
}

impl Smgr {
    pub(crate) fn new(data_dir: &Path, procno: ProcNumber) -> Self {
        Smgr {
            data_dir: data_dir.to_path_buf(),
            procno,
            files: HashMap::new(),
        }
    }

    fn path(&self, rel: &SmgrRelation, fork: ForkNumber, segno: u32) -> PathBuf {
        self.data_dir.join(segpath(rel, fork, segno))
    }

    pub(crate) fn create(&mut self, rel: &SmgrRelation, fork: ForkNumber) -> io::Result<()> {
        let path = self.path(rel, fork, 0);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.open_segment(rel, fork, 0, true)?;
        debug!(procno = self.procno, path = %path.display(), "smgr: created fork");
        Ok(())
    }

    pub(crate) fn exists(&mut self, rel: &SmgrRelation, fork: ForkNumber) -> bool {
        self.open_segment(rel, fork, 0, false).is_ok()
    }

    /// Returns the open segment `segno`, opening it on first use.
    fn open_segment(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        segno: u32,
        create: bool,
    ) -> io::Result<&File> {
        let path = self.path(rel, fork, segno);
        let segments = self.files.entry((*rel, fork)).or_default();
        let idx = segno as usize;
        if segments.len() <= idx {
            segments.resize_with(idx + 1, || None);
        }

        let slot = &mut segments[idx];
        if slot.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(&path)?;
            trace!(procno = self.procno, path = %path.display(), "smgr: opened segment");
            *slot = Some(file);
        }

        slot.as_ref()
            .ok_or_else(|| io::Error::other("segment vanished after open"))
    }

    /// File descriptor of the segment holding `blocknum`.
    pub(crate) fn fd(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        create: bool,
    ) -> io::Result<RawFd> {
        let file = self.open_segment(rel, fork, blocknum / RELSEG_SIZE, create)?;
        Ok(file.as_raw_fd())
    }

    pub(crate) fn nblocks(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
    ) -> io::Result<BlockNumber> {
        let mut segno = 0;
        loop {
            let file = match self.open_segment(rel, fork, segno, false) {
                Ok(file) => file,
                // Only trailing segments may be missing.
                Err(e) if e.kind() == io::ErrorKind::NotFound && segno > 0 => {
                    return Ok(segno * RELSEG_SIZE);
                }
                Err(e) => return Err(e),
            };

            let blocks = (file.metadata()?.len() / BLCKSZ as u64) as u32;
            if blocks < RELSEG_SIZE {
                return Ok(segno * RELSEG_SIZE + blocks);
            }
            segno += 1;
        }
    }

    pub(crate) fn write_block(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buf: &[u8],
        extend: bool,
    ) -> io::Result<()> {
        assert_eq!(buf.len(), BLCKSZ, "block writes must be BLCKSZ bytes");
        let file = self.open_segment(rel, fork, blocknum / RELSEG_SIZE, extend)?;
        file.write_all_at(buf, seg_offset(blocknum))
    }

    pub(crate) fn read_block(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buf: &mut [u8],
    ) -> io::Result<()> {
        assert_eq!(buf.len(), BLCKSZ, "block reads must be BLCKSZ bytes");
        let file = self.open_segment(rel, fork, blocknum / RELSEG_SIZE, false)?;
        file.read_exact_at(buf, seg_offset(blocknum))
    }

    pub(crate) fn zero_extend(
        &mut self,
        rel: &SmgrRelation,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> io::Result<()> {
        let mut cur = blocknum;
        let end = blocknum + nblocks;

        while cur < end {
            let in_segment = max_combine(cur).min(end - cur);
            let file = self.open_segment(rel, fork, cur / RELSEG_SIZE, true)?;

            let seg_end = seg_offset(cur) + in_segment as u64 * BLCKSZ as u64;
            if file.metadata()?.len() < seg_end {
                file.set_len(seg_end)?;
            }
            cur += in_segment;
        }
        Ok(())
    }

    pub(crate) fn take_files(&mut self, rel: &SmgrRelation, fork: ForkNumber) -> Vec<File> {
        self.files
            .remove(&(*rel, fork))
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect()
    }

    pub(crate) fn unlink(&mut self, rel: &SmgrRelation, fork: ForkNumber) -> io::Result<()> {
        debug_assert!(!self.files.contains_key(&(*rel, fork)));

        for segno in 0.. {
            match fs::remove_file(self.path(rel, fork, segno)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound && segno > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Closes segment files after making sure no IO still uses them.
pub(crate) fn close_files(files: Vec<File>) -> Result<(), AioError> {
    for file in files {
        aio::closing_fd(file.as_raw_fd())?;
        drop(file);
    }
    Ok(())
}

/// Merges iovecs that are adjacent in memory.
fn combine_iovecs(buffers: &[IoVec]) -> SmallVec<[IoVec; 16]> {
    let mut iovecs: SmallVec<[IoVec; 16]> = SmallVec::new();
    for buf in buffers {
        if let Some(last) = iovecs.last_mut() {
            if last.base().wrapping_add(last.len()) == buf.base() {
                *last = IoVec::new(last.base(), last.len() + buf.len());
                continue;
            }
        }
        iovecs.push(*buf);
    }
    iovecs
}

pub(super) unsafe fn start_rw(
    rel: &SmgrRelation,
    mut ioh: IoHandle,
    op: IoOp,
    fork: ForkNumber,
    blocknum: BlockNumber,
    buffers: &[IoVec],
    skip_fsync: bool,
) -> Result<(), AioError> {
    let nblocks = buffers.len() as u32;
    assert!(
        nblocks > 0 && nblocks <= max_combine(blocknum),
        "IO on blocks {}..{} crosses a segment boundary",
        blocknum,
        blocknum + nblocks
    );
    debug_assert!(buffers.iter().all(|buf| buf.len() == BLCKSZ));

    let iovecs = combine_iovecs(buffers);
    if let Err(e) = aio::check_iovecs(&iovecs) {
        ioh.release()?;
        return Err(e);
    }

    let fd = match crate::context::with_smgr_mut(|smgr| smgr.fd(rel, fork, blocknum, false)) {
        Ok(fd) => fd,
        Err(e) => {
            ioh.release()?;
            return Err(e.into());
        }
    };

    let callbacks = match op {
        IoOp::Readv => CallbackId::MD_READV,
        IoOp::Writev => CallbackId::MD_WRITEV,
        IoOp::Invalid => panic!("starting invalid IO on relation"),
    };
    if let Err(e) = ioh.register_callbacks(callbacks, 0) {
        ioh.release()?;
        return Err(e);
    }

    ioh.set_target(TargetData::Smgr(SmgrTargetData {
        locator: rel.locator,
        backend: rel.backend,
        fork,
        block_num: blocknum,
        nblocks,
        // Temp relations are never fsynced.
        skip_fsync: skip_fsync || rel.is_temp(),
    }));
    ioh.set_flag(HandleFlags::BUFFERED);
    if rel.is_temp() {
        ioh.set_flag(HandleFlags::REFERENCES_LOCAL);
    }

    let offset = seg_offset(blocknum);
    unsafe {
        match op {
            IoOp::Readv => ioh.start_readv(fd, &iovecs, offset),
            _ => ioh.start_writev(fd, &iovecs, offset),
        }
    }
}

pub(crate) static MD_READV_CALLBACKS: CallbackOps = CallbackOps {
    name: "md_readv",
    stage: None,
    complete_shared: Some(md_readv_complete),
    complete_local: None,
    report: Some(md_readv_report),
};

pub(crate) static MD_WRITEV_CALLBACKS: CallbackOps = CallbackOps {
    name: "md_writev",
    stage: None,
    complete_shared: Some(md_writev_complete),
    complete_local: None,
    report: Some(md_writev_report),
};

#[track_caller]
fn smgr_target(io: &IoRef<'_>) -> SmgrTargetData {
    match io.target_data().as_smgr() {
        Some(td) => *td,
        None => panic!("md callback on IO {} without a relation target", io.id()),
    }
}

/// Turns a raw byte count into a block count.
///
/// Failed syscalls are ERROR with the errno as error data. Short transfers
/// are PARTIAL, or ERROR if not even one block was transferred, with the
/// number of bytes as error data.
fn distill(id: CallbackId, raw: i32, nblocks: u32) -> AioResult {
    if raw < 0 {
        return AioResult::new(id, ResultStatus::Error, raw).with_error_data(raw.unsigned_abs());
    }

    let blocks = raw as u32 / BLCKSZ as u32;
    match blocks {
        0 => AioResult::new(id, ResultStatus::Error, 0).with_error_data(raw as u32),
        n if n < nblocks => {
            AioResult::new(id, ResultStatus::Partial, n as i32).with_error_data(raw as u32)
        }
        n => AioResult::new(id, ResultStatus::Ok, n as i32),
    }
}

/// Zeroes the bytes of `iovecs` past the first `transferred` ones.
///
/// # Safety
///
/// The iovecs must point to memory reserved for the IO being completed.
unsafe fn zero_tail(iovecs: &[IoVec], transferred: usize) {
    let mut skip = transferred;
    for iov in iovecs {
        if skip >= iov.len() {
            skip -= iov.len();
            continue;
        }
        unsafe { std::ptr::write_bytes(iov.base().add(skip), 0, iov.len() - skip) };
        skip = 0;
    }
}

fn md_readv_complete(io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
    if prior.status == ResultStatus::Error {
        return prior;
    }

    let td = smgr_target(io);
    let result = distill(CallbackId::MD_READV, prior.result, td.nblocks);

    // Stale data must not be mistaken for a successful read.
    if result.status != ResultStatus::Ok && prior.result >= 0 {
        unsafe { zero_tail(io.iovecs(), prior.result as usize) };
    }

    result
}

fn md_writev_complete(io: &mut IoRef<'_>, prior: AioResult, _cb_data: u8) -> AioResult {
    if prior.status == ResultStatus::Error {
        return prior;
    }

    let td = smgr_target(io);
    distill(CallbackId::MD_WRITEV, prior.result, td.nblocks)
}

fn report(
    verb: &str,
    done: &str,
    result: &AioResult,
    target: &TargetData,
    level: ReportLevel,
) -> Result<(), AioError> {
    let Some(td) = target.as_smgr() else {
        return level.emit(result.status, format!("could not {verb} invalid target"));
    };

    let detail = if result.result < 0 {
        sys::strerror(result.error_data() as i32).to_string()
    } else {
        format!(
            "{done} only {} of {} bytes",
            result.error_data(),
            td.nblocks as usize * BLCKSZ
        )
    };

    level.emit(
        result.status,
        format!(
            "could not {verb} blocks {}..{} in file \"{}\": {detail}",
            td.block_num,
            td.last_block(),
            td.path()
        ),
    )
}

fn md_readv_report(
    result: &AioResult,
    target: &TargetData,
    level: ReportLevel,
) -> Result<(), AioError> {
    report("read", "read", result, target, level)
}

fn md_writev_report(
    result: &AioResult,
    target: &TargetData,
    level: ReportLevel,
) -> Result<(), AioError> {
    report("write", "wrote", result, target, level)
}
