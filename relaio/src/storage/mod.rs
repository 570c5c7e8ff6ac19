//! Relation storage: segment files on disk and the `smgr` IO target.
//!
//! A relation fork is split into segment files of [`RELSEG_SIZE`] blocks.
//! Each backend keeps its own cache of open segments; IO workers reopen the
//! segment from the target data of the IO they execute.

use crate::aio::{AioError, IoHandle, IoOp, IoRef, IoVec, ProcNumber, TargetData, TargetOps};
use crate::context;
use std::fmt;
use std::io;

mod md;
pub(crate) use md::Smgr;
pub(crate) use md::{MD_READV_CALLBACKS, MD_WRITEV_CALLBACKS};

/// Size of a block, the unit of relation IO.
pub const BLCKSZ: usize = 8192;

/// Blocks per segment file, 1 GiB segments.
pub const RELSEG_SIZE: u32 = (1024 * 1024 * 1024 / BLCKSZ) as u32;

pub const DEFAULTTABLESPACE_OID: Oid = 1663;
pub const GLOBALTABLESPACE_OID: Oid = 1664;

pub type Oid = u32;
pub type BlockNumber = u32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkNumber {
    Main = 0,
    Fsm,
    VisibilityMap,
    Init,
}

impl ForkNumber {
    pub fn name(&self) -> &'static str {
        match self {
            ForkNumber::Main => "main",
            ForkNumber::Fsm => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }
}

/// Physical identity of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelFileLocator {
    pub spc_oid: Oid,
    pub db_oid: Oid,
    pub rel_number: Oid,
}

impl RelFileLocator {
    /// A relation in the default tablespace.
    pub fn new(db_oid: Oid, rel_number: Oid) -> Self {
        RelFileLocator {
            spc_oid: DEFAULTTABLESPACE_OID,
            db_oid,
            rel_number,
        }
    }
}

/// A relation as seen by the storage manager. Temporary relations belong to
/// the backend that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmgrRelation {
    pub locator: RelFileLocator,
    pub backend: Option<ProcNumber>,
}

/// Path of a relation fork, relative to the data directory.
pub fn relpath(locator: &RelFileLocator, backend: Option<ProcNumber>, fork: ForkNumber) -> String {
    let rel = match backend {
        Some(procno) => format!("t{}_{}", procno, locator.rel_number),
        None => locator.rel_number.to_string(),
    };
    let fork_suffix = match fork {
        ForkNumber::Main => String::new(),
        fork => format!("_{}", fork.name()),
    };

    match locator.spc_oid {
        GLOBALTABLESPACE_OID => format!("global/{rel}{fork_suffix}"),
        DEFAULTTABLESPACE_OID => format!("base/{}/{rel}{fork_suffix}", locator.db_oid),
        spc => format!("pg_tblspc/{}/{}/{rel}{fork_suffix}", spc, locator.db_oid),
    }
}

/// Path of one segment file. The first segment has no suffix.
pub(crate) fn segpath(rel: &SmgrRelation, fork: ForkNumber, segno: u32) -> String {
    let path = relpath(&rel.locator, rel.backend, fork);
    match segno {
        0 => path,
        n => format!("{path}.{n}"),
    }
}

/// Number of blocks starting at `blocknum` that fit in one IO, that is up to
/// the end of the segment containing `blocknum`.
pub fn max_combine(blocknum: BlockNumber) -> u32 {
    RELSEG_SIZE - blocknum % RELSEG_SIZE
}

/// Byte offset of `blocknum` inside its segment file.
pub(crate) fn seg_offset(blocknum: BlockNumber) -> u64 {
    (blocknum % RELSEG_SIZE) as u64 * BLCKSZ as u64
}

/// Target data of IOs on a range of relation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmgrTargetData {
    pub locator: RelFileLocator,
    pub backend: Option<ProcNumber>,
    pub fork: ForkNumber,
    pub block_num: BlockNumber,
    pub nblocks: u32,
    /// The written blocks need not be fsynced at the next checkpoint.
    pub skip_fsync: bool,
}

impl SmgrTargetData {
    pub fn rel(&self) -> SmgrRelation {
        SmgrRelation {
            locator: self.locator,
            backend: self.backend,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.backend.is_some()
    }

    pub fn path(&self) -> String {
        relpath(&self.locator, self.backend, self.fork)
    }

    pub fn last_block(&self) -> BlockNumber {
        self.block_num + self.nblocks.saturating_sub(1)
    }
}

impl fmt::Display for SmgrTargetData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nblocks > 1 {
            write!(
                f,
                "blocks {}..{} in file \"{}\"",
                self.block_num,
                self.last_block(),
                self.path()
            )?;
        } else {
            write!(f, "block {} in file \"{}\"", self.block_num, self.path())?;
        }
        if self.skip_fsync {
            write!(f, " (skip fsync)")?;
        }
        Ok(())
    }
}

pub(crate) static SMGR_TARGET: TargetOps = TargetOps {
    name: "smgr",
    reopen: Some(smgr_reopen),
    describe_identity: smgr_describe_identity,
};

fn smgr_reopen(io: &mut IoRef<'_>) -> io::Result<()> {
    let Some(&td) = io.target_data().as_smgr() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "IO does not target a relation",
        ));
    };

    // Temporary relations only exist for their backend.
    if td.backend.is_some_and(|procno| procno != context::my_procno()) {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cannot reopen temporary relation of another backend",
        ));
    }

    let fd = context::with_smgr_mut(|smgr| smgr.fd(&td.rel(), td.fork, td.block_num, false))?;
    io.set_fd(fd);
    Ok(())
}

fn smgr_describe_identity(target: &TargetData) -> String {
    match target.as_smgr() {
        Some(td) => td.to_string(),
        None => String::from("invalid"),
    }
}

impl SmgrRelation {
    pub fn new(locator: RelFileLocator) -> Self {
        SmgrRelation {
            locator,
            backend: None,
        }
    }

    /// A temporary relation private to the calling backend.
    pub fn temp(locator: RelFileLocator) -> Self {
        SmgrRelation {
            locator,
            backend: Some(context::my_procno()),
        }
    }

    pub fn is_temp(&self) -> bool {
        self.backend.is_some()
    }

    pub fn path(&self, fork: ForkNumber) -> String {
        relpath(&self.locator, self.backend, fork)
    }

    /// Creates the first segment of `fork`. Creating an existing fork is
    /// not an error.
    pub fn create(&self, fork: ForkNumber) -> io::Result<()> {
        context::with_smgr_mut(|smgr| smgr.create(self, fork))
    }

    pub fn exists(&self, fork: ForkNumber) -> bool {
        context::with_smgr_mut(|smgr| smgr.exists(self, fork))
    }

    /// Number of blocks in `fork`.
    pub fn nblocks(&self, fork: ForkNumber) -> io::Result<BlockNumber> {
        context::with_smgr_mut(|smgr| smgr.nblocks(self, fork))
    }

    /// Writes `buf` as new block `blocknum`, creating segments as needed.
    pub fn extend(&self, fork: ForkNumber, blocknum: BlockNumber, buf: &[u8]) -> io::Result<()> {
        context::with_smgr_mut(|smgr| smgr.write_block(self, fork, blocknum, buf, true))
    }

    /// Extends `fork` with `nblocks` zeroed blocks starting at `blocknum`.
    pub fn zero_extend(
        &self,
        fork: ForkNumber,
        blocknum: BlockNumber,
        nblocks: u32,
    ) -> io::Result<()> {
        context::with_smgr_mut(|smgr| smgr.zero_extend(self, fork, blocknum, nblocks))
    }

    /// Synchronously overwrites an existing block.
    pub fn write(&self, fork: ForkNumber, blocknum: BlockNumber, buf: &[u8]) -> io::Result<()> {
        context::with_smgr_mut(|smgr| smgr.write_block(self, fork, blocknum, buf, false))
    }

    /// Synchronously reads one block, bypassing the AIO subsystem.
    pub fn read(&self, fork: ForkNumber, blocknum: BlockNumber, buf: &mut [u8]) -> io::Result<()> {
        context::with_smgr_mut(|smgr| smgr.read_block(self, fork, blocknum, buf))
    }

    /// Starts reading `buffers.len()` blocks starting at `blocknum`, one
    /// block sized iovec per block. Adjacent buffers are combined into one
    /// iovec.
    ///
    /// After combining, at most `io_max_combine_limit` iovecs may remain,
    /// otherwise this fails with [`AioError::TooManyIovecs`]. `ioh` is
    /// released on any error, for instance if the segment cannot be opened.
    ///
    /// # Safety
    ///
    /// The buffers must stay valid and untouched until the IO completed.
    pub unsafe fn start_readv(
        &self,
        ioh: IoHandle,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[IoVec],
    ) -> Result<(), AioError> {
        unsafe { md::start_rw(self, ioh, IoOp::Readv, fork, blocknum, buffers, false) }
    }

    /// Starts writing `buffers.len()` blocks starting at `blocknum`, with
    /// the same limits as [`SmgrRelation::start_readv`]. `skip_fsync` marks
    /// writes that need not be made durable, it is implied for temp
    /// relations.
    ///
    /// # Safety
    ///
    /// The buffers must stay valid and unmodified until the IO completed.
    pub unsafe fn start_writev(
        &self,
        ioh: IoHandle,
        fork: ForkNumber,
        blocknum: BlockNumber,
        buffers: &[IoVec],
        skip_fsync: bool,
    ) -> Result<(), AioError> {
        unsafe { md::start_rw(self, ioh, IoOp::Writev, fork, blocknum, buffers, skip_fsync) }
    }

    /// Closes the open segments of `fork`, waiting for IO on them first if
    /// the IO method requires it.
    pub fn close(&self, fork: ForkNumber) -> Result<(), AioError> {
        // Taken out first, waiting for IO may complete other IOs.
        let files = context::with_smgr_mut(|smgr| smgr.take_files(self, fork));
        md::close_files(files)
    }

    /// Closes and removes every segment of `fork`.
    pub fn unlink(&self, fork: ForkNumber) -> Result<(), AioError> {
        self.close(fork)?;
        context::with_smgr_mut(|smgr| smgr.unlink(self, fork))?;
        Ok(())
    }
}
