use crate::aio::IoRef;
use crate::storage::{self, SmgrTargetData};
use std::io;

/// Kind of object an IO is performed on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetId {
    Invalid = 0,
    Smgr,
}

/// Target-specific description of what an IO operates on. Kept small and
/// `Copy` since it travels inside handles and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetData {
    #[default]
    Invalid,
    Smgr(SmgrTargetData),
}

impl TargetData {
    pub fn id(&self) -> TargetId {
        match self {
            TargetData::Invalid => TargetId::Invalid,
            TargetData::Smgr(_) => TargetId::Smgr,
        }
    }

    pub fn as_smgr(&self) -> Option<&SmgrTargetData> {
        match self {
            TargetData::Smgr(smgr) => Some(smgr),
            TargetData::Invalid => None,
        }
    }
}

/// Re-establishes the IO's file descriptor in the executing process.
pub type ReopenFn = fn(&mut IoRef<'_>) -> io::Result<()>;

pub type DescribeFn = fn(&TargetData) -> String;

#[derive(Debug)]
pub struct TargetOps {
    pub name: &'static str,
    /// `None` if IOs on this target can only run in the issuing process.
    pub reopen: Option<ReopenFn>,
    pub describe_identity: DescribeFn,
}

static INVALID_TARGET: TargetOps = TargetOps {
    name: "invalid",
    reopen: None,
    describe_identity: |_| String::from("invalid"),
};

pub(crate) fn target_ops(id: TargetId) -> &'static TargetOps {
    match id {
        TargetId::Invalid => &INVALID_TARGET,
        TargetId::Smgr => &storage::SMGR_TARGET,
    }
}

pub(crate) fn can_reopen(target: &TargetData) -> bool {
    target_ops(target.id()).reopen.is_some()
}

pub(crate) fn reopen(io: &mut IoRef<'_>) -> io::Result<()> {
    match target_ops(io.target_data().id()).reopen {
        Some(reopen) => reopen(io),
        None => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "target does not support reopen",
        )),
    }
}

/// Human readable description of the IO's target, for error messages.
pub fn describe_identity(target: &TargetData) -> String {
    (target_ops(target.id()).describe_identity)(target)
}
