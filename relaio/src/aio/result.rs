use crate::aio::{AioError, CallbackId, TargetData};
use crate::context;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Number of bits available to callbacks for error details.
pub const RESULT_ERROR_BITS: u32 = 23;
const ERROR_DATA_MASK: u32 = (1 << RESULT_ERROR_BITS) - 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ResultStatus {
    #[default]
    Unknown = 0,
    Ok,
    Partial,
    Warning,
    Error,
}

impl ResultStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ResultStatus::Unknown => "UNKNOWN",
            ResultStatus::Ok => "OK",
            ResultStatus::Partial => "PARTIAL",
            ResultStatus::Warning => "WARNING",
            ResultStatus::Error => "ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultStatus::Partial | ResultStatus::Error)
    }
}

/// Outcome of an IO after its completion callbacks ran.
///
/// `id` names the callback that determined the status, so the failure can
/// later be reported by that callback's `report` function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioResult {
    pub id: CallbackId,
    pub status: ResultStatus,
    error_data: u32,
    pub result: i32,
}

impl AioResult {
    pub const UNKNOWN: AioResult = AioResult {
        id: CallbackId::INVALID,
        status: ResultStatus::Unknown,
        error_data: 0,
        result: 0,
    };

    pub fn ok(result: i32) -> Self {
        AioResult {
            id: CallbackId::INVALID,
            status: ResultStatus::Ok,
            error_data: 0,
            result,
        }
    }

    pub fn new(id: CallbackId, status: ResultStatus, result: i32) -> Self {
        AioResult {
            id,
            status,
            error_data: 0,
            result,
        }
    }

    /// Attaches callback specific error details, truncated to
    /// [`RESULT_ERROR_BITS`].
    pub fn with_error_data(mut self, error_data: u32) -> Self {
        debug_assert!(error_data <= ERROR_DATA_MASK);
        self.error_data = error_data & ERROR_DATA_MASK;
        self
    }

    pub fn error_data(&self) -> u32 {
        self.error_data
    }
}

impl Default for AioResult {
    fn default() -> Self {
        AioResult::UNKNOWN
    }
}

/// What the issuer learns about a finished IO.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AioReturn {
    pub result: AioResult,
    pub target_data: TargetData,
}

/// Backend-local slot an IO writes its [`AioReturn`] into when reclaimed.
///
/// The slot is registered at acquisition and filled by whichever call ends
/// up reclaiming the handle, so the outcome survives handle reuse.
#[derive(Debug, Clone, Default)]
pub struct AioReturnSlot(Rc<Cell<AioReturn>>);

impl AioReturnSlot {
    pub fn new() -> Self {
        AioReturnSlot::default()
    }

    pub fn get(&self) -> AioReturn {
        self.0.get()
    }

    pub fn status(&self) -> ResultStatus {
        self.0.get().result.status
    }

    pub(crate) fn set(&self, ret: AioReturn) {
        self.0.set(ret);
    }

    pub(crate) fn reset(&self) {
        self.0.set(AioReturn::default());
    }
}

/// Severity at which an IO failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportLevel {
    Debug,
    Log,
    Warning,
    Error,
}

impl ReportLevel {
    /// Logs `message`, or turns it into an error at [`ReportLevel::Error`].
    pub fn emit(self, status: ResultStatus, message: String) -> Result<(), AioError> {
        match self {
            ReportLevel::Debug => debug!(status = status.name(), "{message}"),
            ReportLevel::Log => info!(status = status.name(), "{message}"),
            ReportLevel::Warning => warn!(status = status.name(), "{message}"),
            ReportLevel::Error => return Err(AioError::Report { status, message }),
        }
        Ok(())
    }
}

/// Surfaces the failure described by `result` through the report function
/// of the callback that produced it.
///
/// Successful and unknown results are ignored.
pub fn result_report(
    result: &AioResult,
    target_data: &TargetData,
    level: ReportLevel,
) -> Result<(), AioError> {
    if matches!(result.status, ResultStatus::Unknown | ResultStatus::Ok) {
        return Ok(());
    }

    let ops = context::with_shared(|shared| shared.callbacks.get(result.id));
    match ops.report {
        Some(report) => report(result, target_data, level),
        None => level.emit(
            result.status,
            format!(
                "IO failed with status {} (result {}, error data {})",
                result.status.name(),
                result.result,
                result.error_data
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_error_data_masked() {
        let res = AioResult::new(CallbackId::MD_READV, ResultStatus::Error, 0)
            .with_error_data(libc::EIO as u32);
        assert_eq!(res.error_data(), libc::EIO as u32);
        assert!(res.status.is_error());
        assert!(!ResultStatus::Warning.is_error());
    }

    #[rstest]
    #[case::debug(ReportLevel::Debug, false)]
    #[case::log(ReportLevel::Log, false)]
    #[case::warning(ReportLevel::Warning, false)]
    #[case::error(ReportLevel::Error, true)]
    fn test_emit(#[case] level: ReportLevel, #[case] is_err: bool) {
        let res = level.emit(ResultStatus::Partial, "short read".into());
        assert_eq!(res.is_err(), is_err);
    }

    #[test]
    fn test_return_slot_shared_between_clones() {
        let slot = AioReturnSlot::new();
        let other = slot.clone();
        assert_eq!(slot.status(), ResultStatus::Unknown);

        other.set(AioReturn {
            result: AioResult::ok(4),
            target_data: TargetData::Invalid,
        });
        assert_eq!(slot.get().result.result, 4);

        slot.reset();
        assert_eq!(other.status(), ResultStatus::Unknown);
    }
}
