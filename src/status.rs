//! Status codes shared by every subsystem.
//!
//! Parse and range errors reject a single block and let the stream continue.
//! The `*Panic` group latches the machine into panic: they indicate internal
//! inconsistencies that make further motion unsafe.

use std::fmt;

/// Non-error outcomes of the executor and forward-planner entry points.
/// These drive the interrupt sequencing and must be returned exactly:
/// `Again` means the current block has more segments, `Done` completes a
/// block, `Noop` must not load another segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Done,
    Again,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    // parse errors
    InvalidOrMalformedCommand,
    BadNumberFormat,
    GcodeCommandUnsupported,
    McodeCommandUnsupported,
    ModalGroupViolation,
    GcodeAxisIsMissing,
    ChecksumMatchFailed,
    MissingLineNumberWithChecksum,
    UnsupportedDialect,
    FeedRateNotSpecified,
    ArcSpecificationError,

    // range errors (value rejected, prior value retained)
    InputLessThanMinValue,
    InputExceedsMaxValue,
    InputValueRangeError,
    UnrecognizedName,

    // machine-state gating
    CommandRejectedByAlarm,
    CommandRejectedByShutdown,
    MachineIsBusy,

    // queue errors
    PlannerQueueFull,

    // hardware / cycle conditions
    ProbeCycleFailed,
    HomingCycleFailed,

    // runtime exceptions: all of these latch an alarm-class response
    SegmentTimeIsInfinitePanic,
    SegmentTimeIsNanPanic,
    PrepSyncErrorPanic,
    InternalErrorPanic,
}

impl Status {
    /// True for conditions that must latch the machine into panic.
    pub fn is_panic(self) -> bool {
        matches!(
            self,
            Status::SegmentTimeIsInfinitePanic
                | Status::SegmentTimeIsNanPanic
                | Status::PrepSyncErrorPanic
                | Status::InternalErrorPanic
        )
    }

    /// Stable numeric identifier reported on the wire.
    pub fn code(self) -> u16 {
        match self {
            Status::InvalidOrMalformedCommand => 100,
            Status::BadNumberFormat => 101,
            Status::GcodeCommandUnsupported => 102,
            Status::McodeCommandUnsupported => 103,
            Status::ModalGroupViolation => 104,
            Status::GcodeAxisIsMissing => 105,
            Status::ChecksumMatchFailed => 106,
            Status::MissingLineNumberWithChecksum => 107,
            Status::UnsupportedDialect => 108,
            Status::FeedRateNotSpecified => 109,
            Status::ArcSpecificationError => 110,
            Status::InputLessThanMinValue => 120,
            Status::InputExceedsMaxValue => 121,
            Status::InputValueRangeError => 122,
            Status::UnrecognizedName => 123,
            Status::CommandRejectedByAlarm => 130,
            Status::CommandRejectedByShutdown => 131,
            Status::MachineIsBusy => 132,
            Status::PlannerQueueFull => 140,
            Status::ProbeCycleFailed => 150,
            Status::HomingCycleFailed => 151,
            Status::SegmentTimeIsInfinitePanic => 200,
            Status::SegmentTimeIsNanPanic => 201,
            Status::PrepSyncErrorPanic => 202,
            Status::InternalErrorPanic => 203,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::InvalidOrMalformedCommand => "invalid or malformed command",
            Status::BadNumberFormat => "bad number format",
            Status::GcodeCommandUnsupported => "gcode command unsupported",
            Status::McodeCommandUnsupported => "mcode command unsupported",
            Status::ModalGroupViolation => "modal group violation",
            Status::GcodeAxisIsMissing => "axis word missing",
            Status::ChecksumMatchFailed => "checksum match failed",
            Status::MissingLineNumberWithChecksum => "line number missing with checksum",
            Status::UnsupportedDialect => "unsupported dialect",
            Status::FeedRateNotSpecified => "feed rate not specified",
            Status::ArcSpecificationError => "arc specification error",
            Status::InputLessThanMinValue => "input less than minimum value",
            Status::InputExceedsMaxValue => "input exceeds maximum value",
            Status::InputValueRangeError => "input value range error",
            Status::UnrecognizedName => "unrecognized name",
            Status::CommandRejectedByAlarm => "command rejected by alarm",
            Status::CommandRejectedByShutdown => "command rejected by shutdown",
            Status::MachineIsBusy => "machine is busy",
            Status::PlannerQueueFull => "planner queue full",
            Status::ProbeCycleFailed => "probe cycle failed",
            Status::HomingCycleFailed => "homing cycle failed",
            Status::SegmentTimeIsInfinitePanic => "segment time is infinite",
            Status::SegmentTimeIsNanPanic => "segment time is NaN",
            Status::PrepSyncErrorPanic => "prep buffer sync error",
            Status::InternalErrorPanic => "internal error",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_classification() {
        assert!(Status::SegmentTimeIsNanPanic.is_panic());
        assert!(Status::PrepSyncErrorPanic.is_panic());
        assert!(!Status::BadNumberFormat.is_panic());
        assert!(!Status::PlannerQueueFull.is_panic());
    }

    #[test]
    fn codes_are_unique() {
        let all = [
            Status::InvalidOrMalformedCommand,
            Status::BadNumberFormat,
            Status::GcodeCommandUnsupported,
            Status::McodeCommandUnsupported,
            Status::ModalGroupViolation,
            Status::GcodeAxisIsMissing,
            Status::ChecksumMatchFailed,
            Status::MissingLineNumberWithChecksum,
            Status::InputLessThanMinValue,
            Status::InputExceedsMaxValue,
            Status::UnrecognizedName,
            Status::CommandRejectedByAlarm,
            Status::PlannerQueueFull,
            Status::SegmentTimeIsInfinitePanic,
            Status::SegmentTimeIsNanPanic,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
