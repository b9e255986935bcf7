//! Error types for the hwsched library

use std::io;
use thiserror::Error;

use crate::fault::FaultCause;

/// Main error type for scheduler operations
#[derive(Error, Debug)]
pub enum SchedError {
    /// Too many objects in one submission, or too many IBs in one command
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// User-generated timestamp did not advance past the last assigned one
    #[error("Timestamp {requested} does not follow last timestamp {last}")]
    RangeError {
        /// Timestamp supplied by the caller
        requested: u32,
        /// Last timestamp assigned on the context
        last: u32,
    },

    /// Backpressure, idle or timestamp wait exceeded its deadline
    #[error("Timed out")]
    TimedOut,

    /// The context was invalidated after a fault or by request
    #[error("Context {0} is invalid")]
    ContextInvalid(u32),

    /// The context was detached by its owner
    #[error("Context {0} is detached")]
    Detached(u32),

    /// No context is registered under this id
    #[error("No such context: {0}")]
    NoSuchContext(u32),

    /// Hardware queue temporarily refused the submission
    #[error("Submission rejected transiently: {0}")]
    SubmissionTransient(String),

    /// Hardware or firmware reported an execution fault
    #[error("Hardware fault: {0:?}")]
    HardwareFault(FaultCause),

    /// Allocation failed while building the submission
    #[error("Out of memory")]
    OutOfMemory,

    /// Invalid parameter or request
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SchedError {
    /// Whether the condition is recovered internally rather than surfaced to the client
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedError::SubmissionTransient(_) | SchedError::OutOfMemory)
    }
}

/// Errors reported by the external hardware interfaces
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// Queue is full or the firmware is busy; retry later
    #[error("device busy")]
    Busy,

    /// The backend could not allocate resources for the request
    #[error("no memory")]
    NoMemory,

    /// Unrecoverable firmware/hardware error
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<HwError> for SchedError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::Busy => SchedError::SubmissionTransient("device busy".to_string()),
            HwError::NoMemory => SchedError::OutOfMemory,
            HwError::Fatal(_) => SchedError::HardwareFault(FaultCause::FW_FATAL),
        }
    }
}

/// Result type for scheduler operations
pub type SchedResult<T> = std::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_error_mapping() {
        assert!(SchedError::from(HwError::Busy).is_transient());
        assert!(SchedError::from(HwError::NoMemory).is_transient());
        assert!(matches!(
            SchedError::from(HwError::Fatal("boom".into())),
            SchedError::HardwareFault(c) if c == FaultCause::FW_FATAL
        ));
    }

    #[test]
    fn test_display() {
        let err = SchedError::RangeError { requested: 3, last: 7 };
        assert_eq!(err.to_string(), "Timestamp 3 does not follow last timestamp 7");
    }
}
