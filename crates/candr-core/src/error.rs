//! Driver error taxonomy.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced to callers of the driver.
///
/// `Cancelled` and `NoDocs` are expected batch terminators, not
/// failures; everything else aborts the current operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("device busy")]
    Busy,

    #[error("no documents loaded")]
    NoDocs,

    #[error("paper jam")]
    Jammed,

    #[error("cover open")]
    CoverOpen,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device out of memory")]
    NoMem,

    #[error("cancelled")]
    Cancelled,
}

impl From<TransportError> for ScanError {
    fn from(e: TransportError) -> Self {
        ScanError::Io(e.to_string())
    }
}

impl ScanError {
    /// Expected end-of-batch conditions a front end should not treat
    /// as failures.
    pub fn is_expected_termination(&self) -> bool {
        matches!(self, ScanError::Cancelled | ScanError::NoDocs)
    }
}
