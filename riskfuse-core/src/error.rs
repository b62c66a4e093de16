//! Error taxonomy shared by every pipeline layer
//!
//! Record-level errors (`MalformedRecord`) are recovered and counted by the
//! caller. Everything else aborts the step that raised it.

use thiserror::Error;

/// Errors from calibration, correlation and fusion
#[derive(Debug, Error)]
pub enum RiskError {
    /// One or more registered detectors have no usable output
    #[error("No usable output for detectors: {}", detectors.join(", "))]
    MissingData { detectors: Vec<String> },

    /// A single input record failed validation
    #[error("Malformed record in {source_name} line {line}: {reason}")]
    MalformedRecord {
        source_name: String,
        line: usize,
        reason: String,
    },

    /// Registry, calibration or pipeline configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The gold set cannot support a metric for this detector
    #[error("Statistical degeneracy for {detector_id}: {reason}")]
    StatisticalDegeneracy { detector_id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Cancelled")]
    Cancelled,
}

impl RiskError {
    pub fn config(msg: impl Into<String>) -> Self {
        RiskError::Configuration(msg.into())
    }

    /// Record-level errors never abort a run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RiskError::MalformedRecord { .. } | RiskError::StatisticalDegeneracy { .. }
        )
    }
}
