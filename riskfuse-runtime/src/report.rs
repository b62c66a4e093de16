//! Run state, run report and structured error log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use riskfuse_core::{BuildStats, RiskError};
use riskfuse_io::{DetectorReadiness, NormalizeStats};

/// Orchestrator states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    WaitForDetectors,
    Correlation,
    CrossValidation,
    BuildUnified,
    Fusion,
    Summary,
    Complete,
    Failed,
}

impl PipelineState {
    /// Every non-terminal step of a full run
    pub const STEPS: [PipelineState; 6] = [
        PipelineState::WaitForDetectors,
        PipelineState::Correlation,
        PipelineState::CrossValidation,
        PipelineState::BuildUnified,
        PipelineState::Fusion,
        PipelineState::Summary,
    ];

    /// Steps of a calibrate-only run
    pub const CALIBRATION_STEPS: [PipelineState; 3] = [
        PipelineState::WaitForDetectors,
        PipelineState::CrossValidation,
        PipelineState::Summary,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::WaitForDetectors => "WAIT_FOR_DETECTORS",
            PipelineState::Correlation => "CORRELATION",
            PipelineState::CrossValidation => "CROSS_VALIDATION",
            PipelineState::BuildUnified => "BUILD_UNIFIED",
            PipelineState::Fusion => "FUSION",
            PipelineState::Summary => "SUMMARY",
            PipelineState::Complete => "COMPLETE",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A fatal step failure
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct PipelineError {
    pub step: PipelineState,
    pub source: RiskError,
    /// Input that triggered the failure, when one can be named
    pub input: Option<PathBuf>,
}

impl PipelineError {
    pub fn new(step: PipelineState, source: impl Into<RiskError>) -> Self {
        Self {
            step,
            source: source.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Taxonomy name for the error log
    pub fn kind(&self) -> &'static str {
        match &self.source {
            RiskError::MissingData { .. } => "MissingDataError",
            RiskError::MalformedRecord { .. } => "MalformedRecordError",
            RiskError::Configuration(_) => "ConfigurationError",
            RiskError::StatisticalDegeneracy { .. } => "StatisticalDegeneracyError",
            RiskError::Io(_) => "IoError",
            RiskError::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Timing and outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: PipelineState,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub detail: String,
}

/// Everything a run did, written to `run_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PipelineState,
    pub steps: Vec<StepRecord>,
    pub readiness: Vec<DetectorReadiness>,
    /// Detector id -> line counts
    pub normalize_stats: BTreeMap<String, NormalizeStats>,
    /// Input path -> SHA-256
    pub input_fingerprints: BTreeMap<String, String>,
    pub build_stats: Option<BuildStats>,
    /// Detectors calibrated from configured defaults
    pub fallback_detectors: Vec<String>,
    /// Confidence level -> entity count
    pub level_counts: BTreeMap<String, usize>,
    pub artifacts: Vec<PathBuf>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            state: PipelineState::WaitForDetectors,
            steps: Vec::new(),
            readiness: Vec::new(),
            normalize_stats: BTreeMap::new(),
            input_fingerprints: BTreeMap::new(),
            build_stats: None,
            fallback_detectors: Vec::new(),
            level_counts: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn completed_steps(&self) -> Vec<PipelineState> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.step)
            .collect()
    }

    pub fn malformed_total(&self) -> usize {
        self.normalize_stats.values().map(|s| s.malformed).sum()
    }
}

/// Written to `error_log.json` when a run aborts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    pub run_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub failed_step: PipelineState,
    pub completed_steps: Vec<PipelineState>,
    pub error_kind: String,
    pub error: String,
    pub offending_input: Option<PathBuf>,
}

impl ErrorLog {
    pub fn from_failure(report: &RunReport, err: &PipelineError) -> Self {
        Self {
            run_id: report.run_id,
            occurred_at: Utc::now(),
            failed_step: err.step,
            completed_steps: report.completed_steps(),
            error_kind: err.kind().to_string(),
            error: err.source.to_string(),
            offending_input: err.input.clone(),
        }
    }
}
