//! Calibration store
//!
//! Persists validated calibrations as a JSON array. Loading rejects any
//! record with missing or out-of-range fields; statistical parameters are
//! never defaulted on read.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use riskfuse_core::{CalibrationSet, DetectorCalibration, RiskError};

use crate::{write_json_atomic, IoError};

/// File-backed calibration store
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<CalibrationSet, IoError> {
        let text = fs::read_to_string(&self.path).map_err(|source| IoError::Read {
            path: self.path.clone(),
            source,
        })?;
        let set = parse_calibrations(&text).map_err(|e| match e {
            RiskError::Configuration(msg) => {
                RiskError::config(format!("{}: {}", self.path.display(), msg))
            }
            other => other,
        })?;
        info!("Loaded {} calibrations from {}", set.len(), self.path.display());
        Ok(set)
    }

    /// Validate then write atomically
    pub fn save(&self, calibrations: &[DetectorCalibration]) -> Result<(), IoError> {
        for calibration in calibrations {
            calibration.validate()?;
        }
        write_json_atomic(&self.path, calibrations)?;
        info!(
            "Saved {} calibrations to {}",
            calibrations.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Parse and validate calibration JSON
pub fn parse_calibrations(json: &str) -> Result<CalibrationSet, RiskError> {
    let records: Vec<DetectorCalibration> = serde_json::from_str(json)
        .map_err(|e| RiskError::config(format!("invalid calibration file: {}", e)))?;
    CalibrationSet::new(records)
}
