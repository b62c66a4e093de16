//! Validated per-detector calibration parameters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{RiskError, MAX_LR, MIN_LR};

/// Where a calibration's rates came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    /// Measured against the gold set
    #[default]
    Measured,
    /// Gold set could not support a measurement; configured defaults used
    Fallback,
}

/// Calibrated operating point of a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorCalibration {
    pub detector_id: String,
    pub version: String,
    pub true_positive_rate: f64,
    pub false_positive_rate: f64,
    pub base_confidence: f64,
    /// Gold-set size used for the measurement
    pub sample_size: usize,
    #[serde(default)]
    pub source: CalibrationSource,
}

impl DetectorCalibration {
    /// Calibration built from configured defaults when measurement is impossible
    pub fn fallback(detector_id: &str, version: &str, tpr: f64, fpr: f64, sample_size: usize) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            version: version.to_string(),
            true_positive_rate: tpr,
            false_positive_rate: fpr,
            base_confidence: if tpr + fpr > 0.0 { tpr / (tpr + fpr) } else { 0.0 },
            sample_size,
            source: CalibrationSource::Fallback,
        }
    }

    /// Reject rates outside [0, 1]
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.detector_id.trim().is_empty() {
            return Err(RiskError::config("calibration with empty detector_id"));
        }
        for (name, value) in [
            ("true_positive_rate", self.true_positive_rate),
            ("false_positive_rate", self.false_positive_rate),
            ("base_confidence", self.base_confidence),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(RiskError::config(format!(
                    "{}: {} = {} is outside [0, 1]",
                    self.detector_id, name, value
                )));
            }
        }
        Ok(())
    }

    /// LR+ = TPR / FPR, bounded to [MIN_LR, MAX_LR]
    pub fn positive_likelihood_ratio(&self) -> f64 {
        bounded_ratio(self.true_positive_rate, self.false_positive_rate)
    }

    /// LR- = FNR / TNR, bounded to [MIN_LR, MAX_LR]
    pub fn negative_likelihood_ratio(&self) -> f64 {
        bounded_ratio(1.0 - self.true_positive_rate, 1.0 - self.false_positive_rate)
    }
}

/// Ratio of two rates that never returns inf or NaN.
///
/// `x/0` is capped at `MAX_LR`; `0/0` carries no evidence and yields 1.0.
pub fn bounded_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        if numerator <= 0.0 {
            1.0
        } else {
            MAX_LR
        }
    } else {
        (numerator / denominator).clamp(MIN_LR, MAX_LR)
    }
}

/// Calibrations keyed by detector id
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    calibrations: BTreeMap<String, DetectorCalibration>,
}

impl CalibrationSet {
    /// Validate each entry and reject duplicate detector ids
    pub fn new(calibrations: Vec<DetectorCalibration>) -> Result<Self, RiskError> {
        let mut map = BTreeMap::new();
        for calibration in calibrations {
            calibration.validate()?;
            let id = calibration.detector_id.clone();
            if map.insert(id.clone(), calibration).is_some() {
                return Err(RiskError::config(format!(
                    "duplicate calibration for detector {}",
                    id
                )));
            }
        }
        Ok(Self { calibrations: map })
    }

    pub fn get(&self, detector_id: &str) -> Option<&DetectorCalibration> {
        self.calibrations.get(detector_id)
    }

    /// Every listed detector must have a calibration
    pub fn require_all<'a, I>(&self, detector_ids: I) -> Result<(), RiskError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing: Vec<&str> = detector_ids
            .into_iter()
            .filter(|id| !self.calibrations.contains_key(*id))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RiskError::config(format!(
                "no calibration for detectors: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectorCalibration> {
        self.calibrations.values()
    }

    pub fn len(&self) -> usize {
        self.calibrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calibrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibration(tpr: f64, fpr: f64) -> DetectorCalibration {
        DetectorCalibration {
            detector_id: "d1".to_string(),
            version: "1".to_string(),
            true_positive_rate: tpr,
            false_positive_rate: fpr,
            base_confidence: 0.5,
            sample_size: 10,
            source: CalibrationSource::Measured,
        }
    }

    #[test]
    fn test_likelihood_ratios() {
        let c = calibration(0.8, 0.1);
        assert!((c.positive_likelihood_ratio() - 8.0).abs() < 1e-9);
        // 0.2 / 0.9
        assert!((c.negative_likelihood_ratio() - 0.2222).abs() < 1e-4);
    }

    #[test]
    fn test_zero_fpr_capped() {
        let c = calibration(0.7, 0.0);
        assert_eq!(c.positive_likelihood_ratio(), MAX_LR);
        assert!(c.positive_likelihood_ratio().is_finite());
    }

    #[test]
    fn test_perfect_detector_lr_minus_floored() {
        let c = calibration(1.0, 0.0);
        assert_eq!(c.negative_likelihood_ratio(), MIN_LR);
        let silent = calibration(0.0, 0.0);
        assert_eq!(silent.positive_likelihood_ratio(), 1.0);
    }

    #[test]
    fn test_rates_validated() {
        assert!(calibration(0.5, 0.5).validate().is_ok());
        assert!(calibration(1.2, 0.1).validate().is_err());
        assert!(calibration(0.5, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_set_rejects_duplicates_and_reports_missing() {
        assert!(CalibrationSet::new(vec![calibration(0.8, 0.1), calibration(0.7, 0.1)]).is_err());

        let set = CalibrationSet::new(vec![calibration(0.8, 0.1)]).unwrap();
        assert!(set.require_all(["d1"]).is_ok());
        let err = set.require_all(["d1", "d2"]).unwrap_err();
        assert!(err.to_string().contains("d2"));
    }

    #[test]
    fn test_source_defaults_to_measured() {
        let json = r#"{"detector_id":"d1","version":"2","true_positive_rate":0.8,
            "false_positive_rate":0.1,"base_confidence":0.9,"sample_size":40}"#;
        let c: DetectorCalibration = serde_json::from_str(json).unwrap();
        assert_eq!(c.source, CalibrationSource::Measured);
    }
}
