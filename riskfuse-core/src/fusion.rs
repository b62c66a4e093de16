//! Bayesian Fusion Engine
//!
//! Folds each entity's detector verdicts into one posterior probability:
//!
//! ```text
//! O0 = p0 / (1 - p0)
//! O  = O0 * Π LR+ (fired, correlation-discounted) * Π LR- (in scope, silent)
//! p  = O / (1 + O)
//! ```
//!
//! Fired detectors are ranked by calibrated LR+, then base confidence, then
//! the detection's confidence score, then id. A detector whose agreement
//! rate with an already-counted detector exceeds the correlation threshold
//! has its LR+ pulled toward 1.0 in proportion to `1 - agreement_rate`, so
//! near-duplicate detectors are not counted as independent confirmations.
//! The strongest member of a correlated group always keeps its full LR+,
//! so a newly firing detector can never displace it.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{
    CalibrationSet, CorrelationMatrix, DetectorCalibration, DetectorDetection, Entity, RiskError,
    CRITICAL_THRESHOLD, DEFAULT_CORRELATION_THRESHOLD, DEFAULT_PRIOR, HIGH_THRESHOLD,
    LOW_THRESHOLD, MEDIUM_THRESHOLD, MINIMAL_THRESHOLD,
};

/// Bucketed posterior
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    None,
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceLevel::None => "NONE",
            ConfidenceLevel::Minimal => "MINIMAL",
            ConfidenceLevel::Low => "LOW",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Lower posterior bound of each bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub minimal: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            critical: CRITICAL_THRESHOLD,
            high: HIGH_THRESHOLD,
            medium: MEDIUM_THRESHOLD,
            low: LOW_THRESHOLD,
            minimal: MINIMAL_THRESHOLD,
        }
    }
}

impl ConfidenceThresholds {
    pub fn bucket(&self, posterior: f64) -> ConfidenceLevel {
        if posterior >= self.critical {
            ConfidenceLevel::Critical
        } else if posterior >= self.high {
            ConfidenceLevel::High
        } else if posterior >= self.medium {
            ConfidenceLevel::Medium
        } else if posterior >= self.low {
            ConfidenceLevel::Low
        } else if posterior >= self.minimal {
            ConfidenceLevel::Minimal
        } else {
            ConfidenceLevel::None
        }
    }

    /// Thresholds must be strictly decreasing inside (0, 1]
    pub fn validate(&self) -> Result<(), RiskError> {
        let ordered = [self.critical, self.high, self.medium, self.low, self.minimal];
        if ordered.iter().any(|t| !t.is_finite() || *t <= 0.0 || *t > 1.0) {
            return Err(RiskError::config("confidence thresholds must lie in (0, 1]"));
        }
        if ordered.windows(2).any(|w| w[0] <= w[1]) {
            return Err(RiskError::config(
                "confidence thresholds must be strictly decreasing from critical to minimal",
            ));
        }
        Ok(())
    }
}

/// How a correlated detector's LR+ is pulled toward 1.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountCurve {
    /// `LR^(1 - a)`, interpolates in log-odds space
    #[default]
    Geometric,
    /// `1 + (LR - 1)(1 - a)`
    Linear,
}

impl DiscountCurve {
    pub fn apply(&self, likelihood_ratio: f64, agreement_rate: f64) -> f64 {
        let weight = (1.0 - agreement_rate).clamp(0.0, 1.0);
        match self {
            DiscountCurve::Geometric => likelihood_ratio.powf(weight),
            DiscountCurve::Linear => 1.0 + (likelihood_ratio - 1.0) * weight,
        }
    }
}

/// Fusion tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Population base rate of a true positive
    pub prior: f64,
    /// Agreement rate above which fired detectors are discounted
    pub correlation_threshold: f64,
    pub discount_curve: DiscountCurve,
    pub thresholds: ConfidenceThresholds,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            prior: DEFAULT_PRIOR,
            correlation_threshold: DEFAULT_CORRELATION_THRESHOLD,
            discount_curve: DiscountCurve::default(),
            thresholds: ConfidenceThresholds::default(),
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), RiskError> {
        if !(self.prior > 0.0 && self.prior < 1.0) {
            return Err(RiskError::config(format!(
                "prior {} must lie strictly between 0 and 1",
                self.prior
            )));
        }
        if !(0.0..=1.0).contains(&self.correlation_threshold) {
            return Err(RiskError::config(format!(
                "correlation_threshold {} must lie in [0, 1]",
                self.correlation_threshold
            )));
        }
        self.thresholds.validate()
    }

    pub fn prior_odds(&self) -> f64 {
        self.prior / (1.0 - self.prior)
    }
}

/// Entities a registered detector is expected to cover.
///
/// A silent detector only counts as negative evidence for entities in its
/// scope. Restricted scopes exclude entities whose attribute is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorScope {
    pub detector_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
}

impl DetectorScope {
    pub fn unrestricted(detector_id: &str) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            countries: None,
            entity_types: None,
        }
    }

    pub fn covers(&self, entity: &Entity) -> bool {
        fn allowed(list: &Option<Vec<String>>, value: &Option<String>) -> bool {
            match (list, value) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(list), Some(value)) => list.iter().any(|v| v.eq_ignore_ascii_case(value)),
            }
        }
        allowed(&self.countries, &entity.country_code)
            && allowed(&self.entity_types, &entity.entity_type)
    }
}

/// How a detector moved the odds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    /// Fired and counted at full LR+
    Fired,
    /// Fired, but redundant with a detector counted before it
    Discounted,
    /// In scope and silent; LR- applied
    Absent,
}

/// One step of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub detector_id: String,
    pub kind: ContributionKind,
    /// Calibrated LR+ or LR-
    pub likelihood_ratio: f64,
    /// Multiplier actually applied to the odds
    pub applied_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discounted_against: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_rate: Option<f64>,
    pub odds_after: f64,
}

/// Posterior for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct FusionResult {
    pub posterior: f64,
    pub level: ConfidenceLevel,
    pub contributions: Vec<Contribution>,
}

/// Combines calibrated detector evidence per entity
#[derive(Debug, Clone)]
pub struct FusionEngine {
    config: FusionConfig,
    calibrations: CalibrationSet,
    correlation: CorrelationMatrix,
    detectors: Vec<DetectorScope>,
}

impl FusionEngine {
    /// Every registered detector needs a calibration
    pub fn new(
        config: FusionConfig,
        calibrations: CalibrationSet,
        correlation: CorrelationMatrix,
        mut detectors: Vec<DetectorScope>,
    ) -> Result<Self, RiskError> {
        config.validate()?;
        calibrations.require_all(detectors.iter().map(|d| d.detector_id.as_str()))?;
        detectors.sort_by(|a, b| a.detector_id.cmp(&b.detector_id));
        Ok(Self {
            config,
            calibrations,
            correlation,
            detectors,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    fn calibration(&self, detector_id: &str) -> Option<&DetectorCalibration> {
        self.detectors
            .iter()
            .any(|d| d.detector_id == detector_id)
            .then(|| self.calibrations.get(detector_id))
            .flatten()
    }

    /// Posterior and audit trail for one entity
    pub fn fuse(&self, entity: &Entity) -> FusionResult {
        let mut odds = self.config.prior_odds();
        let mut contributions = Vec::new();

        let mut fired: Vec<(&DetectorDetection, &DetectorCalibration)> = entity
            .fired_detectors()
            .filter_map(|d| self.calibration(&d.detector_id).map(|c| (d, c)))
            .collect();
        fired.sort_by(|(da, ca), (db, cb)| {
            cb.positive_likelihood_ratio()
                .total_cmp(&ca.positive_likelihood_ratio())
                .then(cb.base_confidence.total_cmp(&ca.base_confidence))
                .then(db.confidence_score.total_cmp(&da.confidence_score))
                .then(da.detector_id.cmp(&db.detector_id))
        });

        let mut counted: Vec<&str> = Vec::with_capacity(fired.len());
        for (detection, calibration) in &fired {
            let id = detection.detector_id.as_str();
            let lr = calibration.positive_likelihood_ratio();

            let redundant_with = counted
                .iter()
                .filter_map(|other| {
                    self.correlation
                        .agreement(id, other)
                        .filter(|a| *a > self.config.correlation_threshold)
                        .map(|a| (*other, a))
                })
                .max_by(|x, y| x.1.total_cmp(&y.1));

            let (kind, applied, against, agreement) = match redundant_with {
                Some((other, a)) => (
                    ContributionKind::Discounted,
                    self.config.discount_curve.apply(lr, a),
                    Some(other.to_string()),
                    Some(a),
                ),
                None => (ContributionKind::Fired, lr, None, None),
            };

            odds *= applied;
            counted.push(id);
            contributions.push(Contribution {
                detector_id: id.to_string(),
                kind,
                likelihood_ratio: lr,
                applied_ratio: applied,
                discounted_against: against,
                agreement_rate: agreement,
                odds_after: odds,
            });
        }

        for scope in &self.detectors {
            let id = scope.detector_id.as_str();
            if counted.contains(&id) || !scope.covers(entity) {
                continue;
            }
            let Some(calibration) = self.calibrations.get(id) else {
                continue;
            };
            let lr = calibration.negative_likelihood_ratio();
            odds *= lr;
            contributions.push(Contribution {
                detector_id: id.to_string(),
                kind: ContributionKind::Absent,
                likelihood_ratio: lr,
                applied_ratio: lr,
                discounted_against: None,
                agreement_rate: None,
                odds_after: odds,
            });
        }

        let posterior = if odds.is_finite() {
            odds / (1.0 + odds)
        } else {
            1.0
        };
        let level = self.config.thresholds.bucket(posterior);

        debug!(
            "Fused {}: posterior={:.4} level={} ({} contributions)",
            entity.entity_id,
            posterior,
            level,
            contributions.len()
        );

        FusionResult {
            posterior,
            level,
            contributions,
        }
    }

    /// Fuse every entity on the rayon pool, preserving input order
    pub fn fuse_all(&self, entities: Vec<Entity>) -> Vec<Entity> {
        entities
            .into_par_iter()
            .map(|mut entity| {
                let result = self.fuse(&entity);
                entity.fused_posterior = Some(result.posterior);
                entity.fused_confidence_level = Some(result.level);
                entity.contributions = result.contributions;
                entity
            })
            .collect()
    }
}
