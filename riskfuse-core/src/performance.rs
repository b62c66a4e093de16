//! Performance Calculator
//!
//! Scores one detector against the gold set:
//! - Confusion matrix over every gold entity (TP/FP/TN/FN)
//! - Rates, precision/recall/F1, MCC, Cohen's kappa
//! - Bounded likelihood ratios and ROC AUC
//!
//! Nothing here divides by zero: empty denominators give 0.0 for rates and
//! 1.0 / `MAX_LR` for likelihood ratios, and AUC is `None` unless the gold
//! set has both classes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    bounded_ratio, normalize_name, normalize_registration, CalibrationSource, DetectorCalibration, DetectorDetection,
    GoldSet, RiskError, RiskLabel,
};

/// Outcome of one gold entity for one detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Tp,
    Fp,
    Tn,
    Fn,
}

impl Outcome {
    pub fn classify(flagged: bool, positive: bool) -> Self {
        match (flagged, positive) {
            (true, true) => Outcome::Tp,
            (true, false) => Outcome::Fp,
            (false, false) => Outcome::Tn,
            (false, true) => Outcome::Fn,
        }
    }
}

/// Confusion matrix counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Tp => self.tp += 1,
            Outcome::Fp => self.fp += 1,
            Outcome::Tn => self.tn += 1,
            Outcome::Fn => self.fn_ += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let tp = self.tp as f64;
        let fp = self.fp as f64;
        let tn = self.tn as f64;
        let fn_ = self.fn_ as f64;
        let n = tp + fp + tn + fn_;

        let tpr = safe_div(tp, tp + fn_);
        let fpr = safe_div(fp, fp + tn);
        let tnr = safe_div(tn, tn + fp);
        let fnr = safe_div(fn_, fn_ + tp);
        let precision = safe_div(tp, tp + fp);
        let recall = tpr;
        let f1 = safe_div(2.0 * precision * recall, precision + recall);

        let mcc_denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        let mcc = safe_div(tp * tn - fp * fn_, mcc_denominator);

        let observed = safe_div(tp + tn, n);
        let expected = safe_div((tp + fp) * (tp + fn_) + (fn_ + tn) * (fp + tn), n * n);
        let kappa = if (1.0 - expected).abs() < f64::EPSILON {
            if (observed - 1.0).abs() < f64::EPSILON {
                1.0
            } else {
                0.0
            }
        } else {
            (observed - expected) / (1.0 - expected)
        };

        PerformanceMetrics {
            tpr,
            fpr,
            tnr,
            fnr,
            precision,
            recall,
            f1,
            mcc,
            kappa,
            lr_positive: bounded_ratio(tpr, fpr),
            lr_negative: bounded_ratio(fnr, tnr),
            auc: None,
        }
    }
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Confusion-matrix derived metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub tpr: f64,
    pub fpr: f64,
    pub tnr: f64,
    pub fnr: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Matthews correlation coefficient
    pub mcc: f64,
    /// Cohen's kappa
    pub kappa: f64,
    pub lr_positive: f64,
    pub lr_negative: f64,
    /// ROC AUC; `None` when the gold set lacks a class
    pub auc: Option<f64>,
}

/// Per-entity audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub canonical_name: String,
    pub label: RiskLabel,
    pub detected: bool,
    pub confidence_score: Option<f64>,
    pub outcome: Outcome,
}

/// Full evaluation of one detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub detector_id: String,
    pub version: String,
    pub sample_size: usize,
    pub confusion: ConfusionMatrix,
    pub metrics: PerformanceMetrics,
    /// Why rates could not be measured, if they could not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degeneracy: Option<String>,
    pub outcomes: Vec<EntityOutcome>,
}

impl PerformanceReport {
    /// Calibration for fusion, or `StatisticalDegeneracy` when the gold set
    /// cannot support one
    pub fn calibration(&self) -> Result<DetectorCalibration, RiskError> {
        if let Some(reason) = &self.degeneracy {
            return Err(RiskError::StatisticalDegeneracy {
                detector_id: self.detector_id.clone(),
                reason: reason.clone(),
            });
        }
        Ok(DetectorCalibration {
            detector_id: self.detector_id.clone(),
            version: self.version.clone(),
            true_positive_rate: self.metrics.tpr,
            false_positive_rate: self.metrics.fpr,
            base_confidence: self.metrics.precision,
            sample_size: self.sample_size,
            source: CalibrationSource::Measured,
        })
    }
}

/// Score one detector's detections against the gold set
pub fn evaluate_detector(
    gold: &GoldSet,
    detector_id: &str,
    version: &str,
    detections: &[DetectorDetection],
) -> PerformanceReport {
    // Latest record per entity, reachable by key or by normalized name
    let mut by_key: BTreeMap<&str, &DetectorDetection> = BTreeMap::new();
    for detection in detections.iter().filter(|d| d.detector_id == detector_id) {
        let slot = by_key.entry(detection.entity_id.as_str()).or_insert(detection);
        if detection.supersedes(*slot) {
            *slot = detection;
        }
    }
    // Explicit ids and registration numbers compare without case or separators
    let by_registration: BTreeMap<String, &DetectorDetection> = by_key
        .iter()
        .map(|(key, d)| (normalize_registration(key), *d))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    let by_name: BTreeMap<String, &DetectorDetection> = by_key
        .values()
        .filter_map(|d| d.canonical_name.as_deref().map(|n| (normalize_name(n), *d)))
        .collect();

    let mut confusion = ConfusionMatrix::default();
    let mut outcomes = Vec::with_capacity(gold.len());

    for entity in gold.entities() {
        let hit = by_key
            .get(entity.entity_id.as_str())
            .copied()
            .or_else(|| {
                by_registration
                    .get(&normalize_registration(&entity.entity_id))
                    .copied()
            })
            .or_else(|| by_name.get(&entity.normalized_name()).copied());
        let detected = hit.is_some_and(|d| d.detected);
        let outcome = Outcome::classify(detected, entity.label.is_positive());
        confusion.record(outcome);
        outcomes.push(EntityOutcome {
            entity_id: entity.entity_id.clone(),
            canonical_name: entity.canonical_name.clone(),
            label: entity.label,
            detected,
            confidence_score: hit.filter(|d| d.detected).map(|d| d.confidence_score),
            outcome,
        });
    }

    let mut metrics = confusion.metrics();
    metrics.auc = roc_auc(&outcomes);

    let degeneracy = if gold.is_empty() {
        Some("gold set is empty".to_string())
    } else if gold.positives() == 0 {
        Some("gold set has no positive entities; TPR undefined".to_string())
    } else if gold.negatives() == 0 {
        Some("gold set has no CLEAN entities; FPR undefined".to_string())
    } else {
        None
    };

    debug!(
        "Evaluated {}: tp={} fp={} tn={} fn={}",
        detector_id, confusion.tp, confusion.fp, confusion.tn, confusion.fn_
    );

    PerformanceReport {
        detector_id: detector_id.to_string(),
        version: version.to_string(),
        sample_size: gold.len(),
        confusion,
        metrics,
        degeneracy,
        outcomes,
    }
}

/// Mann-Whitney estimate of ROC AUC.
///
/// Undetected entities score below every detected one; detected entities
/// rank by confidence score. Ties count half.
pub fn roc_auc(outcomes: &[EntityOutcome]) -> Option<f64> {
    let score = |o: &EntityOutcome| -> f64 {
        match (o.detected, o.confidence_score) {
            (true, Some(s)) => 1.0 + s / 100.0,
            (true, None) => 1.0,
            (false, _) => 0.0,
        }
    };
    let positives: Vec<f64> = outcomes
        .iter()
        .filter(|o| o.label.is_positive())
        .map(score)
        .collect();
    let negatives: Vec<f64> = outcomes
        .iter()
        .filter(|o| !o.label.is_positive())
        .map(score)
        .collect();

    if positives.is_empty() || negatives.is_empty() {
        return None;
    }

    let mut wins = 0.0;
    for p in &positives {
        for n in &negatives {
            if p > n {
                wins += 1.0;
            } else if (p - n).abs() < f64::EPSILON {
                wins += 0.5;
            }
        }
    }
    Some(wins / (positives.len() * negatives.len()) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfidenceLabel, GoldSetEntity, Provenance, TemporalRange, MAX_LR};

    fn gold_entity(name: &str, label: RiskLabel) -> GoldSetEntity {
        GoldSetEntity::new(name, None, label, ConfidenceLabel::Strong, Provenance::default())
            .unwrap()
    }

    fn hit(name: &str, score: f64) -> DetectorDetection {
        DetectorDetection {
            entity_id: normalize_name(name),
            detector_id: "d1".to_string(),
            detected: true,
            confidence_score: score,
            evidence: serde_json::Value::Null,
            temporal_range: TemporalRange::default(),
            canonical_name: Some(name.to_string()),
            entity_type: None,
            country_code: None,
        }
    }

    fn sample_gold() -> GoldSet {
        GoldSet::new(vec![
            gold_entity("Alpha Ltd", RiskLabel::Critical),
            gold_entity("Bravo Ltd", RiskLabel::High),
            gold_entity("Charlie Ltd", RiskLabel::Medium),
            gold_entity("Delta Ltd", RiskLabel::Clean),
            gold_entity("Echo Ltd", RiskLabel::Clean),
        ])
    }

    #[test]
    fn test_confusion_counts_cover_gold_set() {
        let gold = sample_gold();
        let detections = vec![hit("Alpha Ltd", 90.0), hit("Bravo Ltd", 70.0), hit("Delta Ltd", 40.0)];
        let report = evaluate_detector(&gold, "d1", "1", &detections);

        assert_eq!(report.confusion.total(), gold.len());
        assert_eq!(report.confusion.tp, 2);
        assert_eq!(report.confusion.fn_, 1);
        assert_eq!(report.confusion.fp, 1);
        assert_eq!(report.confusion.tn, 1);
        assert!((report.metrics.tpr - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.metrics.fpr - 0.5).abs() < 1e-9);
        assert!((report.metrics.precision - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_within_unit_interval() {
        let gold = sample_gold();
        let cases = vec![
            vec![],
            vec![hit("Alpha Ltd", 10.0)],
            vec![hit("Delta Ltd", 10.0), hit("Echo Ltd", 20.0)],
            gold.entities().iter().map(|e| hit(&e.canonical_name, 50.0)).collect(),
        ];
        for detections in cases {
            let m = evaluate_detector(&gold, "d1", "1", &detections).metrics;
            for v in [m.tpr, m.fpr, m.precision, m.recall, m.tnr, m.fnr, m.f1] {
                assert!((0.0..=1.0).contains(&v), "metric out of range: {}", v);
            }
            assert!(m.lr_positive.is_finite() && m.lr_negative.is_finite());
        }
    }

    #[test]
    fn test_zero_fpr_capped_at_max_lr() {
        let gold = sample_gold();
        let report = evaluate_detector(&gold, "d1", "1", &[hit("Alpha Ltd", 80.0)]);
        assert_eq!(report.metrics.fpr, 0.0);
        assert_eq!(report.metrics.lr_positive, MAX_LR);
    }

    #[test]
    fn test_perfect_detector_scores() {
        let gold = sample_gold();
        let detections = vec![hit("Alpha Ltd", 90.0), hit("Bravo Ltd", 80.0), hit("Charlie Ltd", 70.0)];
        let m = evaluate_detector(&gold, "d1", "1", &detections).metrics;
        assert!((m.mcc - 1.0).abs() < 1e-9);
        assert!((m.kappa - 1.0).abs() < 1e-9);
        assert!((m.f1 - 1.0).abs() < 1e-9);
        assert_eq!(m.auc, Some(1.0));
    }

    #[test]
    fn test_auc_uses_confidence_ordering() {
        let gold = sample_gold();
        // Clean Delta outranks positive Charlie; everything else ordered correctly
        let detections = vec![
            hit("Alpha Ltd", 90.0),
            hit("Bravo Ltd", 80.0),
            hit("Charlie Ltd", 20.0),
            hit("Delta Ltd", 50.0),
        ];
        let auc = evaluate_detector(&gold, "d1", "1", &detections).metrics.auc.unwrap();
        // 6 pairs, 5 wins
        assert!((auc - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_class_gold_is_degenerate_not_error() {
        let gold = GoldSet::new(vec![
            gold_entity("Alpha Ltd", RiskLabel::High),
            gold_entity("Bravo Ltd", RiskLabel::Low),
        ]);
        let report = evaluate_detector(&gold, "d1", "1", &[hit("Alpha Ltd", 60.0)]);
        assert_eq!(report.metrics.auc, None);
        assert!(report.degeneracy.is_some());
        assert!(matches!(
            report.calibration(),
            Err(RiskError::StatisticalDegeneracy { .. })
        ));
    }

    #[test]
    fn test_match_by_name_when_keys_differ() {
        let gold = GoldSet::new(vec![
            GoldSetEntity::new(
                "Foxtrot Holdings",
                Some("GB-0001"),
                RiskLabel::High,
                ConfidenceLabel::Verified,
                Provenance::default(),
            )
            .unwrap(),
            gold_entity("Golf Ltd", RiskLabel::Clean),
        ]);
        let report = evaluate_detector(&gold, "d1", "1", &[hit("FOXTROT holdings.", 75.0)]);
        assert_eq!(report.confusion.tp, 1);
    }

    #[test]
    fn test_gold_id_matches_registration_number() {
        let gold = GoldSet::new(vec![
            GoldSetEntity::new(
                "Foxtrot Holdings",
                Some("GB-0001"),
                RiskLabel::High,
                ConfidenceLabel::Verified,
                Provenance::default(),
            )
            .unwrap(),
            gold_entity("Golf Ltd", RiskLabel::Clean),
        ]);
        // Detector keyed the record by company number under a different name
        let mut record = hit("Foxtrot Group PLC", 80.0);
        record.entity_id = crate::entity_key(Some("gb 0001"), None, Some("Foxtrot Group PLC")).unwrap();
        assert_eq!(record.entity_id, "GB0001");

        let report = evaluate_detector(&gold, "d1", "1", &[record]);
        assert_eq!(report.confusion.tp, 1);
        assert_eq!(report.confusion.fp, 0);
    }

    #[test]
    fn test_latest_record_decides_detected() {
        let gold = sample_gold();
        let mut retracted = hit("Alpha Ltd", 90.0);
        retracted.detected = false;
        retracted.temporal_range = TemporalRange::new(
            crate::parse_date("2024-01-01").ok(),
            None,
            false,
        );
        let report = evaluate_detector(&gold, "d1", "1", &[hit("Alpha Ltd", 90.0), retracted]);
        assert_eq!(report.confusion.tp, 0);
        assert_eq!(report.confusion.fn_, 3);
    }

    #[test]
    fn test_calibration_from_report() {
        let gold = sample_gold();
        let detections = vec![hit("Alpha Ltd", 90.0), hit("Bravo Ltd", 70.0), hit("Delta Ltd", 40.0)];
        let calibration = evaluate_detector(&gold, "d1", "3", &detections)
            .calibration()
            .unwrap();
        assert_eq!(calibration.version, "3");
        assert_eq!(calibration.sample_size, 5);
        assert!((calibration.base_confidence - 2.0 / 3.0).abs() < 1e-9);
    }
}
