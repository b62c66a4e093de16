//! Normalized detector output records

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::RiskError;

/// Validity window of a detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRange {
    pub valid_from: Option<NaiveDate>,
    pub valid_to: NaiveDate,
    /// True when any bound was filled in rather than supplied by the detector
    pub inferred: bool,
}

impl TemporalRange {
    /// Build a range, defaulting a missing end date to the open-ended sentinel
    pub fn new(valid_from: Option<NaiveDate>, valid_to: Option<NaiveDate>, inferred: bool) -> Self {
        match valid_to {
            Some(valid_to) => Self {
                valid_from,
                valid_to,
                inferred,
            },
            None => Self {
                valid_from,
                valid_to: open_ended(),
                inferred: true,
            },
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.valid_to == open_ended()
    }
}

impl Default for TemporalRange {
    fn default() -> Self {
        Self::new(None, None, true)
    }
}

/// 9999-12-31
pub fn open_ended() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

/// Parse `YYYY-MM-DD` or an RFC 3339 timestamp down to its date
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .map_err(|_| format!("unparseable date '{}'", raw))
}

/// One detector's verdict on one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorDetection {
    /// Resolved entity key
    pub entity_id: String,
    pub detector_id: String,
    /// Presence in a detector's output means detected unless the record says otherwise
    pub detected: bool,
    /// 0 - 100
    pub confidence_score: f64,
    #[serde(default)]
    pub evidence: serde_json::Value,
    pub temporal_range: TemporalRange,

    // Identity hints as supplied by the detector; never inferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

impl DetectorDetection {
    /// Validate the numeric fields that fusion relies on
    pub fn validate(&self) -> Result<(), RiskError> {
        if !self.confidence_score.is_finite() || !(0.0..=100.0).contains(&self.confidence_score) {
            return Err(RiskError::MalformedRecord {
                source_name: self.detector_id.clone(),
                line: 0,
                reason: format!(
                    "confidence_score {} outside 0-100",
                    self.confidence_score
                ),
            });
        }
        if let Some(from) = self.temporal_range.valid_from {
            if from > self.temporal_range.valid_to {
                return Err(RiskError::MalformedRecord {
                    source_name: self.detector_id.clone(),
                    line: 0,
                    reason: format!(
                        "valid_from {} after valid_to {}",
                        from, self.temporal_range.valid_to
                    ),
                });
            }
        }
        Ok(())
    }

    /// Whether this detection supersedes `other` for the same detector and entity
    pub fn supersedes(&self, other: &DetectorDetection) -> bool {
        match self.temporal_range.valid_from.cmp(&other.temporal_range.valid_from) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.confidence_score > other.confidence_score,
        }
    }
}
