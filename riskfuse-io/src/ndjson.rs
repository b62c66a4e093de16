//! Detector Output Normalizer
//!
//! Reads a detector's NDJSON stream into [`DetectorDetection`] records.
//! Each line is validated at the boundary; a malformed line is logged,
//! counted and skipped, never fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

use riskfuse_core::{entity_key, parse_date, DetectorDetection, RiskError, TemporalRange};

use crate::{IoError, MAX_ERROR_SAMPLES};

/// Raw detector record as written by detectors
#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    canonical_name: Option<String>,
    #[serde(default, alias = "company_number")]
    registration_number: Option<String>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default, alias = "country_code")]
    country_iso3: Option<String>,
    #[serde(default)]
    detected: Option<bool>,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    evidence: serde_json::Value,
    #[serde(default)]
    temporal_range: Option<RawTemporalRange>,
}

#[derive(Debug, Deserialize)]
struct RawTemporalRange {
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_to: Option<String>,
    #[serde(default)]
    inferred: bool,
}

/// Line counts for one detector's output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub lines: usize,
    pub blank: usize,
    pub parsed: usize,
    pub malformed: usize,
    /// Parsed records whose entity already appeared earlier in the stream
    pub duplicates: usize,
    /// First few malformed-line messages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_errors: Vec<String>,
}

/// A detector's normalized output
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    pub detector_id: String,
    pub detections: Vec<DetectorDetection>,
    pub stats: NormalizeStats,
}

impl DetectorOutput {
    /// Output with no parsable record is not usable
    pub fn is_usable(&self) -> bool {
        !self.detections.is_empty()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validate and convert one NDJSON line
pub fn normalize_line(detector_id: &str, line_no: usize, line: &str) -> Result<DetectorDetection, RiskError> {
    let malformed = |reason: String| RiskError::MalformedRecord {
        source_name: detector_id.to_string(),
        line: line_no,
        reason,
    };

    let raw: RawDetection = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;

    let canonical_name = non_empty(raw.canonical_name);
    let entity_id = entity_key(
        raw.registration_number.as_deref(),
        raw.entity_id.as_deref(),
        canonical_name.as_deref(),
    )
    .ok_or_else(|| malformed("no entity_id, registration number or canonical_name".to_string()))?;

    let confidence_score = raw
        .confidence_score
        .ok_or_else(|| malformed("missing confidence_score".to_string()))?;

    let temporal_range = match raw.temporal_range {
        Some(range) => {
            let from = non_empty(range.valid_from)
                .map(|d| parse_date(&d))
                .transpose()
                .map_err(malformed)?;
            let to = non_empty(range.valid_to)
                .map(|d| parse_date(&d))
                .transpose()
                .map_err(malformed)?;
            TemporalRange::new(from, to, range.inferred)
        }
        None => TemporalRange::default(),
    };

    let detection = DetectorDetection {
        entity_id,
        detector_id: detector_id.to_string(),
        detected: raw.detected.unwrap_or(true),
        confidence_score,
        evidence: raw.evidence,
        temporal_range,
        canonical_name,
        entity_type: non_empty(raw.entity_type).map(|t| t.to_lowercase()),
        country_code: non_empty(raw.country_iso3).map(|c| c.to_uppercase()),
    };

    detection.validate().map_err(|e| match e {
        RiskError::MalformedRecord { reason, .. } => malformed(reason),
        other => other,
    })?;
    Ok(detection)
}

/// Normalize a detector stream from any reader
pub fn parse_detector_output<R: BufRead>(detector_id: &str, reader: R) -> DetectorOutput {
    let mut stats = NormalizeStats::default();
    let mut detections = Vec::new();
    let mut seen = HashSet::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        stats.lines += 1;

        let result = match line {
            Ok(line) if line.trim().is_empty() => {
                stats.blank += 1;
                continue;
            }
            Ok(line) => normalize_line(detector_id, line_no, &line),
            Err(e) => Err(RiskError::MalformedRecord {
                source_name: detector_id.to_string(),
                line: line_no,
                reason: e.to_string(),
            }),
        };

        match result {
            Ok(detection) => {
                stats.parsed += 1;
                if !seen.insert(detection.entity_id.clone()) {
                    stats.duplicates += 1;
                }
                detections.push(detection);
            }
            Err(e) => {
                warn!("Skipping record: {}", e);
                stats.malformed += 1;
                if stats.sample_errors.len() < MAX_ERROR_SAMPLES {
                    stats.sample_errors.push(e.to_string());
                }
            }
        }
    }

    debug!(
        "Normalized {}: {} parsed, {} malformed, {} blank, {} duplicates",
        detector_id, stats.parsed, stats.malformed, stats.blank, stats.duplicates
    );

    DetectorOutput {
        detector_id: detector_id.to_string(),
        detections,
        stats,
    }
}

/// Read and normalize a detector output file
pub fn read_detector_output(detector_id: &str, path: &Path) -> Result<DetectorOutput, IoError> {
    let file = File::open(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_detector_output(detector_id, BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_full_record() {
        let line = r#"{"canonical_name":"Hikvision Digital Technology","entity_type":"Company",
            "country_iso3":"chn","confidence_score":87.5,"evidence":{"source":"bis"},
            "temporal_range":{"valid_from":"2019-10-09","valid_to":null,"inferred":false}}"#;
        let d = normalize_line("bis_list", 1, &line.replace('\n', "")).unwrap();

        assert_eq!(d.entity_id, "hikvision digital technology");
        assert_eq!(d.detector_id, "bis_list");
        assert!(d.detected);
        assert_eq!(d.country_code.as_deref(), Some("CHN"));
        assert_eq!(d.entity_type.as_deref(), Some("company"));
        assert!(d.temporal_range.is_open_ended());
        assert!(d.temporal_range.inferred);
        assert_eq!(d.evidence["source"], "bis");
    }

    #[test]
    fn test_registration_number_keys_record() {
        let line = r#"{"canonical_name":"Acme","company_number":"sc-0042","confidence_score":10}"#;
        let d = normalize_line("filings", 1, line).unwrap();
        assert_eq!(d.entity_id, "SC0042");
    }

    #[test]
    fn test_boundary_validation() {
        let cases = [
            r#"{"canonical_name":"Acme"}"#,
            r#"{"canonical_name":"Acme","confidence_score":140}"#,
            r#"{"confidence_score":50}"#,
            r#"{"canonical_name":"Acme","confidence_score":50,"temporal_range":{"valid_from":"soon"}}"#,
            r#"{"canonical_name":"Acme","confidence_score":"high"}"#,
            "not json",
        ];
        for (i, line) in cases.iter().enumerate() {
            let err = normalize_line("d1", i + 1, line).unwrap_err();
            assert!(matches!(err, RiskError::MalformedRecord { line, .. } if line == i + 1));
        }
    }

    #[test]
    fn test_malformed_lines_skipped_and_counted() {
        let stream = concat!(
            r#"{"entity_id":"e1","confidence_score":90}"#, "\n",
            "{broken\n",
            "\n",
            r#"{"entity_id":"e2","confidence_score":55,"detected":false}"#, "\n",
            r#"{"entity_id":"e1","confidence_score":95}"#, "\n",
        );
        let output = parse_detector_output("d1", stream.as_bytes());

        assert_eq!(output.stats.lines, 5);
        assert_eq!(output.stats.parsed, 3);
        assert_eq!(output.stats.duplicates, 1);
        assert_eq!(output.stats.malformed, 1);
        assert_eq!(output.stats.blank, 1);
        assert_eq!(output.stats.sample_errors.len(), 1);
        assert!(output.stats.sample_errors[0].contains("line 2"));
        assert!(!output.detections[1].detected);
        assert!(output.is_usable());
    }

    #[test]
    fn test_all_malformed_is_not_usable() {
        let output = parse_detector_output("d1", "x\ny\n".as_bytes());
        assert!(!output.is_usable());
        assert_eq!(output.stats.malformed, 2);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = read_detector_output("d1", Path::new("/nonexistent/d1.ndjson")).unwrap_err();
        assert!(matches!(err, IoError::Read { .. }));
    }
}
