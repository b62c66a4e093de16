//! Hand-labeled ground truth used to calibrate detectors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{entity_key, normalize_name};

/// Analyst risk label for a gold-set entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLabel {
    Critical,
    High,
    Medium,
    Low,
    Clean,
}

impl RiskLabel {
    /// 1 for any connection, 0 for CLEAN
    pub fn binary(&self) -> u8 {
        match self {
            RiskLabel::Clean => 0,
            _ => 1,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.binary() == 1
    }
}

impl FromStr for RiskLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(RiskLabel::Critical),
            "HIGH" => Ok(RiskLabel::High),
            "MEDIUM" => Ok(RiskLabel::Medium),
            "LOW" => Ok(RiskLabel::Low),
            "CLEAN" => Ok(RiskLabel::Clean),
            other => Err(format!("unknown label '{}'", other)),
        }
    }
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLabel::Critical => "CRITICAL",
            RiskLabel::High => "HIGH",
            RiskLabel::Medium => "MEDIUM",
            RiskLabel::Low => "LOW",
            RiskLabel::Clean => "CLEAN",
        };
        f.write_str(s)
    }
}

/// How firmly the analyst stands behind a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLabel {
    Verified,
    Strong,
    Moderate,
}

impl FromStr for ConfidenceLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VERIFIED" => Ok(ConfidenceLabel::Verified),
            "STRONG" => Ok(ConfidenceLabel::Strong),
            "MODERATE" => Ok(ConfidenceLabel::Moderate),
            other => Err(format!("unknown confidence label '{}'", other)),
        }
    }
}

/// Source citations backing a label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub primary_source: String,
    pub secondary_sources: Vec<String>,
    pub justification: String,
}

/// A labeled entity from the validation corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldSetEntity {
    pub canonical_name: String,
    /// Stable key, resolved with [`entity_key`]
    pub entity_id: String,
    pub label: RiskLabel,
    pub confidence_label: ConfidenceLabel,
    pub provenance: Provenance,
}

impl GoldSetEntity {
    /// Build a gold entity, deriving `entity_id` from the name when none is given
    pub fn new(
        canonical_name: &str,
        entity_id: Option<&str>,
        label: RiskLabel,
        confidence_label: ConfidenceLabel,
        provenance: Provenance,
    ) -> Option<Self> {
        let entity_id = entity_key(None, entity_id, Some(canonical_name))?;
        Some(Self {
            canonical_name: canonical_name.trim().to_string(),
            entity_id,
            label,
            confidence_label,
            provenance,
        })
    }

    pub fn binary_label(&self) -> u8 {
        self.label.binary()
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.canonical_name)
    }
}

/// The full labeled corpus
#[derive(Debug, Clone, Default)]
pub struct GoldSet {
    entities: Vec<GoldSetEntity>,
}

impl GoldSet {
    pub fn new(entities: Vec<GoldSetEntity>) -> Self {
        Self { entities }
    }

    pub fn entities(&self) -> &[GoldSetEntity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.entities.iter().filter(|e| e.label.is_positive()).count()
    }

    pub fn negatives(&self) -> usize {
        self.len() - self.positives()
    }

    /// Both classes present, so AUC and both rates are defined
    pub fn has_both_classes(&self) -> bool {
        self.positives() > 0 && self.negatives() > 0
    }
}
