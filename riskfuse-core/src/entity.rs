//! Unified Entity Builder
//!
//! Merges every detector's detections into one record per entity key:
//! - Keys come from [`entity_key`] (registration number > entity id > name)
//! - One detection per detector survives; the latest `valid_from` wins
//! - Identity attributes follow "first non-null wins". Later differing
//!   values are kept in `attribute_conflicts` and never applied
//!
//! Builders merge associatively, so per-detector builders can be produced
//! in parallel and folded in registry order with identical results.

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::debug;

use crate::{ConfidenceLevel, Contribution, DetectorDetection};

static PUNCTUATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());

static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Lower-case, strip punctuation, collapse whitespace
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = PUNCTUATION_REGEX.replace_all(&lowered, "");
    WHITESPACE_REGEX.replace_all(stripped.trim(), " ").into_owned()
}

/// Upper-case registration number with separators removed
pub fn normalize_registration(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Resolve the grouping key for a record.
///
/// A registration/company number wins over an explicit entity id, which
/// wins over the normalized canonical name. `None` when nothing usable is
/// present.
pub fn entity_key(
    registration_number: Option<&str>,
    entity_id: Option<&str>,
    canonical_name: Option<&str>,
) -> Option<String> {
    if let Some(reg) = registration_number.map(normalize_registration) {
        if !reg.is_empty() {
            return Some(reg);
        }
    }
    if let Some(id) = entity_id.map(str::trim) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    canonical_name.map(normalize_name).filter(|n| !n.is_empty())
}

/// One entity with every detector's latest verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub canonical_name: String,
    pub entity_type: Option<String>,
    pub country_code: Option<String>,
    /// Ordered by detector id
    pub detections: Vec<DetectorDetection>,
    /// Field name -> values that lost to the first non-null value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attribute_conflicts: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_posterior: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_confidence_level: Option<ConfidenceLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<Contribution>,
}

impl Entity {
    pub fn detection(&self, detector_id: &str) -> Option<&DetectorDetection> {
        self.detections.iter().find(|d| d.detector_id == detector_id)
    }

    /// Detector ids with a positive verdict
    pub fn fired_detectors(&self) -> impl Iterator<Item = &DetectorDetection> {
        self.detections.iter().filter(|d| d.detected)
    }
}

#[derive(Debug, Clone)]
struct EntityDraft {
    canonical_name: Option<String>,
    entity_type: Option<String>,
    country_code: Option<String>,
    detections: BTreeMap<String, DetectorDetection>,
    conflicts: BTreeMap<String, BTreeSet<String>>,
}

impl EntityDraft {
    fn empty() -> Self {
        Self {
            canonical_name: None,
            entity_type: None,
            country_code: None,
            detections: BTreeMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    fn from_detection(detection: DetectorDetection) -> Self {
        let mut draft = Self::empty();
        draft.canonical_name = detection.canonical_name.clone();
        draft.entity_type = detection.entity_type.clone();
        draft.country_code = detection.country_code.clone();
        draft.detections.insert(detection.detector_id.clone(), detection);
        draft
    }

    /// Fold `later` into `self`; `self` keeps precedence for attributes
    fn absorb(&mut self, key: &str, later: EntityDraft) {
        merge_attribute(
            key,
            "canonical_name",
            &mut self.canonical_name,
            later.canonical_name,
            &mut self.conflicts,
            |a, b| crate::normalize_name(a) == crate::normalize_name(b),
        );
        merge_attribute(
            key,
            "entity_type",
            &mut self.entity_type,
            later.entity_type,
            &mut self.conflicts,
            |a, b| a.eq_ignore_ascii_case(b),
        );
        merge_attribute(
            key,
            "country_code",
            &mut self.country_code,
            later.country_code,
            &mut self.conflicts,
            |a, b| a.eq_ignore_ascii_case(b),
        );

        for (field, values) in later.conflicts {
            self.conflicts.entry(field).or_default().extend(values);
        }
        self.prune_conflicts();

        for (detector_id, detection) in later.detections {
            match self.detections.get(&detector_id) {
                Some(existing) if !detection.supersedes(existing) => {}
                _ => {
                    self.detections.insert(detector_id, detection);
                }
            }
        }
    }

    /// A kept value never also appears as a conflict
    fn prune_conflicts(&mut self) {
        let kept = [
            ("canonical_name", self.canonical_name.clone()),
            ("entity_type", self.entity_type.clone()),
            ("country_code", self.country_code.clone()),
        ];
        for (field, value) in kept {
            if let (Some(set), Some(value)) = (self.conflicts.get_mut(field), value) {
                set.remove(&value);
            }
        }
        self.conflicts.retain(|_, values| !values.is_empty());
    }

    fn into_entity(self, entity_id: String) -> Entity {
        Entity {
            canonical_name: self.canonical_name.unwrap_or_else(|| entity_id.clone()),
            entity_id,
            entity_type: self.entity_type,
            country_code: self.country_code,
            detections: self.detections.into_values().collect(),
            attribute_conflicts: self.conflicts,
            fused_posterior: None,
            fused_confidence_level: None,
            contributions: Vec::new(),
        }
    }
}

fn merge_attribute<F>(
    key: &str,
    field: &str,
    kept: &mut Option<String>,
    incoming: Option<String>,
    conflicts: &mut BTreeMap<String, BTreeSet<String>>,
    same: F,
) where
    F: Fn(&str, &str) -> bool,
{
    let Some(incoming) = incoming else {
        return;
    };
    match kept {
        None => *kept = Some(incoming),
        Some(current) if same(current, &incoming) => {}
        Some(current) => {
            debug!(
                "Entity {}: ignoring {} '{}' (keeping '{}')",
                key, field, incoming, current
            );
            conflicts.entry(field.to_string()).or_default().insert(incoming);
        }
    }
}

/// Build statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub records: usize,
    pub entities: usize,
    pub entities_with_conflicts: usize,
}

/// Accumulates detections into unified entities
#[derive(Debug, Clone, Default)]
pub struct EntityBuilder {
    drafts: BTreeMap<String, EntityDraft>,
    records: usize,
}

impl EntityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one detection; earlier calls keep attribute precedence
    pub fn add(&mut self, detection: DetectorDetection) {
        self.records += 1;
        let key = detection.entity_id.clone();
        let incoming = EntityDraft::from_detection(detection);
        match self.drafts.get_mut(&key) {
            Some(draft) => draft.absorb(&key, incoming),
            None => {
                self.drafts.insert(key, incoming);
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = DetectorDetection>>(&mut self, detections: I) {
        for detection in detections {
            self.add(detection);
        }
    }

    /// Combine with a builder holding later input
    pub fn merge(mut self, later: EntityBuilder) -> Self {
        self.records += later.records;
        for (key, draft) in later.drafts {
            match self.drafts.get_mut(&key) {
                Some(existing) => existing.absorb(&key, draft),
                None => {
                    self.drafts.insert(key, draft);
                }
            }
        }
        self
    }

    /// Build from per-detector outputs in precedence order.
    ///
    /// Each output is folded on the rayon pool; the ordered reduce keeps
    /// the result independent of thread count.
    pub fn from_outputs(outputs: &[Vec<DetectorDetection>]) -> Self {
        outputs
            .par_iter()
            .map(|detections| {
                let mut builder = EntityBuilder::new();
                builder.extend(detections.iter().cloned());
                builder
            })
            .reduce(EntityBuilder::new, EntityBuilder::merge)
    }

    pub fn stats(&self) -> BuildStats {
        BuildStats {
            records: self.records,
            entities: self.drafts.len(),
            entities_with_conflicts: self
                .drafts
                .values()
                .filter(|d| !d.conflicts.is_empty())
                .count(),
        }
    }

    /// Entities ordered by key
    pub fn finish(self) -> Vec<Entity> {
        self.drafts
            .into_iter()
            .map(|(key, draft)| draft.into_entity(key))
            .collect()
    }
}
