//! Correlation Analyzer
//!
//! Pairwise agreement between detectors over the whole entity corpus.
//! An entity missing from a detector's output counts as "not detected", so
//! two detectors that both ignore an entity agree on it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::DetectorDetection;

/// Agreement between one unordered pair of detectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub detector_a: String,
    pub detector_b: String,
    pub agree_count: usize,
    pub disagree_count: usize,
    pub agreement_rate: f64,
}

/// Symmetric pairwise agreement table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationMatrix {
    edges: Vec<CorrelationEdge>,
}

impl CorrelationMatrix {
    /// Build from edges in any orientation; each pair is stored once with
    /// `detector_a < detector_b`
    pub fn from_edges(edges: Vec<CorrelationEdge>) -> Self {
        let mut canonical: BTreeMap<(String, String), CorrelationEdge> = BTreeMap::new();
        for mut edge in edges {
            if edge.detector_a > edge.detector_b {
                std::mem::swap(&mut edge.detector_a, &mut edge.detector_b);
            }
            canonical.insert((edge.detector_a.clone(), edge.detector_b.clone()), edge);
        }
        Self {
            edges: canonical.into_values().collect(),
        }
    }

    /// Compare detected flags for every detector pair across `universe`
    pub fn analyze(
        flagged: &BTreeMap<String, BTreeSet<String>>,
        universe: &BTreeSet<String>,
    ) -> Self {
        let detectors: Vec<&String> = flagged.keys().collect();
        let mut edges = Vec::new();

        for (i, a) in detectors.iter().enumerate() {
            for b in &detectors[i + 1..] {
                let set_a = &flagged[*a];
                let set_b = &flagged[*b];
                let (mut agree, mut disagree) = (0usize, 0usize);
                for entity in universe {
                    if set_a.contains(entity) == set_b.contains(entity) {
                        agree += 1;
                    } else {
                        disagree += 1;
                    }
                }
                if agree + disagree == 0 {
                    continue;
                }
                edges.push(CorrelationEdge {
                    detector_a: (*a).clone(),
                    detector_b: (*b).clone(),
                    agree_count: agree,
                    disagree_count: disagree,
                    agreement_rate: agree as f64 / (agree + disagree) as f64,
                });
            }
        }

        Self::from_edges(edges)
    }

    /// Agreement rate for a pair, in either order
    pub fn agreement(&self, a: &str, b: &str) -> Option<f64> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.edges
            .iter()
            .find(|e| e.detector_a == lo && e.detector_b == hi)
            .map(|e| e.agreement_rate)
    }

    /// Pairs agreeing more often than `threshold`
    pub fn redundant_pairs(&self, threshold: f64) -> Vec<&CorrelationEdge> {
        self.edges
            .iter()
            .filter(|e| e.agreement_rate > threshold)
            .collect()
    }

    pub fn edges(&self) -> &[CorrelationEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Entities each detector currently flags, using the latest record per entity
pub fn flagged_entities<'a, I>(detections: I) -> BTreeMap<String, BTreeSet<String>>
where
    I: IntoIterator<Item = &'a DetectorDetection>,
{
    let mut latest: BTreeMap<(&str, &str), &DetectorDetection> = BTreeMap::new();
    for detection in detections {
        let slot = latest
            .entry((detection.detector_id.as_str(), detection.entity_id.as_str()))
            .or_insert(detection);
        if detection.supersedes(*slot) {
            *slot = detection;
        }
    }

    let mut flagged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for ((detector_id, entity_id), detection) in latest {
        let set = flagged.entry(detector_id.to_string()).or_default();
        if detection.detected {
            set.insert(entity_id.to_string());
        }
    }
    flagged
}
