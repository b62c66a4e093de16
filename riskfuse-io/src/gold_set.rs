//! Gold-set CSV loader
//!
//! Expected columns: `canonical_name, entity_id?, label, confidence_label,
//! provenance__primary_source, provenance__secondary_sources,
//! justification_summary`. Any bad row is fatal: the gold set calibrates
//! every detector, so it is never partially loaded.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

use riskfuse_core::{
    ConfidenceLabel, GoldSet, GoldSetEntity, Provenance, RiskError, RiskLabel,
};

use crate::IoError;

#[derive(Debug, Deserialize)]
struct GoldSetRow {
    canonical_name: String,
    #[serde(default)]
    entity_id: Option<String>,
    label: String,
    confidence_label: String,
    #[serde(default, rename = "provenance__primary_source")]
    primary_source: Option<String>,
    #[serde(default, rename = "provenance__secondary_sources")]
    secondary_sources: Option<String>,
    #[serde(default)]
    justification_summary: Option<String>,
}

/// Load and validate the gold set
pub fn load_gold_set(path: &Path) -> Result<GoldSet, IoError> {
    let file = File::open(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let gold = parse_gold_set(file, path)?;
    info!(
        "Loaded gold set {}: {} entities ({} positive, {} clean)",
        path.display(),
        gold.len(),
        gold.positives(),
        gold.negatives()
    );
    Ok(gold)
}

/// Parse gold-set CSV from any reader; `path` is used for error context
pub fn parse_gold_set<R: Read>(reader: R, path: &Path) -> Result<GoldSet, IoError> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut entities = Vec::new();
    let mut seen = HashSet::new();

    for (idx, row) in csv_reader.deserialize::<GoldSetRow>().enumerate() {
        // Header is line 1
        let line = idx + 2;
        let row = row.map_err(|source| IoError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let bad_row = |reason: String| {
            IoError::Risk(RiskError::config(format!(
                "{} line {}: {}",
                path.display(),
                line,
                reason
            )))
        };

        let label: RiskLabel = row.label.parse().map_err(bad_row)?;
        let confidence_label: ConfidenceLabel = row.confidence_label.parse().map_err(bad_row)?;
        let provenance = Provenance {
            primary_source: row.primary_source.unwrap_or_default(),
            secondary_sources: split_sources(row.secondary_sources.as_deref()),
            justification: row.justification_summary.unwrap_or_default(),
        };

        let entity = GoldSetEntity::new(
            &row.canonical_name,
            row.entity_id.as_deref(),
            label,
            confidence_label,
            provenance,
        )
        .ok_or_else(|| bad_row("no usable canonical_name or entity_id".to_string()))?;

        if !seen.insert(entity.entity_id.clone()) {
            return Err(bad_row(format!("duplicate entity '{}'", entity.entity_id)));
        }
        entities.push(entity);
    }

    Ok(GoldSet::new(entities))
}

fn split_sources(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split([';', '|'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
