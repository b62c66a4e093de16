//! Detector registry
//!
//! JSON list of `{detector_id, version, description, output_file,
//! status_file?}`, optionally wrapped as `{"detectors": [...]}`. Relative
//! paths resolve against the registry file's directory.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use riskfuse_core::{DetectorScope, RiskError};

use crate::IoError;

/// One registered detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub detector_id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub output_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    /// ISO3 countries the detector covers; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    /// Entity types the detector covers; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
}

impl DetectorSpec {
    pub fn scope(&self) -> DetectorScope {
        DetectorScope {
            detector_id: self.detector_id.clone(),
            countries: self.countries.clone(),
            entity_types: self.entity_types.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<DetectorSpec>),
    Wrapped { detectors: Vec<DetectorSpec> },
}

/// Validated set of registered detectors, ordered by detector id
#[derive(Debug, Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<DetectorSpec>,
}

impl DetectorRegistry {
    /// Validate ids and versions; at least one detector is required
    pub fn new(mut detectors: Vec<DetectorSpec>) -> Result<Self, RiskError> {
        if detectors.is_empty() {
            return Err(RiskError::config("registry lists no detectors"));
        }
        let mut seen = HashSet::new();
        for spec in &detectors {
            if spec.detector_id.trim().is_empty() {
                return Err(RiskError::config("registry entry with empty detector_id"));
            }
            if spec.version.trim().is_empty() {
                return Err(RiskError::config(format!(
                    "detector {} has an empty version",
                    spec.detector_id
                )));
            }
            if spec.output_file.as_os_str().is_empty() {
                return Err(RiskError::config(format!(
                    "detector {} has an empty output_file",
                    spec.detector_id
                )));
            }
            if !seen.insert(spec.detector_id.clone()) {
                return Err(RiskError::config(format!(
                    "detector {} registered twice",
                    spec.detector_id
                )));
            }
        }
        detectors.sort_by(|a, b| a.detector_id.cmp(&b.detector_id));
        Ok(Self { detectors })
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, IoError> {
        let text = fs::read_to_string(path).map_err(|source| IoError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::parse(&text, base_dir).map_err(|e| match e {
            RiskError::Configuration(msg) => {
                RiskError::config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        info!(
            "Loaded registry {} with {} detectors",
            path.display(),
            registry.len()
        );
        Ok(registry)
    }

    /// Parse registry JSON, resolving relative paths against `base_dir`
    pub fn parse(json: &str, base_dir: &Path) -> Result<Self, RiskError> {
        let file: RegistryFile = serde_json::from_str(json)
            .map_err(|e| RiskError::config(format!("invalid registry: {}", e)))?;
        let detectors = match file {
            RegistryFile::List(list) => list,
            RegistryFile::Wrapped { detectors } => detectors,
        };
        let resolved = detectors
            .into_iter()
            .map(|mut spec| {
                spec.output_file = resolve(base_dir, &spec.output_file);
                spec.status_file = spec.status_file.map(|p| resolve(base_dir, &p));
                spec
            })
            .collect();
        Self::new(resolved)
    }

    pub fn detectors(&self) -> &[DetectorSpec] {
        &self.detectors
    }

    pub fn get(&self, detector_id: &str) -> Option<&DetectorSpec> {
        self.detectors.iter().find(|d| d.detector_id == detector_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.detectors.iter().map(|d| d.detector_id.as_str())
    }

    pub fn scopes(&self) -> Vec<DetectorScope> {
        self.detectors.iter().map(DetectorSpec::scope).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_list_and_resolve_paths() {
        let json = r#"[
            {"detector_id":"trade","version":"2","output_file":"out/trade.ndjson","status_file":"out/trade.status"},
            {"detector_id":"bis","version":"1","description":"Entity List","output_file":"/abs/bis.ndjson",
             "countries":["CHN","HKG"]}
        ]"#;
        let registry = DetectorRegistry::parse(json, Path::new("/data")).unwrap();

        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["bis", "trade"]);
        let trade = registry.get("trade").unwrap();
        assert_eq!(trade.output_file, PathBuf::from("/data/out/trade.ndjson"));
        assert_eq!(trade.status_file, Some(PathBuf::from("/data/out/trade.status")));
        assert_eq!(registry.get("bis").unwrap().output_file, PathBuf::from("/abs/bis.ndjson"));
        assert_eq!(registry.scopes()[0].countries.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_wrapped_form() {
        let json = r#"{"detectors":[{"detector_id":"a","version":"1","output_file":"a.ndjson"}]}"#;
        assert_eq!(DetectorRegistry::parse(json, Path::new(".")).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_required_field_is_configuration_error() {
        let json = r#"[{"detector_id":"a","output_file":"a.ndjson"}]"#;
        let err = DetectorRegistry::parse(json, Path::new(".")).unwrap_err();
        assert!(matches!(err, RiskError::Configuration(_)));
    }

    #[test]
    fn test_duplicates_and_empty_rejected() {
        let dup = r#"[{"detector_id":"a","version":"1","output_file":"a"},
                      {"detector_id":"a","version":"2","output_file":"b"}]"#;
        assert!(DetectorRegistry::parse(dup, Path::new(".")).is_err());
        assert!(DetectorRegistry::parse("[]", Path::new(".")).is_err());
    }
}
