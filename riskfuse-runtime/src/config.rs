//! Pipeline configuration
//!
//! Loaded from TOML and passed by value into the orchestrator. Input paths
//! are required; every tuning knob has a documented default. Supplied but
//! invalid statistical parameters are rejected, never replaced.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use riskfuse_core::{
    ConfidenceThresholds, DiscountCurve, FusionConfig, RiskError, DEFAULT_CORRELATION_THRESHOLD,
    DEFAULT_PRIOR,
};
use riskfuse_io::WaitConfig;

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Detector registry JSON
    pub registry: PathBuf,
    /// Gold-set CSV
    pub gold_set: PathBuf,
    /// Directory receiving every run artifact
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub wait: WaitSettings,
    #[serde(default)]
    pub fusion: FusionSettings,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

/// Detector readiness wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    /// Poll until ready; otherwise check once and warn
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            max_wait_secs: 3600,
        }
    }
}

impl WaitSettings {
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
        }
    }
}

/// Fusion parameters plus the fallback calibration for degenerate gold sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    pub prior: f64,
    pub correlation_threshold: f64,
    pub discount_curve: DiscountCurve,
    pub thresholds: ConfidenceThresholds,
    pub fallback_tpr: f64,
    pub fallback_fpr: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            prior: DEFAULT_PRIOR,
            correlation_threshold: DEFAULT_CORRELATION_THRESHOLD,
            discount_curve: DiscountCurve::default(),
            thresholds: ConfidenceThresholds::default(),
            fallback_tpr: 0.5,
            fallback_fpr: 0.1,
        }
    }
}

impl FusionSettings {
    pub fn engine_config(&self) -> FusionConfig {
        FusionConfig {
            prior: self.prior,
            correlation_threshold: self.correlation_threshold,
            discount_curve: self.discount_curve,
            thresholds: self.thresholds,
        }
    }
}

impl PipelineConfig {
    pub fn new(registry: impl Into<PathBuf>, gold_set: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: registry.into(),
            gold_set: gold_set.into(),
            output_dir: output_dir.into(),
            wait: WaitSettings::default(),
            fusion: FusionSettings::default(),
        }
    }

    /// Load TOML, resolving relative paths against the file's directory
    pub fn load(path: &Path) -> Result<Self, RiskError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RiskError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::parse(&text)
            .map_err(|e| RiskError::config(format!("{}: {}", path.display(), e)))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for p in [&mut config.registry, &mut config.gold_set, &mut config.output_dir] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(text: &str) -> Result<Self, RiskError> {
        let config: Self = toml::from_str(text).map_err(|e| RiskError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RiskError> {
        self.fusion.engine_config().validate()?;
        for (name, rate) in [
            ("fallback_tpr", self.fusion.fallback_tpr),
            ("fallback_fpr", self.fusion.fallback_fpr),
        ] {
            if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                return Err(RiskError::config(format!("{} = {} is outside [0, 1]", name, rate)));
            }
        }
        if self.wait.enabled && self.wait.poll_interval_secs == 0 {
            return Err(RiskError::config("wait.poll_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.output_dir)
    }
}

/// Where each run artifact is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub correlation: PathBuf,
    pub calibration: PathBuf,
    pub performance: PathBuf,
    pub unified: PathBuf,
    pub fused: PathBuf,
    pub summary: PathBuf,
    pub run_report: PathBuf,
    pub error_log: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            correlation: dir.join("correlation_matrix.json"),
            calibration: dir.join("calibration.json"),
            performance: dir.join("performance_report.json"),
            unified: dir.join("unified_entities.ndjson"),
            fused: dir.join("fused_entities.ndjson"),
            summary: dir.join("summary.md"),
            run_report: dir.join("run_report.json"),
            error_log: dir.join("error_log.json"),
        }
    }

    pub fn all(&self) -> [&Path; 8] {
        [
            &self.correlation,
            &self.calibration,
            &self.performance,
            &self.unified,
            &self.fused,
            &self.summary,
            &self.run_report,
            &self.error_log,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PipelineConfig::parse(
            r#"
            registry = "detectors.json"
            gold_set = "gold.csv"
            "#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert!(config.wait.enabled);
        assert_eq!(config.fusion.prior, DEFAULT_PRIOR);
        assert_eq!(config.fusion.discount_curve, DiscountCurve::Geometric);
    }

    #[test]
    fn test_full_config() {
        let config = PipelineConfig::parse(
            r#"
            registry = "detectors.json"
            gold_set = "gold.csv"
            output_dir = "runs/latest"

            [wait]
            enabled = false
            max_wait_secs = 60

            [fusion]
            prior = 0.02
            discount_curve = "linear"

            [fusion.thresholds]
            low = 0.3
            "#,
        )
        .unwrap();
        assert!(!config.wait.enabled);
        assert_eq!(config.wait.poll_interval_secs, 30);
        assert_eq!(config.fusion.prior, 0.02);
        assert_eq!(config.fusion.discount_curve, DiscountCurve::Linear);
        assert_eq!(config.fusion.thresholds.low, 0.3);
        assert_eq!(config.fusion.thresholds.high, 0.80);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = "registry = \"r.json\"\ngold_set = \"g.csv\"\n";
        for bad in [
            "[fusion]\nprior = 0.0\n",
            "[fusion]\ncorrelation_threshold = 1.5\n",
            "[fusion]\nfallback_fpr = -0.1\n",
            "[fusion.thresholds]\nminimal = 0.9\n",
            "[wait]\npoll_interval_secs = 0\n",
        ] {
            let err = PipelineConfig::parse(&format!("{}{}", base, bad)).unwrap_err();
            assert!(matches!(err, RiskError::Configuration(_)), "accepted: {}", bad);
        }
    }

    #[test]
    fn test_missing_required_path_rejected() {
        assert!(PipelineConfig::parse("gold_set = \"g.csv\"\n").is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "registry = \"r.json\"\ngold_set = \"/abs/g.csv\"\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.registry, dir.path().join("r.json"));
        assert_eq!(config.gold_set, PathBuf::from("/abs/g.csv"));
        assert_eq!(config.output_dir, dir.path().join("out"));
    }
}
