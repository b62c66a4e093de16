//! Pipeline Orchestrator
//!
//! Drives one run through a fixed state machine:
//! - WAIT_FOR_DETECTORS: probe every registered detector until ready
//! - CORRELATION: pairwise agreement between detector outputs
//! - CROSS_VALIDATION: score detectors against the gold set, emit calibrations
//! - BUILD_UNIFIED: merge detections into one record per entity
//! - FUSION: Bayesian posterior and confidence level per entity
//! - SUMMARY: Markdown report
//!
//! Steps are in-process calls. The first failing step aborts the run and
//! leaves `error_log.json` next to the partial artifacts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use riskfuse_core::{
    evaluate_detector, flagged_entities, CalibrationSet, CorrelationMatrix, DetectorCalibration,
    Entity, EntityBuilder, FusionEngine, PerformanceReport, RiskError,
};
use riskfuse_io::{
    fingerprint, load_gold_set, probe_all, read_detector_output, wait_for_detectors,
    write_atomic, write_json_atomic, write_ndjson_atomic, CalibrationStore, DetectorOutput,
    DetectorReadiness, DetectorRegistry, FileProbe, IoError, ReadinessProbe,
};

use crate::{
    render_summary, ArtifactPaths, ErrorLog, PipelineConfig, PipelineError, PipelineState,
    RunReport, StepRecord, StepStatus, SummaryInput,
};

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub performance: Vec<PerformanceReport>,
    pub calibrations: Vec<DetectorCalibration>,
    /// Fused entities; empty for calibrate-only runs
    pub entities: Vec<Entity>,
}

/// Mutable state threaded through the steps of one run
struct RunContext {
    report: RunReport,
    artifacts: ArtifactPaths,
    registry: Option<DetectorRegistry>,
    /// Registry order
    outputs: Option<Vec<DetectorOutput>>,
    correlation: Option<CorrelationMatrix>,
    performance: Vec<PerformanceReport>,
    calibrations: Vec<DetectorCalibration>,
    unified: Vec<Entity>,
    fused: Vec<Entity>,
}

impl RunContext {
    fn registry(&self, step: PipelineState) -> Result<&DetectorRegistry, PipelineError> {
        self.registry
            .as_ref()
            .ok_or_else(|| PipelineError::new(step, RiskError::config("detector registry not loaded")))
    }

    fn record_artifact(&mut self, path: &Path) {
        self.report.artifacts.push(path.to_path_buf());
    }
}

/// Runs the fusion pipeline
pub struct Orchestrator {
    config: PipelineConfig,
    probe: Box<dyn ReadinessProbe>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with the filesystem readiness probe
    pub fn new(config: PipelineConfig) -> Result<Self, RiskError> {
        config.validate()?;
        Ok(Self {
            config,
            probe: Box::new(FileProbe),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_probe(mut self, probe: Box<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Token that aborts the run when cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Full run through every step
    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        self.execute(&PipelineState::STEPS).await
    }

    /// Readiness, cross-validation and summary only
    pub async fn calibrate(&self) -> Result<RunOutcome, PipelineError> {
        self.execute(&PipelineState::CALIBRATION_STEPS).await
    }

    /// One readiness probe of every registered detector, without waiting
    pub async fn status(&self) -> Result<Vec<DetectorReadiness>, PipelineError> {
        let registry = self.load_registry(PipelineState::WaitForDetectors)?;
        Ok(probe_all(self.probe.as_ref(), registry.detectors()).await)
    }

    async fn execute(&self, steps: &[PipelineState]) -> Result<RunOutcome, PipelineError> {
        let mut ctx = RunContext {
            report: RunReport::new(Uuid::new_v4()),
            artifacts: self.config.artifacts(),
            registry: None,
            outputs: None,
            correlation: None,
            performance: Vec::new(),
            calibrations: Vec::new(),
            unified: Vec::new(),
            fused: Vec::new(),
        };
        info!(
            "Run {} starting: {} steps, output {}",
            ctx.report.run_id,
            steps.len(),
            self.config.output_dir.display()
        );

        if let Err(source) = std::fs::create_dir_all(&self.config.output_dir) {
            let err = PipelineError::new(
                steps.first().copied().unwrap_or(PipelineState::WaitForDetectors),
                RiskError::Io(format!(
                    "cannot create {}: {}",
                    self.config.output_dir.display(),
                    source
                )),
            )
            .with_input(&self.config.output_dir);
            return Err(self.fail(&mut ctx, err));
        }

        // Artifacts from an earlier run never survive next to this one
        let stale: Vec<PathBuf> = ctx
            .artifacts
            .all()
            .into_iter()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .collect();
        for path in stale {
            debug!("Removing stale {}", path.display());
            if let Err(source) = std::fs::remove_file(&path) {
                let err = PipelineError::new(
                    steps.first().copied().unwrap_or(PipelineState::WaitForDetectors),
                    RiskError::Io(format!("cannot remove stale {}: {}", path.display(), source)),
                )
                .with_input(&path);
                return Err(self.fail(&mut ctx, err));
            }
        }

        for &step in steps {
            if self.cancel.is_cancelled() {
                warn!("Run {} cancelled before {}", ctx.report.run_id, step);
                return Err(self.fail(&mut ctx, PipelineError::new(step, RiskError::Cancelled)));
            }

            ctx.report.state = step;
            let started = Instant::now();
            info!("Step {} starting", step);

            let result = match step {
                PipelineState::WaitForDetectors => self.wait_step(&mut ctx).await,
                PipelineState::Correlation => self.correlation_step(&mut ctx),
                PipelineState::CrossValidation => self.cross_validation_step(&mut ctx),
                PipelineState::BuildUnified => self.build_unified_step(&mut ctx),
                PipelineState::Fusion => self.fusion_step(&mut ctx),
                PipelineState::Summary => self.summary_step(&mut ctx),
                PipelineState::Complete | PipelineState::Failed => Ok(String::new()),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(detail) => {
                    info!("Step {} done in {} ms: {}", step, duration_ms, detail);
                    ctx.report.steps.push(StepRecord {
                        step,
                        status: StepStatus::Completed,
                        duration_ms,
                        detail,
                    });
                }
                Err(err) => {
                    ctx.report.steps.push(StepRecord {
                        step,
                        status: StepStatus::Failed,
                        duration_ms,
                        detail: err.source.to_string(),
                    });
                    return Err(self.fail(&mut ctx, err));
                }
            }
        }

        ctx.report.state = PipelineState::Complete;
        ctx.report.finished_at = Some(chrono::Utc::now());
        let run_report = ctx.artifacts.run_report.clone();
        ctx.record_artifact(&run_report);
        if let Err(e) = write_json_atomic(&run_report, &ctx.report) {
            let err = PipelineError::new(PipelineState::Summary, e).with_input(&run_report);
            return Err(self.fail(&mut ctx, err));
        }

        info!(
            "Run {} complete: {} entities fused, {} malformed records skipped",
            ctx.report.run_id,
            ctx.fused.len(),
            ctx.report.malformed_total()
        );

        Ok(RunOutcome {
            report: ctx.report,
            performance: ctx.performance,
            calibrations: ctx.calibrations,
            entities: ctx.fused,
        })
    }

    /// Mark the run failed and write the error log; write failures are logged only
    fn fail(&self, ctx: &mut RunContext, err: PipelineError) -> PipelineError {
        error!("{} ({})", err, err.kind());
        ctx.report.state = PipelineState::Failed;
        ctx.report.finished_at = Some(chrono::Utc::now());

        let log = ErrorLog::from_failure(&ctx.report, &err);
        if let Err(e) = write_json_atomic(&ctx.artifacts.error_log, &log) {
            warn!("Could not write error log: {}", e);
        }
        if let Err(e) = write_json_atomic(&ctx.artifacts.run_report, &ctx.report) {
            warn!("Could not write run report: {}", e);
        }
        err
    }

    fn load_registry(&self, step: PipelineState) -> Result<DetectorRegistry, PipelineError> {
        DetectorRegistry::load(&self.config.registry)
            .map_err(|e| PipelineError::new(step, e).with_input(&self.config.registry))
    }

    fn fingerprint_input(&self, ctx: &mut RunContext, step: PipelineState, path: &Path) -> Result<(), PipelineError> {
        let digest = fingerprint(path).map_err(|e| PipelineError::new(step, e).with_input(path))?;
        ctx.report
            .input_fingerprints
            .insert(path.display().to_string(), digest);
        Ok(())
    }

    async fn wait_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::WaitForDetectors;
        let registry = self.load_registry(step)?;
        self.fingerprint_input(ctx, step, &self.config.registry)?;

        let readiness = if self.config.wait.enabled {
            wait_for_detectors(
                self.probe.as_ref(),
                registry.detectors(),
                self.config.wait.wait_config(),
                &self.cancel,
            )
            .await
            .map_err(|e| PipelineError::new(step, e))?
        } else {
            let statuses = probe_all(self.probe.as_ref(), registry.detectors()).await;
            for status in statuses.iter().filter(|s| !s.ready) {
                warn!(
                    "Detector {} not ready: {}",
                    status.detector_id,
                    status.reason.as_deref().unwrap_or("unknown")
                );
            }
            statuses
        };

        let ready = readiness.iter().filter(|r| r.ready).count();
        let detail = format!("{}/{} detectors ready", ready, readiness.len());
        ctx.report.readiness = readiness;
        ctx.registry = Some(registry);
        Ok(detail)
    }

    /// Read every detector output once; missing or unusable outputs fail the step
    fn ensure_outputs(&self, ctx: &mut RunContext, step: PipelineState) -> Result<(), PipelineError> {
        if ctx.outputs.is_some() {
            return Ok(());
        }
        let specs = ctx.registry(step)?.detectors().to_vec();

        let mut outputs = Vec::with_capacity(specs.len());
        let mut missing = Vec::new();
        let mut first_missing = None;

        for spec in &specs {
            let output = match read_detector_output(&spec.detector_id, &spec.output_file) {
                Ok(output) => output,
                Err(IoError::Read { path, source }) => {
                    warn!("Detector {} output unreadable: {}", spec.detector_id, source);
                    missing.push(spec.detector_id.clone());
                    first_missing.get_or_insert(path);
                    continue;
                }
                Err(e) => return Err(PipelineError::new(step, e).with_input(&spec.output_file)),
            };

            if output.stats.malformed > 0 {
                warn!(
                    "Detector {}: {} of {} records malformed",
                    spec.detector_id, output.stats.malformed, output.stats.lines
                );
            }
            ctx.report
                .normalize_stats
                .insert(spec.detector_id.clone(), output.stats.clone());

            if !output.is_usable() {
                warn!("Detector {} produced no usable records", spec.detector_id);
                missing.push(spec.detector_id.clone());
                first_missing.get_or_insert_with(|| spec.output_file.clone());
                continue;
            }

            self.fingerprint_input(ctx, step, &spec.output_file)?;
            debug!(
                "Detector {}: {} detections",
                spec.detector_id,
                output.detections.len()
            );
            outputs.push(output);
        }

        if !missing.is_empty() {
            let mut err = PipelineError::new(step, RiskError::MissingData { detectors: missing });
            if let Some(path) = first_missing {
                err = err.with_input(path);
            }
            return Err(err);
        }

        ctx.outputs = Some(outputs);
        Ok(())
    }

    fn correlation_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::Correlation;
        self.ensure_outputs(ctx, step)?;
        let ids: Vec<String> = ctx.registry(step)?.ids().map(String::from).collect();
        let outputs = ctx.outputs.as_deref().unwrap_or_default();

        let mut flagged = flagged_entities(outputs.iter().flat_map(|o| o.detections.iter()));
        for id in ids {
            flagged.entry(id).or_default();
        }
        let universe: BTreeSet<String> = outputs
            .iter()
            .flat_map(|o| o.detections.iter().map(|d| d.entity_id.clone()))
            .collect();

        let matrix = CorrelationMatrix::analyze(&flagged, &universe);
        let threshold = self.config.fusion.correlation_threshold;
        for edge in matrix.redundant_pairs(threshold) {
            warn!(
                "Detectors {} and {} agree on {:.1}% of entities; evidence will be discounted",
                edge.detector_a,
                edge.detector_b,
                edge.agreement_rate * 100.0
            );
        }

        let path = ctx.artifacts.correlation.clone();
        write_json_atomic(&path, &matrix).map_err(|e| PipelineError::new(step, e).with_input(&path))?;
        ctx.record_artifact(&path);

        let detail = format!("{} pairs over {} entities", matrix.len(), universe.len());
        ctx.correlation = Some(matrix);
        Ok(detail)
    }

    fn cross_validation_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::CrossValidation;
        self.ensure_outputs(ctx, step)?;

        let gold_path = &self.config.gold_set;
        let gold = load_gold_set(gold_path).map_err(|e| PipelineError::new(step, e).with_input(gold_path))?;
        self.fingerprint_input(ctx, step, gold_path)?;
        if gold.is_empty() {
            return Err(PipelineError::new(step, RiskError::config("gold set is empty")).with_input(gold_path));
        }

        let specs = ctx.registry(step)?.detectors().to_vec();
        let outputs = ctx.outputs.as_deref().unwrap_or_default();
        let mut performance = Vec::with_capacity(specs.len());
        let mut calibrations = Vec::with_capacity(specs.len());
        let mut fallback = Vec::new();

        for (spec, output) in specs.iter().zip(outputs) {
            let report = evaluate_detector(&gold, &spec.detector_id, &spec.version, &output.detections);
            let calibration = match report.calibration() {
                Ok(calibration) => calibration,
                Err(RiskError::StatisticalDegeneracy { detector_id, reason }) => {
                    warn!(
                        "Detector {} cannot be calibrated ({}); using fallback TPR={} FPR={}",
                        detector_id, reason, self.config.fusion.fallback_tpr, self.config.fusion.fallback_fpr
                    );
                    fallback.push(detector_id);
                    DetectorCalibration::fallback(
                        &spec.detector_id,
                        &spec.version,
                        self.config.fusion.fallback_tpr,
                        self.config.fusion.fallback_fpr,
                        report.sample_size,
                    )
                }
                Err(e) => return Err(PipelineError::new(step, e)),
            };
            info!(
                "Detector {}: TPR={:.3} FPR={:.3} LR+={:.2}",
                spec.detector_id,
                calibration.true_positive_rate,
                calibration.false_positive_rate,
                calibration.positive_likelihood_ratio()
            );
            performance.push(report);
            calibrations.push(calibration);
        }

        let perf_path = ctx.artifacts.performance.clone();
        write_json_atomic(&perf_path, &performance)
            .map_err(|e| PipelineError::new(step, e).with_input(&perf_path))?;
        ctx.record_artifact(&perf_path);

        let store = CalibrationStore::new(ctx.artifacts.calibration.clone());
        store
            .save(&calibrations)
            .map_err(|e| PipelineError::new(step, e).with_input(store.path()))?;
        ctx.record_artifact(store.path());

        let detail = format!(
            "{} detectors scored on {} gold entities, {} fallback",
            calibrations.len(),
            gold.len(),
            fallback.len()
        );
        ctx.report.fallback_detectors = fallback;
        ctx.performance = performance;
        ctx.calibrations = calibrations;
        Ok(detail)
    }

    fn build_unified_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::BuildUnified;
        self.ensure_outputs(ctx, step)?;
        let batches: Vec<_> = ctx
            .outputs
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|o| o.detections)
            .collect();

        let builder = EntityBuilder::from_outputs(&batches);
        let stats = builder.stats();
        let entities = builder.finish();

        let path = ctx.artifacts.unified.clone();
        write_ndjson_atomic(&path, &entities).map_err(|e| PipelineError::new(step, e).with_input(&path))?;
        ctx.record_artifact(&path);

        ctx.report.build_stats = Some(stats);
        ctx.unified = entities;
        Ok(format!(
            "{} records into {} entities, {} with attribute conflicts",
            stats.records, stats.entities, stats.entities_with_conflicts
        ))
    }

    fn fusion_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::Fusion;
        let scopes = ctx.registry(step)?.scopes();
        let calibrations = CalibrationSet::new(ctx.calibrations.clone()).map_err(|e| PipelineError::new(step, e))?;
        let correlation = ctx.correlation.clone().unwrap_or_default();

        let engine = FusionEngine::new(self.config.fusion.engine_config(), calibrations, correlation, scopes)
            .map_err(|e| PipelineError::new(step, e))?;
        let fused = engine.fuse_all(std::mem::take(&mut ctx.unified));

        let path = ctx.artifacts.fused.clone();
        write_ndjson_atomic(&path, &fused).map_err(|e| PipelineError::new(step, e).with_input(&path))?;
        ctx.record_artifact(&path);

        ctx.report.level_counts.clear();
        for entity in &fused {
            if let Some(level) = entity.fused_confidence_level {
                *ctx.report.level_counts.entry(level.to_string()).or_insert(0) += 1;
            }
        }
        let flagged = fused
            .iter()
            .filter(|e| e.fused_posterior.unwrap_or(0.0) >= self.config.fusion.thresholds.low)
            .count();

        let detail = format!("{} entities fused, {} at LOW or above", fused.len(), flagged);
        ctx.fused = fused;
        Ok(detail)
    }

    fn summary_step(&self, ctx: &mut RunContext) -> Result<String, PipelineError> {
        let step = PipelineState::Summary;
        let markdown = render_summary(&SummaryInput {
            report: &ctx.report,
            performance: &ctx.performance,
            calibrations: &ctx.calibrations,
            correlation: ctx.correlation.as_ref(),
            correlation_threshold: self.config.fusion.correlation_threshold,
            fused: &ctx.fused,
        });

        let path = ctx.artifacts.summary.clone();
        write_atomic(&path, markdown.as_bytes()).map_err(|e| PipelineError::new(step, e).with_input(&path))?;
        ctx.record_artifact(&path);
        Ok(format!("summary written to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskfuse_core::{CalibrationSource, ConfidenceLevel};
    use std::fs;

    const GOLD: &str = "\
canonical_name,entity_id,label,confidence_label,provenance__primary_source,provenance__secondary_sources,justification_summary
Acme Drones,e1,HIGH,VERIFIED,bis,,listed
Borealis Optics,e2,CRITICAL,STRONG,ofac,,sanctioned
Cobalt Farms,e3,CLEAN,VERIFIED,registry,,
Delta Textiles,e4,CLEAN,MODERATE,registry,,
";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            fs::write(root.join("gold.csv"), GOLD).unwrap();
            fs::write(
                root.join("detectors.json"),
                r#"{"detectors":[
                    {"detector_id":"bis_list","version":"1.0","output_file":"bis.ndjson"},
                    {"detector_id":"trade_flow","version":"2.1","output_file":"trade.ndjson"}
                ]}"#,
            )
            .unwrap();
            fs::write(
                root.join("bis.ndjson"),
                concat!(
                    r#"{"entity_id":"e1","canonical_name":"Acme Drones","country_iso3":"CHN","confidence_score":92}"#, "\n",
                    r#"{"entity_id":"e3","canonical_name":"Cobalt Farms","confidence_score":40}"#, "\n",
                    r#"{"entity_id":"x9","canonical_name":"Unlisted Ltd","confidence_score":70}"#, "\n",
                    "not json\n",
                ),
            )
            .unwrap();
            fs::write(
                root.join("trade.ndjson"),
                concat!(
                    r#"{"entity_id":"e1","canonical_name":"Acme Drones Co","country_iso3":"CHN","confidence_score":80}"#, "\n",
                    r#"{"entity_id":"e2","canonical_name":"Borealis Optics","confidence_score":65}"#, "\n",
                    r#"{"entity_id":"e4","canonical_name":"Delta Textiles","confidence_score":10,"detected":false}"#, "\n",
                ),
            )
            .unwrap();
            Self { _dir: dir, root }
        }

        fn config(&self) -> PipelineConfig {
            let mut config = PipelineConfig::new(
                self.root.join("detectors.json"),
                self.root.join("gold.csv"),
                self.root.join("out"),
            );
            config.wait.enabled = false;
            config
        }

        fn out(&self, name: &str) -> PathBuf {
            self.root.join("out").join(name)
        }
    }

    #[tokio::test]
    async fn test_full_run_writes_artifacts() {
        let fx = Fixture::new();
        let outcome = Orchestrator::new(fx.config()).unwrap().run().await.unwrap();

        assert_eq!(outcome.report.state, PipelineState::Complete);
        assert_eq!(outcome.report.completed_steps(), PipelineState::STEPS.to_vec());
        assert_eq!(outcome.report.malformed_total(), 1);
        assert_eq!(outcome.calibrations.len(), 2);
        assert!(outcome.calibrations.iter().all(|c| c.source == CalibrationSource::Measured));

        // e1, e2, e3, e4, x9
        assert_eq!(outcome.entities.len(), 5);
        let e1 = outcome.entities.iter().find(|e| e.entity_id == "e1").unwrap();
        let e4 = outcome.entities.iter().find(|e| e.entity_id == "e4").unwrap();
        assert!(e1.fused_posterior.unwrap() > e4.fused_posterior.unwrap());
        assert!(e1.fused_confidence_level.unwrap() > ConfidenceLevel::None);
        assert_eq!(e1.canonical_name, "Acme Drones");

        for name in [
            "correlation_matrix.json",
            "calibration.json",
            "performance_report.json",
            "unified_entities.ndjson",
            "fused_entities.ndjson",
            "summary.md",
            "run_report.json",
        ] {
            assert!(fx.out(name).exists(), "missing {}", name);
        }
        assert!(!fx.out("error_log.json").exists());

        let stored = CalibrationStore::new(fx.out("calibration.json")).load().unwrap();
        assert!(stored.get("bis_list").is_some());
        assert_eq!(outcome.report.input_fingerprints.len(), 4);
    }

    #[tokio::test]
    async fn test_rerun_is_byte_identical() {
        let fx = Fixture::new();
        let orchestrator = Orchestrator::new(fx.config()).unwrap();

        orchestrator.run().await.unwrap();
        let unified = fs::read(fx.out("unified_entities.ndjson")).unwrap();
        let fused = fs::read(fx.out("fused_entities.ndjson")).unwrap();
        let calibration = fs::read(fx.out("calibration.json")).unwrap();

        orchestrator.run().await.unwrap();
        assert_eq!(fs::read(fx.out("unified_entities.ndjson")).unwrap(), unified);
        assert_eq!(fs::read(fx.out("fused_entities.ndjson")).unwrap(), fused);
        assert_eq!(fs::read(fx.out("calibration.json")).unwrap(), calibration);
    }

    #[tokio::test]
    async fn test_missing_detector_aborts_with_error_log() {
        let fx = Fixture::new();
        fs::remove_file(fx.root.join("trade.ndjson")).unwrap();

        let err = Orchestrator::new(fx.config()).unwrap().run().await.unwrap_err();
        assert_eq!(err.step, PipelineState::Correlation);
        match &err.source {
            RiskError::MissingData { detectors } => assert_eq!(detectors, &vec!["trade_flow".to_string()]),
            other => panic!("unexpected error: {}", other),
        }

        let log: ErrorLog =
            serde_json::from_str(&fs::read_to_string(fx.out("error_log.json")).unwrap()).unwrap();
        assert_eq!(log.failed_step, PipelineState::Correlation);
        assert_eq!(log.error_kind, "MissingDataError");
        assert_eq!(log.completed_steps, vec![PipelineState::WaitForDetectors]);
        assert_eq!(log.offending_input, Some(fx.root.join("trade.ndjson")));
        assert!(!fx.out("fused_entities.ndjson").exists());
    }

    #[tokio::test]
    async fn test_failed_rerun_leaves_no_stale_artifacts() {
        let fx = Fixture::new();
        let orchestrator = Orchestrator::new(fx.config()).unwrap();
        orchestrator.run().await.unwrap();
        assert!(fx.out("fused_entities.ndjson").exists());

        let trade = fs::read(fx.root.join("trade.ndjson")).unwrap();
        fs::remove_file(fx.root.join("trade.ndjson")).unwrap();
        orchestrator.run().await.unwrap_err();
        for name in ["fused_entities.ndjson", "calibration.json", "summary.md"] {
            assert!(!fx.out(name).exists(), "{} survived a failed run", name);
        }
        assert!(fx.out("error_log.json").exists());

        fs::write(fx.root.join("trade.ndjson"), trade).unwrap();
        orchestrator.run().await.unwrap();
        assert!(!fx.out("error_log.json").exists());
        assert!(fx.out("fused_entities.ndjson").exists());
    }

    #[tokio::test]
    async fn test_wait_times_out_with_missing_data() {
        let fx = Fixture::new();
        fs::write(fx.root.join("trade.ndjson"), "").unwrap();
        let mut config = fx.config();
        config.wait.enabled = true;
        config.wait.poll_interval_secs = 1;
        config.wait.max_wait_secs = 0;

        let err = Orchestrator::new(config).unwrap().run().await.unwrap_err();
        assert_eq!(err.step, PipelineState::WaitForDetectors);
        assert_eq!(err.kind(), "MissingDataError");
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Orchestrator::new(fx.config())
            .unwrap()
            .with_cancellation(cancel)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err.source, RiskError::Cancelled));
        assert!(fx.out("error_log.json").exists());
    }

    #[tokio::test]
    async fn test_single_class_gold_uses_fallback() {
        let fx = Fixture::new();
        let positives_only: String = GOLD.lines().take(3).map(|l| format!("{}\n", l)).collect();
        fs::write(fx.root.join("gold.csv"), positives_only).unwrap();

        let outcome = Orchestrator::new(fx.config()).unwrap().run().await.unwrap();
        assert_eq!(
            outcome.report.fallback_detectors,
            vec!["bis_list".to_string(), "trade_flow".to_string()]
        );
        for calibration in &outcome.calibrations {
            assert_eq!(calibration.source, CalibrationSource::Fallback);
            assert_eq!(calibration.true_positive_rate, 0.5);
            assert_eq!(calibration.false_positive_rate, 0.1);
        }
    }

    #[tokio::test]
    async fn test_calibrate_skips_fusion() {
        let fx = Fixture::new();
        let outcome = Orchestrator::new(fx.config()).unwrap().calibrate().await.unwrap();

        assert_eq!(outcome.report.completed_steps(), PipelineState::CALIBRATION_STEPS.to_vec());
        assert!(outcome.entities.is_empty());
        assert!(fx.out("calibration.json").exists());
        assert!(fx.out("summary.md").exists());
        assert!(!fx.out("fused_entities.ndjson").exists());
    }

    #[tokio::test]
    async fn test_status_probes_once() {
        let fx = Fixture::new();
        fs::remove_file(fx.root.join("bis.ndjson")).unwrap();

        let statuses = Orchestrator::new(fx.config()).unwrap().status().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[0].ready);
        assert!(statuses[1].ready);
    }
}
