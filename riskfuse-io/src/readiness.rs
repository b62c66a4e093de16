//! Detector readiness
//!
//! A detector is ready when its output file exists and is non-empty and its
//! status file, if registered, reports completion. The wait loop polls at a
//! fixed interval, gives up at a deadline and stops immediately when its
//! cancellation token fires.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use riskfuse_core::RiskError;

use crate::DetectorSpec;

/// Readiness of one detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorReadiness {
    pub detector_id: String,
    pub ready: bool,
    /// Why the detector is not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DetectorReadiness {
    pub fn ready(detector_id: &str) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            ready: true,
            reason: None,
        }
    }

    pub fn not_ready(detector_id: &str, reason: impl Into<String>) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

/// Checks whether a detector's output can be consumed
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, spec: &DetectorSpec) -> DetectorReadiness;
}

/// Filesystem-backed probe
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProbe;

#[async_trait]
impl ReadinessProbe for FileProbe {
    async fn probe(&self, spec: &DetectorSpec) -> DetectorReadiness {
        let id = spec.detector_id.as_str();
        match tokio::fs::metadata(&spec.output_file).await {
            Err(_) => {
                return DetectorReadiness::not_ready(
                    id,
                    format!("output file {} missing", spec.output_file.display()),
                )
            }
            Ok(meta) if meta.len() == 0 => {
                return DetectorReadiness::not_ready(id, "output file empty")
            }
            Ok(_) => {}
        }

        let Some(status_file) = &spec.status_file else {
            return DetectorReadiness::ready(id);
        };
        match tokio::fs::read_to_string(status_file).await {
            Err(_) => DetectorReadiness::not_ready(
                id,
                format!("status file {} missing", status_file.display()),
            ),
            Ok(text) => match status_is_complete(&text) {
                Ok(true) => DetectorReadiness::ready(id),
                Ok(false) => DetectorReadiness::not_ready(id, format!("status '{}'", text.trim())),
                Err(e) => DetectorReadiness::not_ready(id, e),
            },
        }
    }
}

const COMPLETE_WORDS: &[&str] = &["complete", "completed", "done", "success", "finished"];

/// Interpret a status file.
///
/// Accepts a JSON object with a `status`/`state` string or a boolean
/// `complete`/`completed`, or plain text such as `done`.
pub fn status_is_complete(text: &str) -> Result<bool, String> {
    let word_done = |s: &str| COMPLETE_WORDS.contains(&s.trim().to_lowercase().as_str());

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => {
            for key in ["complete", "completed"] {
                if let Some(flag) = map.get(key).and_then(|v| v.as_bool()) {
                    return Ok(flag);
                }
            }
            for key in ["status", "state"] {
                if let Some(status) = map.get(key).and_then(|v| v.as_str()) {
                    return Ok(word_done(status));
                }
            }
            Err("status file has no status, state or complete field".to_string())
        }
        Ok(serde_json::Value::String(s)) => Ok(word_done(&s)),
        _ => Ok(word_done(text)),
    }
}

/// Probe every detector concurrently; results follow `specs` order
pub async fn probe_all(probe: &dyn ReadinessProbe, specs: &[DetectorSpec]) -> Vec<DetectorReadiness> {
    join_all(specs.iter().map(|spec| probe.probe(spec))).await
}

/// Poll interval and deadline for the readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(3600),
        }
    }
}

/// Wait until every detector is ready.
///
/// Fails with `MissingData` naming the pending detectors once `max_wait`
/// elapses, or `Cancelled` as soon as `cancel` fires.
pub async fn wait_for_detectors(
    probe: &dyn ReadinessProbe,
    specs: &[DetectorSpec],
    wait: WaitConfig,
    cancel: &CancellationToken,
) -> Result<Vec<DetectorReadiness>, RiskError> {
    let deadline = Instant::now() + wait.max_wait;
    let mut polls = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RiskError::Cancelled);
        }

        polls += 1;
        let statuses = probe_all(probe, specs).await;
        let pending: Vec<String> = statuses
            .iter()
            .filter(|s| !s.ready)
            .map(|s| s.detector_id.clone())
            .collect();

        if pending.is_empty() {
            info!("All {} detectors ready after {} polls", specs.len(), polls);
            return Ok(statuses);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RiskError::MissingData { detectors: pending });
        }

        debug!(
            "Poll {}: waiting on {} detectors ({})",
            polls,
            pending.len(),
            pending.join(", ")
        );

        let nap = wait.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(RiskError::Cancelled),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec(dir: &std::path::Path, id: &str, with_status: bool) -> DetectorSpec {
        DetectorSpec {
            detector_id: id.to_string(),
            version: "1".to_string(),
            description: String::new(),
            output_file: dir.join(format!("{}.ndjson", id)),
            status_file: with_status.then(|| dir.join(format!("{}.status", id))),
            countries: None,
            entity_types: None,
        }
    }

    /// Becomes ready on the Nth probe
    struct CountdownProbe {
        calls: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl ReadinessProbe for CountdownProbe {
        async fn probe(&self, spec: &DetectorSpec) -> DetectorReadiness {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                DetectorReadiness::ready(&spec.detector_id)
            } else {
                DetectorReadiness::not_ready(&spec.detector_id, "running")
            }
        }
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(status_is_complete("done\n"), Ok(true));
        assert_eq!(status_is_complete("RUNNING"), Ok(false));
        assert_eq!(status_is_complete(r#"{"status":"completed"}"#), Ok(true));
        assert_eq!(status_is_complete(r#"{"state":"running"}"#), Ok(false));
        assert_eq!(status_is_complete(r#"{"complete":true}"#), Ok(true));
        assert_eq!(status_is_complete(r#""success""#), Ok(true));
        assert!(status_is_complete(r#"{"progress":0.4}"#).is_err());
    }

    #[tokio::test]
    async fn test_file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let plain = spec(dir.path(), "plain", false);
        let gated = spec(dir.path(), "gated", true);

        assert!(!FileProbe.probe(&plain).await.ready);
        std::fs::write(&plain.output_file, "").unwrap();
        assert_eq!(
            FileProbe.probe(&plain).await.reason.as_deref(),
            Some("output file empty")
        );
        std::fs::write(&plain.output_file, "{}\n").unwrap();
        assert!(FileProbe.probe(&plain).await.ready);

        std::fs::write(&gated.output_file, "{}\n").unwrap();
        assert!(!FileProbe.probe(&gated).await.ready);
        std::fs::write(gated.status_file.as_ref().unwrap(), "running").unwrap();
        assert!(!FileProbe.probe(&gated).await.ready);
        std::fs::write(gated.status_file.as_ref().unwrap(), r#"{"status":"complete"}"#).unwrap();
        assert!(FileProbe.probe(&gated).await.ready);
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_ready() {
        let probe = CountdownProbe {
            calls: AtomicU32::new(0),
            ready_after: 3,
        };
        let specs = vec![spec(&PathBuf::from("/tmp"), "d1", false)];
        let wait = WaitConfig {
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(5),
        };
        let statuses = wait_for_detectors(&probe, &specs, wait, &CancellationToken::new())
            .await
            .unwrap();
        assert!(statuses[0].ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_times_out_listing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let ready = spec(dir.path(), "ready", false);
        std::fs::write(&ready.output_file, "{}\n").unwrap();
        let specs = vec![ready, spec(dir.path(), "slow_a", false), spec(dir.path(), "slow_b", false)];
        let wait = WaitConfig {
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_millis(20),
        };

        let err = wait_for_detectors(&FileProbe, &specs, wait, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RiskError::MissingData { detectors } => {
                assert_eq!(detectors, vec!["slow_a".to_string(), "slow_b".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![spec(dir.path(), "never", false)];
        let wait = WaitConfig {
            poll_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(600),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = wait_for_detectors(&FileProbe, &specs, wait, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::Cancelled));
    }
}
