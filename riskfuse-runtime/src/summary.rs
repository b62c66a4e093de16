//! Markdown run summary
//!
//! Per-detector performance table, calibration block ready to paste into
//! config, redundant detector pairs and the fused risk distribution.

use std::fmt::Write;

use riskfuse_core::{
    ConfidenceLevel, CorrelationMatrix, DetectorCalibration, Entity, PerformanceReport,
};

use crate::RunReport;

/// Number of highest-risk entities listed
const TOP_ENTITIES: usize = 20;

/// Inputs for the summary; absent sections are omitted
pub struct SummaryInput<'a> {
    pub report: &'a RunReport,
    pub performance: &'a [PerformanceReport],
    pub calibrations: &'a [DetectorCalibration],
    pub correlation: Option<&'a CorrelationMatrix>,
    pub correlation_threshold: f64,
    pub fused: &'a [Entity],
}

fn ratio(value: f64) -> String {
    format!("{:.3}", value)
}

pub fn render_summary(input: &SummaryInput<'_>) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Entity Risk Fusion Summary\n");
    let _ = writeln!(md, "- Run: `{}`", input.report.run_id);
    let _ = writeln!(md, "- Started: {}", input.report.started_at.to_rfc3339());
    let _ = writeln!(md, "- Malformed records skipped: {}", input.report.malformed_total());
    if !input.report.fallback_detectors.is_empty() {
        let _ = writeln!(
            md,
            "- Fallback calibrations: {}",
            input.report.fallback_detectors.join(", ")
        );
    }
    md.push('\n');

    if !input.performance.is_empty() {
        let _ = writeln!(md, "## Detector Performance\n");
        let _ = writeln!(
            md,
            "| Detector | Version | N | TP | FP | TN | FN | TPR | FPR | Precision | F1 | MCC | Kappa | AUC | LR+ | LR- |"
        );
        let _ = writeln!(
            md,
            "|---|---|---|---|---|---|---|---|---|---|---|---|---|---|---|---|"
        );
        for r in input.performance {
            let m = &r.metrics;
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {:.2} | {:.3} |",
                r.detector_id,
                r.version,
                r.sample_size,
                r.confusion.tp,
                r.confusion.fp,
                r.confusion.tn,
                r.confusion.fn_,
                ratio(m.tpr),
                ratio(m.fpr),
                ratio(m.precision),
                ratio(m.f1),
                ratio(m.mcc),
                ratio(m.kappa),
                m.auc.map(ratio).unwrap_or_else(|| "n/a".to_string()),
                m.lr_positive,
                m.lr_negative,
            );
        }
        md.push('\n');
    }

    if !input.calibrations.is_empty() {
        let _ = writeln!(md, "## Calibration\n");
        let _ = writeln!(md, "```json");
        let _ = writeln!(
            md,
            "{}",
            serde_json::to_string_pretty(input.calibrations).unwrap_or_default()
        );
        let _ = writeln!(md, "```\n");
    }

    if let Some(matrix) = input.correlation {
        let _ = writeln!(md, "## Detector Agreement\n");
        let _ = writeln!(md, "| Detector A | Detector B | Agree | Disagree | Rate | Redundant |");
        let _ = writeln!(md, "|---|---|---|---|---|---|");
        for edge in matrix.edges() {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} | {} |",
                edge.detector_a,
                edge.detector_b,
                edge.agree_count,
                edge.disagree_count,
                ratio(edge.agreement_rate),
                if edge.agreement_rate > input.correlation_threshold {
                    "yes"
                } else {
                    ""
                }
            );
        }
        md.push('\n');
    }

    if !input.fused.is_empty() {
        let _ = writeln!(md, "## Fused Risk Distribution\n");
        let _ = writeln!(md, "| Level | Entities |");
        let _ = writeln!(md, "|---|---|");
        for level in [
            ConfidenceLevel::Critical,
            ConfidenceLevel::High,
            ConfidenceLevel::Medium,
            ConfidenceLevel::Low,
            ConfidenceLevel::Minimal,
            ConfidenceLevel::None,
        ] {
            let count = input
                .fused
                .iter()
                .filter(|e| e.fused_confidence_level == Some(level))
                .count();
            let _ = writeln!(md, "| {} | {} |", level, count);
        }
        md.push('\n');

        let mut ranked: Vec<&Entity> = input.fused.iter().collect();
        ranked.sort_by(|a, b| {
            b.fused_posterior
                .unwrap_or(0.0)
                .total_cmp(&a.fused_posterior.unwrap_or(0.0))
                .then(a.entity_id.cmp(&b.entity_id))
        });

        let _ = writeln!(md, "## Highest Risk Entities\n");
        let _ = writeln!(md, "| Entity | Country | Posterior | Level | Fired |");
        let _ = writeln!(md, "|---|---|---|---|---|");
        for entity in ranked.into_iter().take(TOP_ENTITIES) {
            let fired: Vec<&str> = entity
                .fired_detectors()
                .map(|d| d.detector_id.as_str())
                .collect();
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} |",
                entity.canonical_name,
                entity.country_code.as_deref().unwrap_or("-"),
                ratio(entity.fused_posterior.unwrap_or(0.0)),
                entity
                    .fused_confidence_level
                    .map(|l| l.to_string())
                    .unwrap_or_default(),
                fired.join(", ")
            );
        }
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskfuse_core::{
        evaluate_detector, CorrelationEdge, GoldSet, GoldSetEntity, ConfidenceLabel, Provenance,
        RiskLabel,
    };
    use uuid::Uuid;

    #[test]
    fn test_summary_sections() {
        let report = RunReport::new(Uuid::new_v4());
        let gold = GoldSet::new(vec![GoldSetEntity::new(
            "Acme",
            None,
            RiskLabel::High,
            ConfidenceLabel::Verified,
            Provenance::default(),
        )
        .unwrap()]);
        let performance = vec![evaluate_detector(&gold, "bis", "1", &[])];
        let matrix = CorrelationMatrix::from_edges(vec![CorrelationEdge {
            detector_a: "bis".to_string(),
            detector_b: "trade".to_string(),
            agree_count: 95,
            disagree_count: 5,
            agreement_rate: 0.95,
        }]);

        let md = render_summary(&SummaryInput {
            report: &report,
            performance: &performance,
            calibrations: &[],
            correlation: Some(&matrix),
            correlation_threshold: 0.85,
            fused: &[],
        });

        assert!(md.contains("## Detector Performance"));
        assert!(md.contains("| bis | 1 | 1 |"));
        // Single-class gold set has no AUC
        assert!(md.contains("n/a"));
        assert!(md.contains("| bis | trade | 95 | 5 | 0.950 | yes |"));
        assert!(!md.contains("## Fused Risk Distribution"));
    }
}
