//! Riskfuse CLI
//!
//! Fuses independent risk detectors into one calibrated score per entity.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use riskfuse_core::ConfidenceLevel;
use riskfuse_runtime::{Orchestrator, PipelineConfig, RunOutcome};

#[derive(Parser)]
#[command(name = "riskfuse")]
#[command(author, version, about = "Riskfuse: calibrated multi-detector entity risk fusion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: wait, correlate, calibrate, merge, fuse, summarize
    Run {
        /// Pipeline configuration (TOML)
        #[arg(short, long, default_value = "riskfuse.toml")]
        config: PathBuf,

        /// Check detector readiness once instead of polling
        #[arg(long)]
        no_wait: bool,

        /// Maximum seconds to wait for detectors
        #[arg(long)]
        max_wait: Option<u64>,

        /// Override the artifact directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Show readiness of every registered detector
    Status {
        /// Pipeline configuration (TOML)
        #[arg(short, long, default_value = "riskfuse.toml")]
        config: PathBuf,
    },

    /// Score detectors against the gold set and write calibrations only
    Calibrate {
        /// Pipeline configuration (TOML)
        #[arg(short, long, default_value = "riskfuse.toml")]
        config: PathBuf,

        /// Check detector readiness once instead of polling
        #[arg(long)]
        no_wait: bool,

        /// Override the artifact directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Commands::Run {
            config,
            no_wait,
            max_wait,
            output_dir,
        } => {
            let config = load_config(&config, no_wait, max_wait, output_dir)?;
            run_pipeline(config).await?;
        }
        Commands::Status { config } => {
            let config = load_config(&config, true, None, None)?;
            check_status(config).await?;
        }
        Commands::Calibrate {
            config,
            no_wait,
            output_dir,
        } => {
            let config = load_config(&config, no_wait, None, output_dir)?;
            run_calibration(config).await?;
        }
    }

    Ok(())
}

fn load_config(
    path: &Path,
    no_wait: bool,
    max_wait: Option<u64>,
    output_dir: Option<PathBuf>,
) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    if no_wait {
        config.wait.enabled = false;
    }
    if let Some(secs) = max_wait {
        config.wait.max_wait_secs = secs;
    }
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    config.validate()?;
    Ok(config)
}

/// Orchestrator whose run is cancelled on Ctrl-C
fn orchestrator(config: PipelineConfig) -> Result<Orchestrator> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });
    Ok(Orchestrator::new(config)?.with_cancellation(cancel))
}

async fn run_pipeline(config: PipelineConfig) -> Result<()> {
    println!("🧮 Riskfuse - Multi-Detector Entity Risk Fusion\n");
    println!("📋 Registry: {}", config.registry.display());
    println!("🏷️  Gold set: {}", config.gold_set.display());
    println!("📂 Output: {}", config.output_dir.display());
    println!(
        "⏱️  Wait: {}\n",
        if config.wait.enabled {
            format!("up to {}s", config.wait.max_wait_secs)
        } else {
            "disabled".to_string()
        }
    );

    let artifacts = config.artifacts();
    let outcome = match orchestrator(config)?.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("\n❌ {} ({})", e, e.kind());
            println!("   Error log: {}", artifacts.error_log.display());
            return Err(e.into());
        }
    };

    print_calibrations(&outcome);

    println!("\n📊 Risk distribution:");
    for level in [
        ConfidenceLevel::Critical,
        ConfidenceLevel::High,
        ConfidenceLevel::Medium,
        ConfidenceLevel::Low,
        ConfidenceLevel::Minimal,
        ConfidenceLevel::None,
    ] {
        let count = outcome
            .report
            .level_counts
            .get(&level.to_string())
            .copied()
            .unwrap_or(0);
        println!("   {:<8} {}", level.to_string(), count);
    }

    println!("\n✅ Run {} complete", outcome.report.run_id);
    println!("📄 Fused entities: {}", artifacts.fused.display());
    println!("📄 Summary: {}", artifacts.summary.display());
    Ok(())
}

async fn run_calibration(config: PipelineConfig) -> Result<()> {
    println!("🧮 Riskfuse - Detector Calibration\n");

    let artifacts = config.artifacts();
    let outcome = match orchestrator(config)?.calibrate().await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("\n❌ {} ({})", e, e.kind());
            println!("   Error log: {}", artifacts.error_log.display());
            return Err(e.into());
        }
    };

    print_calibrations(&outcome);
    println!("\n✅ Calibration saved to: {}", artifacts.calibration.display());
    Ok(())
}

fn print_calibrations(outcome: &RunOutcome) {
    println!("🎯 Detector calibration:");
    for c in &outcome.calibrations {
        let fallback = if outcome.report.fallback_detectors.contains(&c.detector_id) {
            " (fallback)"
        } else {
            ""
        };
        println!(
            "   {} v{}: TPR {:.3} | FPR {:.3} | LR+ {:.2}{}",
            c.detector_id,
            c.version,
            c.true_positive_rate,
            c.false_positive_rate,
            c.positive_likelihood_ratio(),
            fallback
        );
    }
    if outcome.report.malformed_total() > 0 {
        println!(
            "⚠️  {} malformed detector records skipped",
            outcome.report.malformed_total()
        );
    }
}

async fn check_status(config: PipelineConfig) -> Result<()> {
    println!("🔌 Checking detector readiness...\n");

    let statuses = Orchestrator::new(config)?.status().await?;
    let ready = statuses.iter().filter(|s| s.ready).count();

    for status in &statuses {
        if status.ready {
            println!("✅ {}", status.detector_id);
        } else {
            println!(
                "❌ {}: {}",
                status.detector_id,
                status.reason.as_deref().unwrap_or("not ready")
            );
        }
    }
    println!("\n{}/{} detectors ready", ready, statuses.len());

    Ok(())
}
