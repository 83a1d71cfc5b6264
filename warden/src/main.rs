// warden/src/main.rs
//
// Warden daemon. Samples network, system and log telemetry, scores it,
// fuses anomalies into Threats and responds per policy.
//
// Usage:
//   warden                                   # default profile
//   warden --profile production
//   warden --config /etc/warden.json --simulate
//
// Enforcement runs iptables / kill unless --simulate is given or
// response.enforcement_journal is set, in which case commands are written
// to enforcement_commands.jsonl for an external enforcer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::config::PipelineConfig;
use warden::events::Category;
use warden::pipeline::PipelineBuilder;
use warden::response::{CommandEnforcer, Enforcer, JournalEnforcer};
use warden::sampler::{LogSampler, NetworkSampler, SystemSampler};
use warden::scorer::density::DensityScorer;
use warden::scorer::threshold::ThresholdScorer;
use warden::scorer::zscore::ZScoreScorer;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "warden",
    about   = "Autonomous anomaly detection and policy-gated response",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "JSON config file (overrides --profile)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "default",
          help = "Preset: default | development | production | testing")]
    profile: String,

    #[arg(long, help = "Log enforcement commands instead of executing them")]
    simulate: bool,
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("warden=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => PipelineConfig::load(path)?,
        None => PipelineConfig::profile(&cli.profile)?,
    };
    if cli.simulate {
        config.response.simulation_mode = true;
    }

    // The log detector needs a file to tail.
    let log_sampler = match config.detection.log_path.clone() {
        Some(path) => Some(LogSampler::new(&path).with_context(|| format!("opening {}", path.display()))?),
        None => {
            if let Some(d) = config.detection.detectors.get_mut(&Category::Log) {
                if d.enabled {
                    warn!("detection.log_path not set, log detector disabled");
                    d.enabled = false;
                }
            }
            None
        }
    };

    let enforcer: Arc<dyn Enforcer> = match config.response.enforcement_journal {
        Some(ref dir) => Arc::new(JournalEnforcer::new(dir)?),
        None => Arc::new(CommandEnforcer::new(config.response.simulation_mode)),
    };
    info!(
        enforcer = enforcer.name(), simulate = config.response.simulation_mode,
        auto_response = config.response.auto_response, max_severity = config.response.max_severity,
        "warden starting"
    );

    let mut builder = PipelineBuilder::new(config)
        .enforcer(enforcer)
        .sampler(Category::Network, Arc::new(NetworkSampler::new()))
        .sampler(Category::System, Arc::new(SystemSampler::new()))
        .scorer(Category::Network, Arc::new(ZScoreScorer::network()))?
        .scorer(Category::Network, Arc::new(DensityScorer::network()))?
        .scorer(Category::Network, Arc::new(ThresholdScorer::network()))?
        .scorer(Category::System, Arc::new(ZScoreScorer::system()))?
        .scorer(Category::System, Arc::new(DensityScorer::system()))?
        .scorer(Category::System, Arc::new(ThresholdScorer::system()))?
        .scorer(Category::Log, Arc::new(ZScoreScorer::log()))?
        .scorer(Category::Log, Arc::new(ThresholdScorer::log()))?;
    if let Some(sampler) = log_sampler {
        builder = builder.sampler(Category::Log, Arc::new(sampler));
    }

    let pipeline = builder.start()?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    pipeline.shutdown().await;
    Ok(())
}
