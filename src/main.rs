//! Command-line entry point for the test bench engine.
//!
//! ```bash
//! cryo_bench position
//! cryo_bench home --axes xy
//! cryo_bench move --x 10 --y -5 --z 90
//! cryo_bench sample --mean -23.5 --noise 0.2
//! cryo_bench --simulated scan
//! ```
//!
//! The motion backend, averaging and scan plan come from the configuration
//! file (see `config`). Ctrl-C during a scan stops it and halts the stage.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cryo_bench::config::{BenchConfig, MotionBackend, DEFAULT_CONFIG_FILE};
use cryo_bench::instrument::NoisySource;
use cryo_bench::motion::{self, Axes, MotionDevice, MotorPosition};
use cryo_bench::sampling::averaging_read;
use cryo_bench::scan::{CenterPowerCheck, ScanOrchestrator};
use cryo_bench::{logging, StopSignal};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cryo_bench")]
#[command(about = "Convergence and motion control for the receiver test bench", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Use the simulated stage regardless of configuration
    #[arg(long, global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stage position and axis status
    Position,

    /// Home the given axes
    Home {
        /// Any of x, y, z
        #[arg(long, default_value = "xy")]
        axes: Axes,
    },

    /// Move to an absolute position and wait for arrival
    Move {
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,
        #[arg(long, default_value_t = 0.0)]
        z: f64,
        /// Emit measurement triggers during the move
        #[arg(long)]
        trigger: bool,
    },

    /// Averaging read from a simulated power meter with the configured rules
    Sample {
        #[arg(long, default_value_t = 0.0)]
        mean: f64,
        #[arg(long, default_value_t = 0.1)]
        noise: f64,
        /// Time per reading in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
    },

    /// Run the configured scan plan
    Scan,
}

#[derive(Serialize)]
struct PositionReport {
    position: MotorPosition,
    status: cryo_bench::motion::MotorStatus,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulated {
        config.motion.backend = MotionBackend::Simulated;
    }
    logging::init(&config.logging);

    match cli.command {
        Commands::Position => {
            let stage = motion::connect(&config.motion).await?;
            let report = PositionReport {
                position: stage.position().await?,
                status: stage.status().await?,
            };
            print_json(&report)
        }
        Commands::Home { axes } => {
            let stage = motion::connect(&config.motion).await?;
            stage.home(axes).await?;
            info!(?axes, "homing started");
            Ok(())
        }
        Commands::Move { x, y, z, trigger } => {
            let stage = motion::connect(&config.motion).await?;
            let stop = StopSignal::new();
            let target = MotorPosition::new(x, y, z);
            let status = stage.move_to(target, trigger, &stop).await?;
            print_json(&status)?;
            if !status.success {
                bail!("move to {} failed: {}", target, status.describe());
            }
            Ok(())
        }
        Commands::Sample {
            mean,
            noise,
            latency_ms,
        } => {
            let source =
                NoisySource::new(mean, noise).with_latency(Duration::from_millis(latency_ms));
            let result = averaging_read(&config.sampling, &source).await?;
            print_json(&result)
        }
        Commands::Scan => run_scan(config).await,
    }
}

async fn run_scan(config: BenchConfig) -> Result<()> {
    let plan: Vec<_> = config.enabled_items().cloned().collect();
    if plan.is_empty() {
        bail!("no enabled [[plan]] items in the configuration");
    }

    let stage: Arc<dyn MotionDevice> = motion::connect(&config.motion).await?;
    // Power meter drivers are wired in by the bench application; the CLI
    // reads a simulated meter at the center.
    let hooks = Arc::new(CenterPowerCheck::new(
        NoisySource::new(-20.0, 0.05).with_latency(Duration::from_millis(20)),
        config.scan.center,
        config.sampling,
    ));
    let scan = Arc::new(ScanOrchestrator::new(stage, hooks, config.scan.clone())?);

    let Some(done) = scan.start(plan)? else {
        bail!("a scan is already running");
    };

    let stopper = Arc::clone(&scan);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            if let Err(e) = stopper.stop().await {
                warn!(error = %e, "hardware stop failed");
            }
        }
    });

    let report = done.await.context("scan worker ended without a report")?;
    ctrl_c.abort();
    print_json(&report)?;
    if let Some(error) = report.error {
        bail!("scan aborted: {}", error);
    }
    Ok(())
}
