//! CLI Entry Point for rust_vna
//!
//! Drives an HP 8751A through a Prologix GPIB-Ethernet bridge:
//! - `identify`: print the instrument identification
//! - `init`: apply the transfer-function (default) or impedance measurement function
//! - `sweep`: run one sweep, or `N` continuous passes, and print the traces
//! - `calibrate`: run one step of a one-port calibration
//!
//! # Usage
//!
//! ```bash
//! rust_vna --config config/vna.toml identify
//! rust_vna init --impedance
//! rust_vna sweep --continuous 3
//! rust_vna calibrate open
//! ```
//!
//! Logs go to stderr, measurement data to stdout.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_vna::config::VnaConfig;
use rust_vna::instrument::{Hp8751a, InstrumentEvent};
use rust_vna::protocol::command::{CalibrationStep, MeasurementSetup};
use rust_vna::sweep::{SweepMode, SweepResult};
use rust_vna::tracing_init;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_vna")]
#[command(
    about = "HP 8751A network analyzer over a Prologix GPIB-Ethernet bridge",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to config/vna.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identification string
    Identify,

    /// Put the instrument into a known measurement configuration
    Init {
        /// Impedance measurement instead of transfer function
        #[arg(long)]
        impedance: bool,
    },

    /// Run a sweep with the configured parameters and print the traces
    Sweep {
        /// Number of continuous passes instead of a single sweep
        #[arg(long, value_name = "N")]
        continuous: Option<u32>,
    },

    /// Run one step of a one-port calibration
    Calibrate {
        /// Calibration step
        #[arg(value_enum)]
        step: Step,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Step {
    Begin,
    Open,
    Short,
    Load,
    Save,
}

impl From<Step> for CalibrationStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Begin => CalibrationStep::Begin,
            Step::Open => CalibrationStep::Open,
            Step::Short => CalibrationStep::Short,
            Step::Load => CalibrationStep::Load,
            Step::Save => CalibrationStep::Save,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VnaConfig::load_from(path),
        None => VnaConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    tracing_init::init_from_config(&config).context("Failed to initialize logging")?;

    let vna = Hp8751a::connect(&config).await.with_context(|| {
        format!(
            "Failed to connect to GPIB bridge at {}:{}",
            config.bridge.host, config.bridge.port
        )
    })?;

    let result = run(&vna, cli.command).await;
    vna.shutdown().await;
    result
}

async fn run(vna: &Hp8751a, command: Commands) -> Result<()> {
    match command {
        Commands::Identify => {
            let id = vna.identify().await.context("Identification failed")?;
            println!("{id}");
        }
        Commands::Init { impedance } => {
            let setup = if impedance {
                MeasurementSetup::impedance()
            } else {
                MeasurementSetup::transfer_function()
            };
            vna.initialize(setup)
                .await
                .context("Initialization failed")?;
            info!(impedance, "Instrument initialized");
        }
        Commands::Sweep { continuous: None } => {
            let result = tokio::select! {
                result = vna.measure() => result.context("Sweep failed")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling sweep");
                    vna.cancel_sweep().await?;
                    None
                }
            };
            match result {
                Some(result) => print_result(&result),
                None => warn!("Sweep cancelled"),
            }
        }
        Commands::Sweep {
            continuous: Some(passes),
        } => continuous_sweep(vna, passes.max(1)).await?,
        Commands::Calibrate { step } => {
            vna.calibrate(step.into())
                .await
                .context("Calibration step failed")?;
            info!("Calibration step done");
        }
    }
    Ok(())
}

async fn continuous_sweep(vna: &Hp8751a, passes: u32) -> Result<()> {
    let mut events = vna.subscribe();
    vna.start_sweep(SweepMode::Continuous).await?;
    if passes == 1 {
        vna.finish_continuous().await?;
    }

    let mut done = 0;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling sweep");
                vna.cancel_sweep().await?;
                continue;
            }
        };
        match event {
            Ok(InstrumentEvent::SweepComplete(result)) => {
                done += 1;
                println!("# pass {done}");
                print_result(&result);
                if done == passes {
                    return Ok(());
                }
                if done + 1 == passes {
                    vna.finish_continuous().await?;
                }
            }
            Ok(InstrumentEvent::SweepAborted { state, error }) => {
                return Err(error).with_context(|| format!("Sweep aborted in {state}"));
            }
            Ok(InstrumentEvent::SweepCancelled) => {
                warn!(passes = done, "Sweep cancelled");
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed instrument events"),
            Err(RecvError::Closed) => bail!("Instrument task stopped"),
        }
    }
}

fn print_result(result: &SweepResult) {
    println!(
        "# channel 1 scale {} reference {}",
        result.channel1_scale.scale, result.channel1_scale.reference
    );
    println!(
        "# channel 2 scale {} reference {}",
        result.channel2_scale.scale, result.channel2_scale.reference
    );
    println!("# frequency_hz\tchannel1\tchannel2");
    for (frequency, channel1, channel2) in result.rows() {
        println!("{frequency}\t{channel1}\t{channel2}");
    }
}
