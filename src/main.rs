//! `fly_scan_sim`: run a fly scan against simulated hardware.
//!
//! Documents are printed to stdout as JSON lines; logs go to stderr.
//!
//! ```bash
//! fly_scan_sim --start 20 --stop 10 --num 101 --dwell 0.01
//! RUST_LOG=beamline_daq=debug fly_scan_sim --config config/beamline.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beamline_daq::config::BeamlineConfig;
use beamline_daq::experiment::{Document, FlyScan};
use beamline_daq::hardware::capabilities::{CommandChannel, Flyer, Readable};
use beamline_daq::hardware::mock::{MockCommandChannel, SimMotor, SimSignal};
use beamline_daq::instrument::{AerotechFlyer, DeviceHandle, InstrumentRegistry};

#[derive(Debug, Parser)]
#[command(name = "fly_scan_sim", about = "Fly scan on simulated Aerotech hardware")]
struct Args {
    /// TOML configuration file (built-in simulated beamline if omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Flyer to scan (defaults to the first configured flyer)
    #[arg(long)]
    flyer: Option<String>,

    /// Center of the first pixel
    #[arg(long, default_value_t = 20.0, allow_negative_numbers = true)]
    start: f64,

    /// Center of the last pixel
    #[arg(long, default_value_t = 10.0, allow_negative_numbers = true)]
    stop: f64,

    /// Number of pixels
    #[arg(long, default_value_t = 101)]
    num: usize,

    /// Seconds per pixel
    #[arg(long, default_value_t = 0.01)]
    dwell: f64,

    /// Real seconds per simulated second of motion (0 = instantaneous)
    #[arg(long, default_value_t = 0.0)]
    time_scale: f64,

    /// Overrides the configured log level; RUST_LOG overrides both
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build simulated devices for every configured flyer and baseline signal.
fn build_beamline(
    config: &BeamlineConfig,
    time_scale: f64,
) -> Result<(InstrumentRegistry, Vec<Arc<AerotechFlyer>>)> {
    let registry = InstrumentRegistry::new();
    let mut flyers = Vec::with_capacity(config.flyers.len());

    for flyer_config in &config.flyers {
        let units = flyer_config.engineering_units()?;
        let mut motor = SimMotor::new(flyer_config.name.clone(), units)
            .with_precision(flyer_config.precision)
            .with_time_scale(time_scale);
        if let Some((low, high)) = flyer_config.limits {
            motor = motor.with_limits(low, high);
        }
        let channel: Arc<dyn CommandChannel> = Arc::new(MockCommandChannel::new());
        let flyer = match AerotechFlyer::from_config(
            flyer_config,
            &config.controller,
            Arc::new(motor),
            channel,
        ) {
            Ok(flyer) => Arc::new(flyer),
            Err(err) if !flyer_config.required => {
                warn!(flyer = %flyer_config.name, error = %err, "Skipping optional flyer");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        registry.register(&flyer_config.name, &["flyers"], DeviceHandle::Flyer(flyer.clone()))?;
        flyers.push(flyer);
    }

    for signal_config in &config.baseline {
        let signal = SimSignal::new(signal_config.name.clone(), signal_config.sim_value)
            .with_units(signal_config.units.clone());
        registry.register(
            &signal_config.name,
            &["baseline"],
            DeviceHandle::Signal(Arc::new(signal)),
        )?;
    }

    Ok((registry, flyers))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BeamlineConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let config = BeamlineConfig::default();
            config.validate()?;
            config
        }
    };
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.application.log_level.clone());
    init_tracing(&level);
    info!(application = %config.application.name, flyers = config.flyers.len(), "Starting fly scan simulation");

    let (registry, flyers) = build_beamline(&config, args.time_scale)?;
    let flyer = match &args.flyer {
        Some(name) => flyers
            .iter()
            .find(|flyer| flyer.name() == name.as_str())
            .cloned()
            .with_context(|| format!("no flyer named '{name}' is configured"))?,
        None => flyers
            .first()
            .cloned()
            .context("no flyers configured")?,
    };
    let baseline: Vec<Arc<dyn Readable>> = match registry.findall_signals("baseline") {
        Ok(signals) => signals,
        Err(err) if !err.is_scan_fatal() => {
            warn!(error = %err, "Running without baseline signals");
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    let plan = Arc::new(
        FlyScan::new(flyer, args.start, args.stop, args.num, args.dwell)
            .with_baseline(baseline)
            .with_metadata("application", config.application.name.clone()),
    );

    let (tx, mut rx) = mpsc::channel::<Document>(256);
    let printer = tokio::spawn(async move {
        while let Some(document) = rx.recv().await {
            match serde_json::to_string(&document) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "Could not serialize document"),
            }
        }
    });

    let mut runner = {
        let plan = plan.clone();
        tokio::spawn(async move { plan.run(&tx).await })
    };

    let outcome = tokio::select! {
        joined = &mut runner => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting fly scan");
            plan.abort();
            runner.await?
        }
    };
    printer.await?;

    let summary = outcome?;
    info!(run_uid = %summary.run_uid, events = summary.num_events, exit_status = %summary.exit_status, "Done");
    Ok(())
}
