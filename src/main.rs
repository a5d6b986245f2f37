use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use ant_hrm::{
    logging, replay, DataSnapshot, HrvSensor, MonitorConfig, ReplayConnector, SerialConnector,
    Supervisor,
};

#[derive(Parser, Debug)]
#[command(name = "ant-hrm", about = "Read heart rate and HRV from an ANT+ strap")]
struct Args {
    /// Serial device of the ANT USB stick (e.g. /dev/ttyUSB0)
    #[arg(long, conflicts_with = "replay")]
    port: Option<String>,
    /// Play a recording (one hex page per line) instead of real hardware
    #[arg(long)]
    replay: Option<PathBuf>,
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// How often to print a snapshot
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    /// Stop after this many seconds (default: run until killed)
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Print snapshots as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    let sensor = if let Some(path) = &args.replay {
        let connector = ReplayConnector::load(path, replay::DEFAULT_INTERVAL, false)
            .with_context(|| format!("failed to read recording {}", path.display()))?;
        info!("replaying {} pages from {}", connector.len(), path.display());
        HrvSensor::new(config.sensor.clone(), connector)
    } else {
        if args.port.is_some() {
            config.serial.path = args.port.clone();
        }
        if config.serial.path.is_none() {
            bail!("no device: pass --port, --replay or set serial.path in the config");
        }
        HrvSensor::new(config.sensor.clone(), SerialConnector::new(config.serial.clone()))
    };

    let supervisor =
        Supervisor::new(config.supervisor.clone(), sensor).context("failed to start supervisor")?;
    supervisor.connect();

    let started = Instant::now();
    let deadline = args.duration_secs.map(Duration::from_secs);
    let interval = Duration::from_millis(args.interval_ms.max(1));

    loop {
        thread::sleep(interval);
        let data = supervisor.snapshot();
        if args.json {
            println!("{}", serde_json::to_string(&data)?);
        } else {
            println!("{}", summary_line(&data));
        }

        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }

    supervisor.shutdown();
    Ok(())
}

fn summary_line(data: &DataSnapshot) -> String {
    let bpm = if data.has_live_heart_rate() {
        format!("{:3} bpm", data.bpm)
    } else {
        "  - bpm".to_string()
    };
    let battery = data
        .battery_volts
        .map(|v| format!(" | battery {v:.2} V ({})", data.battery_state))
        .unwrap_or_default();
    format!(
        "[{}] {} | RR {:4} ms | RMSSD {:6.1} ms ({} beats) | {}{}",
        data.status, bpm, data.rr_ms, data.rmssd_ms, data.rr_count, data.manufacturer, battery
    )
}
