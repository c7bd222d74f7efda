// src/main.rs - clockwatch command-line recorder
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

use clockwatch_rs::config::{self, Config};
use clockwatch_rs::engine::Recorder;
use clockwatch_rs::engine::averaging::{AveragedReadings, AveragingEngine};
use clockwatch_rs::history::{self, HistoryRange, LoadReport};
use clockwatch_rs::session::{self, SessionError, SessionHandle};
use clockwatch_rs::sim::{Resonator, ResonatorConfig};
use clockwatch_rs::source::{self, ReplaySource, SampleSource, SimulatedSource};
use clockwatch_rs::Readings;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Balance-wheel encoder recorder
#[derive(Parser, Debug)]
#[command(name = "clockwatch", version, about = "Derives period, amplitude and drift from a balance-wheel encoder.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Append one JSON measurement row per zero crossing to this file
    #[arg(long, global = true)]
    record: Option<PathBuf>,

    /// Append every raw encoder sample to this CSV file
    #[arg(long, global = true)]
    capture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read step frames from the encoder's serial port
    Serial {
        /// Port path, overriding the config file
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Replay a CSV capture or a file of JSON messages
    Replay { file: PathBuf },
    /// Run against the built-in simulated resonator
    Simulate {
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
        /// Stop after this many messages
        #[arg(long)]
        samples: Option<u64>,
        #[arg(long, default_value_t = 135.0)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.4)]
        period: f64,
        #[arg(long, default_value_t = 20.0)]
        drift_ppm: f64,
        /// Do not pace samples in real time
        #[arg(long)]
        fast: bool,
    },
    /// Bulk-load stored records (JSON array or JSON lines) and print the resulting readings
    History {
        file: PathBuf,
        /// Only records from the last N hours
        #[arg(long, conflicts_with_all = ["start", "end"])]
        last_hours: Option<i64>,
        /// Range start, microseconds since the Unix epoch
        #[arg(long, requires = "end")]
        start: Option<i64>,
        #[arg(long, requires = "start")]
        end: Option<i64>,
    },
}

#[derive(Serialize)]
struct TickLine<'a> {
    sequence: u64,
    readings: &'a Readings,
    averaged: &'a AveragedReadings,
}

#[derive(Serialize)]
struct HistoryOutput {
    report: LoadReport,
    readings: Readings,
    averaged: AveragedReadings,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            config::load_config(&path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as BoxError
            })?
        }
        None => Config::default(),
    };
    if let Some(path) = &cli.record {
        config.session.measurements_path = Some(path.display().to_string());
    }
    if let Some(path) = &cli.capture {
        config.session.capture_path = Some(path.display().to_string());
    }

    let source: Box<dyn SampleSource> = match cli.command {
        Commands::Serial { port, baud } => {
            if let Some(port) = port {
                config.source.serial = port;
            }
            if let Some(baud) = baud {
                config.source.baud = baud;
            }
            if config.source.serial.is_empty() {
                tracing::error!("No serial port given on the command line or in [source]");
                return Err("no serial port configured".into());
            }
            Box::new(source::open_serial(&config.source).map_err(|e| {
                tracing::error!("Failed to open serial port '{}': {}", config.source.serial, e);
                Box::new(e) as BoxError
            })?)
        }
        Commands::Replay { file } => {
            let name = file.display().to_string();
            let reader = BufReader::new(tokio::fs::File::open(&file).await?);
            Box::new(ReplaySource::new(reader, &name))
        }
        Commands::Simulate {
            seed,
            samples,
            amplitude,
            period,
            drift_ppm,
            fast,
        } => {
            let resonator = Resonator::new(ResonatorConfig {
                seed,
                amplitude,
                period_secs: period,
                drift_ppm,
                degrees_per_count: config.engine.degrees_per_count,
                ..ResonatorConfig::default()
            });
            let mut simulated = SimulatedSource::new(resonator);
            if let Some(samples) = samples {
                simulated = simulated.limit(samples);
            }
            if !fast {
                simulated = simulated.paced();
            }
            Box::new(simulated)
        }
        Commands::History {
            file,
            last_hours,
            start,
            end,
        } => return run_history(&config, &file, last_hours, start.zip(end)),
    };

    let handle = session::spawn(&config, source);
    let result = run_live(&handle).await;
    handle.shutdown().await?;
    result
}

/// Prints one line per published snapshot and applies stdin control commands.
async fn run_live(handle: &SessionHandle) -> Result<(), BoxError> {
    let mut snapshots = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let line = TickLine {
                    sequence: snapshot.sequence,
                    readings: &snapshot.readings,
                    averaged: &snapshot.averaged,
                };
                println!("{}", serde_json::to_string(&line)?);
                if snapshot.source_finished {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if !control(handle, line.trim()).await? {
                            break;
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }
    Ok(())
}

/// Applies one control command; returns false on `quit`.
async fn control(handle: &SessionHandle, command: &str) -> Result<bool, SessionError> {
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some("tare"), None) => {
            if !handle.tare().await? {
                tracing::warn!("Nothing to tare yet");
            }
        }
        (Some("reset"), None) => handle.reset().await?,
        (Some("avg"), Some("on")) => {
            handle.set_averaging(true, None).await?;
        }
        (Some("avg"), Some("off")) => {
            handle.set_averaging(false, None).await?;
        }
        (Some("avg"), Some(window)) => match window.parse::<usize>() {
            Ok(window) if window > 0 => {
                handle.set_averaging(true, Some(window)).await?;
            }
            _ => tracing::warn!("Invalid averaging window '{}'", window),
        },
        (Some("quit" | "exit"), None) => return Ok(false),
        (None, _) => {}
        _ => tracing::warn!("Unknown command '{}' (tare, reset, avg on|off|<n>, quit)", command),
    }
    Ok(true)
}

fn run_history(
    config: &Config,
    file: &Path,
    last_hours: Option<i64>,
    bounds: Option<(i64, i64)>,
) -> Result<(), BoxError> {
    let text = std::fs::read_to_string(file)?;
    let mut records = history::parse_records(&text)?;

    let range = match (last_hours, bounds) {
        (Some(hours), _) => Some(HistoryRange::last_hours(hours, chrono::Utc::now())?),
        (None, Some((start, end))) => Some(HistoryRange::new(start, end)?),
        (None, None) => None,
    };
    if let Some(range) = range {
        records = history::select_range(&records, &range);
        tracing::info!(
            "{} records between {} and {}",
            records.len(), range.start_micros(), range.end_micros()
        );
    }

    let mut recorder = Recorder::new(config.engine.clone());
    let report = recorder.load_history(&records);
    let mut averaging = AveragingEngine::new(&config.averaging);
    averaging.update(recorder.history(), &config.averaging);

    let output = HistoryOutput {
        report,
        readings: recorder.readings(),
        averaged: averaging.readings(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
