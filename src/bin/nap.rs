//! Nap CLI - Command-line interface for Synheart Nap
//!
//! Commands:
//! - classify: Replay recorded sensor samples through a standalone engine
//! - simulate: Run a sensor and a controller against each other over a lossy link
//! - config: Print or validate an engine configuration

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use synheart_nap::orchestrator::{OrchestratorEvent, SessionOrchestrator};
use synheart_nap::types::{NapSession, Role, SensorSample};
use synheart_nap::{NapConfig, NapError, NAP_VERSION, PRODUCER_NAME};

/// Nap - On-device nap detection and nap session engine
#[derive(Parser)]
#[command(name = "nap")]
#[command(author = "Synheart AI Inc")]
#[command(version = NAP_VERSION)]
#[command(about = "Detect sleep onset and run nap sessions from wearable signals", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay NDJSON sensor samples and print engine events as NDJSON
    Classify {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Schedule a nap of this many minutes at the first sample
        #[arg(long)]
        nap_minutes: Option<u64>,

        /// Flush output after each record
        #[arg(long, default_value = "true")]
        flush: bool,
    },

    /// Simulate a sensor and a controller completing a nap over a lossy link
    Simulate {
        /// Requested nap length in minutes
        #[arg(long, default_value = "20")]
        nap_minutes: u64,

        /// Seconds of restless signal before the wearer falls asleep
        #[arg(long, default_value = "300")]
        fall_asleep_after: i64,

        /// Wake up (restless signal again) this many seconds after falling asleep
        #[arg(long)]
        wake_after: Option<i64>,

        /// Seconds between sensor samples
        #[arg(long, default_value = "5")]
        sample_interval: i64,

        /// Drop every Nth frame in each direction (0 = lossless)
        #[arg(long, default_value = "0")]
        drop_every: usize,

        /// Print every engine event as NDJSON, not just the summary
        #[arg(long)]
        events: bool,
    },

    /// Print the effective configuration after validation
    Config,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable. `NAP_LOG` takes
/// precedence over `RUST_LOG`.
fn init_logging() {
    let filter = EnvFilter::try_from_env("NAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), NapCliError> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Classify {
            input,
            nap_minutes,
            flush,
        } => cmd_classify(config, &input, nap_minutes, flush),
        Commands::Simulate {
            nap_minutes,
            fall_asleep_after,
            wake_after,
            sample_interval,
            drop_every,
            events,
        } => cmd_simulate(
            config,
            SimulationPlan {
                nap_minutes,
                fall_asleep_after,
                wake_after,
                sample_interval,
                drop_every,
            },
            events,
        ),
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<NapConfig, NapCliError> {
    match path {
        Some(path) => Ok(NapConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(NapConfig::default()),
    }
}

fn cmd_classify(
    config: NapConfig,
    input: &Path,
    nap_minutes: Option<u64>,
    flush: bool,
) -> Result<(), NapCliError> {
    let reader: Box<dyn BufRead> = if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            eprintln!("Reading samples from stdin (one JSON object per line, Ctrl-D to end)");
        }
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(fs::File::open(input)?))
    };

    let mut stdout = io::stdout();
    let mut orchestrator: Option<SessionOrchestrator> = None;
    let mut count = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let sample: SensorSample = serde_json::from_str(trimmed).map_err(|e| {
            NapCliError::ParseError(format!("Failed to parse sample on line {}: {}", index + 1, e))
        })?;
        let now = sample.timestamp;

        // The engine's clock starts at the first sample
        if orchestrator.is_none() {
            let mut engine = SessionOrchestrator::new(Role::Standalone, config.clone(), now)?;
            if let Some(minutes) = nap_minutes {
                engine.schedule_nap(Some(minutes * 60), now)?;
            }
            orchestrator = Some(engine);
        }
        let Some(engine) = orchestrator.as_mut() else {
            continue;
        };

        engine.tick(now)?;
        engine.ingest_sample(sample, now)?;
        for event in engine.drain_events() {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        }
        if flush {
            stdout.flush()?;
        }
        count += 1;
    }

    if count == 0 {
        return Err(NapCliError::NoSamples);
    }
    Ok(())
}

struct SimulationPlan {
    nap_minutes: u64,
    fall_asleep_after: i64,
    wake_after: Option<i64>,
    sample_interval: i64,
    drop_every: usize,
}

impl SimulationPlan {
    /// Synthetic wrist reading `elapsed` seconds into the simulation
    fn sample_at(&self, start: DateTime<Utc>, elapsed: i64) -> SensorSample {
        let asleep = elapsed >= self.fall_asleep_after
            && self
                .wake_after
                .map_or(true, |wake| elapsed < self.fall_asleep_after + wake);
        // Small deterministic jitter so windows are not perfectly flat
        let jitter = ((elapsed / self.sample_interval.max(1)) % 5) as f64 - 2.0;
        let at = start + Duration::seconds(elapsed);
        if asleep {
            SensorSample::new(at, 52.0 + jitter, 75.0 + jitter, 0.1)
        } else {
            SensorSample::new(at, 88.0 + jitter, 28.0 + jitter, 4.5)
        }
    }
}

/// Lossy in-process transport between the two orchestrators
#[derive(Default, serde::Serialize)]
struct WireStats {
    delivered: usize,
    dropped: usize,
}

impl WireStats {
    fn carry(
        &mut self,
        from: &mut SessionOrchestrator,
        to: &mut SessionOrchestrator,
        drop_every: usize,
        now: DateTime<Utc>,
    ) -> Result<(), NapCliError> {
        for frame in from.drain_outbound() {
            let seen = self.delivered + self.dropped + 1;
            if drop_every > 0 && seen % drop_every == 0 {
                self.dropped += 1;
                continue;
            }
            self.delivered += 1;
            to.receive_frame(&frame, now)?;
        }
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct SimulationReport {
    producer: &'static str,
    version: &'static str,
    elapsed_secs: i64,
    sensor: Option<NapSession>,
    controller: Option<NapSession>,
    sensor_to_controller: WireStats,
    controller_to_sensor: WireStats,
}

fn cmd_simulate(config: NapConfig, plan: SimulationPlan, print_events: bool) -> Result<(), NapCliError> {
    if plan.sample_interval <= 0 {
        return Err(NapCliError::ParseError(
            "sample-interval must be positive".to_string(),
        ));
    }
    let start = Utc::now();
    let mut sensor = SessionOrchestrator::new(Role::Sensor, config.clone(), start)?;
    let mut controller = SessionOrchestrator::new(Role::Controller, config.clone(), start)?;
    let mut up = WireStats::default();
    let mut down = WireStats::default();
    let mut stdout = io::stdout();

    controller.schedule_nap(Some(plan.nap_minutes * 60), start)?;

    // Leave room for the longest possible session plus link grace
    let limit = config.max_nap_duration_secs as i64 * 2 + 600;
    let mut elapsed = 0;
    while elapsed <= limit {
        let now = start + Duration::seconds(elapsed);
        sensor.ingest_sample(plan.sample_at(start, elapsed), now)?;
        sensor.tick(now)?;
        controller.tick(now)?;

        down.carry(&mut controller, &mut sensor, plan.drop_every, now)?;
        up.carry(&mut sensor, &mut controller, plan.drop_every, now)?;
        down.carry(&mut controller, &mut sensor, plan.drop_every, now)?;

        for (side, engine) in [("sensor", &mut sensor), ("controller", &mut controller)] {
            let events = engine.drain_events();
            if print_events {
                for event in events {
                    let line = serde_json::json!({
                        "elapsed_secs": elapsed,
                        "side": side,
                        "event": event,
                    });
                    writeln!(stdout, "{line}")?;
                }
            } else {
                log_session_events(side, &events);
            }
        }

        let finished = |engine: &SessionOrchestrator| engine.session().is_some_and(|s| !s.is_active());
        if finished(&sensor) && finished(&controller) {
            break;
        }
        elapsed += plan.sample_interval;
    }

    let report = SimulationReport {
        producer: PRODUCER_NAME,
        version: NAP_VERSION,
        elapsed_secs: elapsed,
        sensor: sensor.session().cloned(),
        controller: controller.session().cloned(),
        sensor_to_controller: up,
        controller_to_sensor: down,
    };
    writeln!(stdout, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

fn log_session_events(side: &str, events: &[OrchestratorEvent]) {
    for event in events {
        if let OrchestratorEvent::Session(transition) = event {
            tracing::info!(
                side,
                to = transition.to.as_str(),
                reason = ?transition.reason,
                "simulated transition"
            );
        }
    }
}

fn cmd_config(config: &NapConfig) -> Result<(), NapCliError> {
    println!("{}", config.to_json()?);
    Ok(())
}

// Error types

#[derive(Debug)]
enum NapCliError {
    Io(io::Error),
    Nap(NapError),
    Json(serde_json::Error),
    ParseError(String),
    NoSamples,
}

impl From<io::Error> for NapCliError {
    fn from(e: io::Error) -> Self {
        NapCliError::Io(e)
    }
}

impl From<NapError> for NapCliError {
    fn from(e: NapError) -> Self {
        NapCliError::Nap(e)
    }
}

impl From<serde_json::Error> for NapCliError {
    fn from(e: serde_json::Error) -> Self {
        NapCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<NapCliError> for CliError {
    fn from(e: NapCliError) -> Self {
        match e {
            NapCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            NapCliError::Nap(NapError::InvalidConfig(msg)) => CliError {
                code: "INVALID_CONFIG".to_string(),
                message: msg,
                hint: Some("Run 'nap config' to see the defaults".to_string()),
            },
            NapCliError::Nap(e @ NapError::OutOfOrderSample { .. }) => CliError {
                code: "OUT_OF_ORDER".to_string(),
                message: e.to_string(),
                hint: Some("Sort samples by timestamp before replaying".to_string()),
            },
            NapCliError::Nap(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            NapCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            NapCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some(
                    "Each line must be {\"timestamp\",\"heart_rate\",\"hrv\",\"motion\"}"
                        .to_string(),
                ),
            },
            NapCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples found in input".to_string(),
                hint: Some("Ensure input is not empty".to_string()),
            },
        }
    }
}
