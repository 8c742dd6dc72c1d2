//! # Rig Core
//!
//! Standalone engine binary with a simulated bench.
//!
//! Loads the engine configuration, wires the scheduler to simulated
//! acquisition and output channels, and runs the timer loop until a
//! shutdown signal (or `--duration`) stops it. Outbound messages are
//! written to stdout as JSON lines; on real hardware the wiring closures
//! are replaced by the shared-memory collaborator.
//!
//! Built with the `rt` feature the loop is paced by
//! `clock_nanosleep(TIMER_ABSTIME)` after memory locking, CPU pinning
//! and `SCHED_FIFO`; without it, plain sleeps approximate the rate.

use clap::Parser;
use rig_common::config::RigConfig;
use rig_common::io::{Lamp, SharedCodeLines, SharedCoprocClock, SharedLamps};
use rig_common::report::{Message, Outbound, SharedOutbound};
use rig_core::critical::Shared;
use rig_core::scheduler::{Scheduler, Wiring};
use rig_core::timer::{TicLoop, rt_setup};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

/// Rig Core — Experiment scheduler and target-evaluation engine
#[derive(Parser, Debug)]
#[command(name = "rig_core")]
#[command(version)]
#[command(about = "Fixed-rate experiment scheduler with a simulated bench")]
struct Args {
    /// Path to the engine configuration TOML.
    #[arg(default_value = "config/rig.toml")]
    config: PathBuf,

    /// Stop after this many seconds (default: run until SIGINT).
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// CPU core to pin the timer thread to (default: 1).
    #[arg(long, default_value_t = 1)]
    cpu_core: usize,

    /// SCHED_FIFO priority (default: 80).
    #[arg(long, default_value_t = 80)]
    rt_priority: i32,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Rig Core v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Rig Core shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = RigConfig::load(&args.config)?;
    info!(
        "Config OK: tic_hz={}, inputs={} ({} digital), outputs={}, code_bits={}",
        config.tic_hz,
        config.input_count(),
        config.digital_inputs,
        config.outputs,
        config.code_bits,
    );

    rt_setup(args.cpu_core, args.rt_priority)?;
    info!(
        "RT setup complete (cpu_core={}, priority={})",
        args.cpu_core, args.rt_priority
    );

    let outbound: SharedOutbound = Arc::new(JsonLineSink);
    let wiring = simulated_wiring(outbound);
    let scheduler = Scheduler::new(&config, wiring)?;
    let engine = Arc::new(Shared::new(scheduler));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let flag = stop.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            flag.store(true, Ordering::SeqCst);
        })?;
    }
    if let Some(seconds) = args.duration {
        let flag = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            flag.store(true, Ordering::SeqCst);
        });
    }

    info!("Entering timer loop");
    let tic_loop = TicLoop::new(engine.clone(), stop, config.timer_hz())?;
    let stats = tic_loop.run()?;

    info!(
        "Timer loop finished: {} periods, avg {}ns, max {}ns, {} overruns",
        stats.period_count,
        stats.avg_period_ns(),
        stats.max_period_ns,
        stats.overruns,
    );
    info!(
        "Final uptime: {:.3}s, timestamp: {}",
        engine.with(|s| s.uptime_seconds()),
        engine.with(|s| s.timestamp()),
    );

    Ok(())
}

/// Simulated bench wiring: digital inputs idle low, analog inputs carry
/// a slow triangle wave, everything outbound goes to the log.
fn simulated_wiring(outbound: SharedOutbound) -> Wiring {
    let started = Instant::now();
    let analog_in = move |channel: u16| -> u16 {
        // One full up-down sweep per ~8 s, phase-shifted per channel.
        let ms = started.elapsed().as_millis() as u32 + u32::from(channel) * 500;
        let phase = (ms / 4) % 2048;
        if phase < 1024 { phase as u16 } else { (2047 - phase) as u16 }
    };

    let code_lines: SharedCodeLines = Arc::new(LoggedLines);
    let lamps: SharedLamps = Arc::new(|lamp: Lamp, on: bool| {
        debug!(?lamp, on, "lamp");
    });

    // A free-running count standing in for the coprocessor's.
    let coproc_count = Arc::new(AtomicI64::new(0));
    let coproc: SharedCoprocClock = {
        let count = coproc_count.clone();
        Arc::new(move || count.fetch_add(1, Ordering::Relaxed))
    };

    Wiring {
        digital_in: Arc::new(|_: u16| 0u16),
        analog_in: Arc::new(analog_in),
        digital_out: Arc::new(|channel: u16, value: u16| {
            debug!(channel, value, "output drive");
        }),
        code_lines,
        lamps,
        coproc,
        outbound,
    }
}

/// Simulated event-code lines: latched codes land in the debug log,
/// strobe edges in the trace log.
struct LoggedLines;

impl rig_common::io::CodeLines for LoggedLines {
    fn set_code(&self, code: u16) {
        debug!(code, "code lines latched");
    }

    fn set_strobe(&self, on: bool) {
        tracing::trace!(on, "strobe");
    }
}

/// Writes each outbound message to stdout as one JSON line.
struct JsonLineSink;

impl Outbound for JsonLineSink {
    fn enqueue(&self, msg: Message) -> bool {
        match serde_json::to_string(&msg) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}").is_ok()
            }
            Err(e) => {
                error!("outbound serialization failed: {e}");
                false
            }
        }
    }
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}
