//! Packet Latency - Userspace Program
//!
//! Reads kernel trace output for the outer and inner device, correlates
//! each packet across the pipeline points, prints one line per completed
//! measurement and exports a summary of per-leg means.
//!
//! ## Usage
//!
//! ```bash
//! # Live trace pipe, outbound leg from a container veth to the physical NIC
//! sudo ./pktlat --trace /sys/kernel/tracing/trace_pipe --outer-dev veth0 --inner-dev eth0
//!
//! # Recorded per-cpu traces, inbound leg through a tunnel, Prometheus summary
//! ./pktlat --trace cpu0.txt --trace cpu1.txt --outer-dev tun0 --inner-dev eth0 \
//!     --mode inbound --format prometheus --output latency.prom
//! ```
//!
//! The outer device is the one an outbound packet crosses first. Trace
//! events are keyed by skb address, so only the outbound and inbound modes
//! can complete here.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use pktlat_daemon::{
    collector::LatencyCollector,
    config::ProbeConfig,
    events::{spawn_progress_reporter, spawn_reporter, TraceDriver},
    exporter::ExporterType,
    report::ReportSink,
    runtime,
    table::CorrelationTable,
    types::{CorrelationMode, LatencySummary, Timestamp},
};
use std::{io, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    fs::File,
    io::BufReader,
    signal,
    sync::mpsc,
    task::JoinSet,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

/// Per-packet latency across network devices from kernel trace events
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Trace source to read (repeatable, one driver per source)
    #[clap(short, long = "trace", required = true)]
    traces: Vec<PathBuf>,

    /// Device an outbound packet crosses first (e.g. a container veth)
    #[clap(long)]
    outer_dev: Option<String>,

    /// Device an outbound packet crosses second (e.g. the physical NIC)
    #[clap(long)]
    inner_dev: Option<String>,

    /// Correlation mode (outbound, inbound)
    #[clap(short, long)]
    mode: Option<String>,

    /// Correlation table capacity in slots
    #[clap(long)]
    capacity: Option<usize>,

    /// Offset added to every trace timestamp (SECONDS.MICROS)
    #[clap(long)]
    trace_offset: Option<Timestamp>,

    /// Duration to run (in seconds, 0 = until interrupted or sources end)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Output file for the summary
    #[clap(short, long, default_value = "latency-summary.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Progress reporting interval in seconds (0 disables)
    #[clap(long)]
    progress_interval: Option<u64>,

    /// JSON configuration file; command line flags override its values
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn probe_config(&self) -> Result<ProbeConfig> {
        let mut config = match &self.config {
            Some(path) => ProbeConfig::from_file(path)?,
            None => ProbeConfig::default(),
        };

        if let Some(mode) = &self.mode {
            config.mode = CorrelationMode::from_name(mode).with_context(|| {
                format!("Unsupported mode: {}. Use outbound, inbound, or round-trip", mode)
            })?;
        }
        if let Some(dev) = &self.outer_dev {
            config.outer_device = dev.clone();
        }
        if let Some(dev) = &self.inner_dev {
            config.inner_device = dev.clone();
        }
        if let Some(capacity) = self.capacity {
            config.table_capacity = capacity;
        }
        if let Some(offset) = self.trace_offset {
            config.trace_offset = offset;
        }
        if let Some(interval) = self.progress_interval {
            config.progress_interval = interval;
        }

        config.validate()?;
        config.validate_trace_sources()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let rt = runtime::build()?;
    runtime::run_to_completion(rt, run(args), runtime::SHUTDOWN_GRACE)
}

async fn run(args: Args) -> Result<()> {
    let config = Arc::new(args.probe_config()?);
    let export_format: ExporterType = args.format.parse()?;

    info!("Starting packet latency capture...");
    info!(
        "   Duration: {}",
        if args.duration == 0 {
            "until interrupted".to_string()
        } else {
            format!("{} seconds", args.duration)
        }
    );
    info!("   Mode: {}", config.mode.name());
    info!(
        "   Devices: outer={} inner={}",
        config.outer_device, config.inner_device
    );
    info!("   Table capacity: {}", config.table_capacity);
    info!("   Output: {:?} ({:?})", args.output, export_format);

    // Open every source before starting any driver
    let mut sources = Vec::with_capacity(args.traces.len());
    for path in &args.traces {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open trace source: {:?}", path))?;
        sources.push((path.display().to_string(), BufReader::new(file)));
    }

    let table = Arc::new(CorrelationTable::new(config.table_capacity, config.mode));
    let cancel = CancellationToken::new();
    let (records_tx, records_rx) = mpsc::channel(config.channel_capacity);

    let reporter = spawn_reporter(
        records_rx,
        LatencyCollector::new(config.mode),
        ReportSink::new(io::stdout()),
    );

    let progress = (config.progress_interval > 0).then(|| {
        spawn_progress_reporter(
            Arc::clone(&table),
            config.progress_interval,
            cancel.clone(),
        )
    });

    let mut drivers = JoinSet::new();
    for (name, reader) in sources {
        let driver = TraceDriver::new(
            name,
            reader,
            Arc::clone(&config),
            Arc::clone(&table),
            records_tx.clone(),
        );
        drivers.spawn(driver.run(cancel.clone()));
    }
    // The reporter finishes once every driver has dropped its sender
    drop(records_tx);

    info!("Collecting measurements...");

    let start_time = Instant::now();
    let mut reports = Vec::with_capacity(drivers.len());
    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline, if !cancel.is_cancelled() => {
                info!("Duration reached, shutting down...");
                cancel.cancel();
            }
            _ = signal::ctrl_c(), if !cancel.is_cancelled() => {
                info!("Interrupted, shutting down...");
                cancel.cancel();
            }
            joined = drivers.join_next() => match joined {
                Some(Ok(report)) => reports.push(report),
                Some(Err(e)) => warn!("Driver task failed: {}", e),
                None => break,
            },
        }
    }

    cancel.cancel();
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let elapsed = start_time.elapsed().as_secs();

    let (collector, mut sink) = reporter
        .await
        .context("Reporter task panicked")??;

    info!("Generating latency summary...");

    let summary = collector.report(elapsed, table.stats(), reports);
    sink.write_summary(&summary)
        .context("Failed to write summary")?;

    export_format.exporter(args.output.clone()).export(&summary)?;
    info!("Summary written to {:?}", args.output);

    print_summary(&summary);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║         Packet Latency - Pipeline Probe           ║
║       trace events  ->  per-leg latency           ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(summary: &LatencySummary) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Mode:               {}", summary.mode.name());
    info!("  Total records:      {}", summary.total_records);
    info!("  Duration:           {} seconds", summary.duration_seconds);
    info!("");
    info!("  Mean latency (ms):");
    for leg in &summary.legs {
        info!(
            "    {:<11} {:>10.3}  ({} samples, {} anomalies)",
            leg.leg.name(),
            leg.mean_ms,
            leg.samples,
            leg.anomalies
        );
    }
    info!("");
    info!("  Correlation table:");
    info!("    recorded:   {:>8}", summary.table.recorded);
    info!("    completed:  {:>8}", summary.table.completed);
    info!("    collisions: {:>8}", summary.table.collisions);
    info!("    restarts:   {:>8}", summary.table.restarts);
    info!("    ignored:    {:>8}", summary.table.ignored);
    info!("");
    info!("  Capture points:");
    for driver in &summary.drivers {
        info!(
            "    {}: {} inputs, {} parse errors, {} misses, {} records ({})",
            driver.name,
            driver.inputs,
            driver.parse_errors,
            driver.misses,
            driver.records,
            driver.stop
        );
    }
    info!("");
    info!("============================================");
}
