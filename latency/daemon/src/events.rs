//! Capture-point drivers
//!
//! Each driver owns one observation source, classifies what it reads into a
//! pipeline point and feeds the shared correlation table. Completed records
//! leave through an mpsc channel to a single reporter task, so no driver ever
//! touches the aggregator or the report sink directly.

use crate::{
    collector::LatencyCollector,
    config::ProbeConfig,
    packet::{self, CapturedPacket},
    parser::{self, ParseError, TraceEvent},
    report::ReportSink,
    table::CorrelationTable,
    types::*,
};
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use std::{io::Write, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
    task::JoinHandle,
    time::interval,
};
use tokio_util::sync::CancellationToken;

/// Map a parsed trace line onto a pipeline point
///
/// Returns `None` for unknown devices or events; that is a miss, not an error.
pub fn classify_trace(config: &ProbeConfig, event: &TraceEvent<'_>) -> Option<PipelinePoint> {
    let side = config.device_side(event.dev?)?;
    let direction = event.kind.direction()?;
    Some(PipelinePoint::from_side(side, direction))
}

/// Shared handle every driver uses to submit observations
#[derive(Clone)]
struct Submitter {
    table: Arc<CorrelationTable>,
    records: mpsc::Sender<MeasurementRecord>,
}

impl Submitter {
    /// Record one observation and forward the record it completes
    ///
    /// Returns false once the reporter has gone away.
    async fn submit(
        &self,
        key: CorrelationKey,
        point: PipelinePoint,
        timestamp: Timestamp,
        report: &mut DriverReport,
    ) -> bool {
        let Some(record) = self.table.record(key, point, timestamp) else {
            return true;
        };

        report.records += 1;
        self.records.send(record).await.is_ok()
    }
}

/// Driver over a line-oriented trace source
pub struct TraceDriver<R> {
    name: String,
    reader: R,
    config: Arc<ProbeConfig>,
    submitter: Submitter,
}

impl<R> TraceDriver<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        name: impl Into<String>,
        reader: R,
        config: Arc<ProbeConfig>,
        table: Arc<CorrelationTable>,
        records: mpsc::Sender<MeasurementRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            config,
            submitter: Submitter { table, records },
        }
    }

    /// Read lines until the source ends, fails, or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> DriverReport {
        let mut report = DriverReport::new(self.name.clone());
        let mut line = Vec::with_capacity(512);
        let offset = self.config.trace_offset;

        info!("Trace driver {} started", self.name);

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.stop = StopReason::Cancelled;
                    break;
                }
                read = self.reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => {
                    report.stop = StopReason::SourceExhausted;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Trace driver {}: read failed: {}", self.name, e);
                    report.stop = StopReason::SourceError(e.to_string());
                    break;
                }
            }

            report.inputs += 1;

            let event = match parser::parse(&line) {
                Ok(event) => event,
                Err(ParseError::Empty) => {
                    report.misses += 1;
                    continue;
                }
                Err(e) => {
                    report.parse_errors += 1;
                    debug!("{}: dropping line {}: {}", self.name, report.inputs, e);
                    continue;
                }
            };

            let Some(point) = classify_trace(&self.config, &event) else {
                report.misses += 1;
                continue;
            };
            let Some(key) = event.skbaddr.and_then(CorrelationKey::skb) else {
                report.misses += 1;
                continue;
            };
            let Some(timestamp) = event.timestamp.checked_add(offset) else {
                report.parse_errors += 1;
                continue;
            };

            trace!("{}: {} {} at {}", self.name, key, point, timestamp);

            if !self
                .submitter
                .submit(key, point, timestamp, &mut report)
                .await
            {
                warn!("Trace driver {}: reporter is gone, stopping", self.name);
                report.stop = StopReason::Cancelled;
                break;
            }
        }

        info!("Trace driver {} stopped: {}", self.name, report.stop);
        report
    }
}

/// Driver over frames handed over by a packet capture session
///
/// The session is bound to one device, so every echo it sees is classified
/// by that device's side and the ICMP message direction.
pub struct PacketDriver {
    name: String,
    side: DeviceSide,
    packets: mpsc::Receiver<CapturedPacket>,
    submitter: Submitter,
}

impl PacketDriver {
    pub fn new(
        name: impl Into<String>,
        side: DeviceSide,
        packets: mpsc::Receiver<CapturedPacket>,
        table: Arc<CorrelationTable>,
        records: mpsc::Sender<MeasurementRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            side,
            packets,
            submitter: Submitter { table, records },
        }
    }

    /// Consume packets until the sender hangs up or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> DriverReport {
        let mut report = DriverReport::new(self.name.clone());

        info!("Packet driver {} ({:?}) started", self.name, self.side);

        loop {
            let captured = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.stop = StopReason::Cancelled;
                    break;
                }
                captured = self.packets.recv() => captured,
            };

            let Some(captured) = captured else {
                report.stop = StopReason::SourceClosed;
                break;
            };

            report.inputs += 1;

            let Some(event) =
                packet::extract(captured.timestamp, &captured.data, captured.link_type)
            else {
                report.misses += 1;
                continue;
            };

            let point = PipelinePoint::from_side(self.side, event.kind.direction());
            if !self
                .submitter
                .submit(event.key(), point, event.timestamp, &mut report)
                .await
            {
                warn!("Packet driver {}: reporter is gone, stopping", self.name);
                report.stop = StopReason::Cancelled;
                break;
            }
        }

        info!("Packet driver {} stopped: {}", self.name, report.stop);
        report
    }
}

/// Spawn the task that aggregates and prints completed records
///
/// Runs until every record sender has been dropped, then hands back the
/// collector and sink for the final summary.
pub fn spawn_reporter<W>(
    mut records: mpsc::Receiver<MeasurementRecord>,
    mut collector: LatencyCollector,
    mut sink: ReportSink<W>,
) -> JoinHandle<Result<(LatencyCollector, ReportSink<W>)>>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            collector.observe(&record);
            let seq = sink
                .write_record(&record)
                .context("Failed to write measurement line")?;
            debug!("Record {} completed: {}", seq, record);
        }
        Ok((collector, sink))
    })
}

/// Spawn progress reporter
///
/// Logs table counters every `interval_secs` until `cancel` fires.
pub fn spawn_progress_reporter(
    table: Arc<CorrelationTable>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let stats = table.stats();
            info!(
                "📈 Progress: {} measurements completed, {} in flight, {} collisions, {} restarts",
                stats.completed,
                table.in_flight(),
                stats.collisions,
                stats.restarts
            );
        }
    })
}
