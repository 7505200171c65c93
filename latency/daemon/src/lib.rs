//! Packet Latency Library
//!
//! Correlates the same packet seen at several capture points (trace events on
//! two network devices, or ICMP echo captures) and reports per-leg latency.
//! Echo sessions of a single ping process can also be timed at its syscalls.

pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod packet;
pub mod parser;
pub mod report;
pub mod runtime;
pub mod session;
pub mod table;
pub mod types;

pub use collector::LatencyCollector;
pub use config::ProbeConfig;
pub use events::{spawn_progress_reporter, spawn_reporter, PacketDriver, TraceDriver};
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter};
pub use report::ReportSink;
pub use session::{SessionDriver, SessionRecord, SessionReport, SessionStats, SessionTracker};
pub use table::CorrelationTable;
pub use types::*;
