//! Userspace type definitions
//!
//! Defines the records produced by the correlation table and the
//! aggregated structures used for reporting and export.
//!
//! ## Organization
//!
//! - **Shared Types**: value types re-exported from pktlat_common
//! - **Measurement Types**: records emitted once per completed key
//! - **Report Types**: serializable summaries for the exporters

use pktlat_common::{LEG_COUNT, POINT_COUNT};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Shared Types (from pktlat_common)
// ============================================================================

pub use pktlat_common::{
    CorrelationKey, CorrelationMode, DeviceSide, Direction, Latency, Leg, PipelinePoint,
    PointMask, SyscallPoint, Timestamp,
};

// ============================================================================
// Measurement Types
// ============================================================================

/// Completed measurement for one key-cycle
///
/// Emitted exactly once when every point the mode expects has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementRecord {
    pub key: CorrelationKey,
    pub mode: CorrelationMode,
    stamps: [Option<Timestamp>; POINT_COUNT],
    latencies: [Option<Latency>; LEG_COUNT],
}

impl MeasurementRecord {
    /// Build a record and compute every leg the mode measures
    ///
    /// Latency is later-point minus earlier-point by timestamp value,
    /// regardless of the order the observations arrived in.
    pub fn new(
        key: CorrelationKey,
        mode: CorrelationMode,
        stamps: [Option<Timestamp>; POINT_COUNT],
    ) -> Self {
        let mut latencies = [None; LEG_COUNT];
        for &leg in mode.legs() {
            let (from, to) = leg.endpoints();
            if let (Some(start), Some(end)) = (stamps[from.index()], stamps[to.index()]) {
                latencies[leg.index()] = Some(end.elapsed_since(start));
            }
        }

        Self {
            key,
            mode,
            stamps,
            latencies,
        }
    }

    pub fn timestamp(&self, point: PipelinePoint) -> Option<Timestamp> {
        self.stamps[point.index()]
    }

    pub fn latency(&self, leg: Leg) -> Option<Latency> {
        self.latencies[leg.index()]
    }

    /// Legs measured by this record, in `Leg::ALL` order
    pub fn legs(&self) -> impl Iterator<Item = (Leg, Latency)> + '_ {
        Leg::ALL
            .iter()
            .filter_map(move |&leg| self.latency(leg).map(|lat| (leg, lat)))
    }

    /// True when any leg came out negative
    pub fn has_anomaly(&self) -> bool {
        self.legs().any(|(_, lat)| lat.is_negative())
    }
}

impl fmt::Display for MeasurementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key: {}", self.key)?;
        for (leg, latency) in self.legs() {
            write!(f, ", {}: {}", leg, latency)?;
        }
        Ok(())
    }
}

/// Counters kept by the correlation table
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Observations stored into a slot
    pub recorded: u64,
    /// Slots that reached the full mask and emitted a record
    pub completed: u64,
    /// In-flight keys overwritten by a different key
    pub collisions: u64,
    /// Cycles restarted because a key repeated a point
    pub restarts: u64,
    /// Observations for points outside the mode
    pub ignored: u64,
}

// ============================================================================
// Driver Types
// ============================================================================

/// Why a capture-point driver stopped
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Stop signal received
    Cancelled,
    /// Trace source reached end of stream
    SourceExhausted,
    /// Packet channel sender hung up
    SourceClosed,
    /// Source returned a read error
    SourceError(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::SourceExhausted => f.write_str("source exhausted"),
            StopReason::SourceClosed => f.write_str("source closed"),
            StopReason::SourceError(e) => write!(f, "source error: {}", e),
        }
    }
}

/// Final counters for one capture-point driver
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    /// Driver name, usually the source path or device
    pub name: String,
    /// Lines or packets read from the source
    pub inputs: u64,
    /// Inputs that failed to parse
    pub parse_errors: u64,
    /// Parsed inputs with no pipeline point or key
    pub misses: u64,
    /// Measurements completed by this driver's observations
    pub records: u64,
    pub stop: StopReason,
}

impl DriverReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: 0,
            parse_errors: 0,
            misses: 0,
            records: 0,
            stop: StopReason::SourceExhausted,
        }
    }
}

// ============================================================================
// Report Types
// ============================================================================

/// Mean statistics for one leg
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LegSummary {
    pub leg: Leg,
    /// Non-negative samples folded into the mean
    pub samples: u64,
    /// Arithmetic mean in milliseconds (0 with no samples)
    pub mean_ms: f64,
    /// Negative samples excluded from the mean
    pub anomalies: u64,
}

/// Aggregated results for export
#[derive(Serialize, Debug, Clone)]
pub struct LatencySummary {
    /// ISO 8601 timestamp when the summary was produced
    pub timestamp: String,
    /// Duration of the capture in seconds
    pub duration_seconds: u64,
    pub mode: CorrelationMode,
    /// Total measurement records observed
    pub total_records: u64,
    /// Per-leg means
    pub legs: Vec<LegSummary>,
    /// Correlation table counters
    pub table: TableStats,
    /// Per-driver counters
    pub drivers: Vec<DriverReport>,
}

impl LatencySummary {
    pub fn leg(&self, leg: Leg) -> Option<&LegSummary> {
        self.legs.iter().find(|s| s.leg == leg)
    }
}
