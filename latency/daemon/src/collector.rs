//! Latency aggregation
//!
//! Folds completed measurement records into running per-leg sums and counts.

use crate::types::*;
use log::warn;
use pktlat_common::LEG_COUNT;

#[derive(Debug, Default, Clone, Copy)]
struct LegStats {
    sum_us: u128,
    count: u64,
    anomalies: u64,
}

/// Running per-leg statistics for one capture run
#[derive(Debug)]
pub struct LatencyCollector {
    mode: CorrelationMode,
    legs: [LegStats; LEG_COUNT],
    total_records: u64,
}

impl LatencyCollector {
    /// Create a collector for the legs of `mode`
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            mode,
            legs: [LegStats::default(); LEG_COUNT],
            total_records: 0,
        }
    }

    /// Add a completed measurement
    ///
    /// Negative legs are counted as anomalies and kept out of the mean.
    pub fn observe(&mut self, record: &MeasurementRecord) {
        for (leg, latency) in record.legs() {
            let stats = &mut self.legs[leg.index()];
            if latency.is_negative() {
                stats.anomalies += 1;
                warn!(
                    "{}: negative {} latency {} (clocks out of step?)",
                    record.key, leg, latency
                );
                continue;
            }
            stats.sum_us += latency.as_micros() as u128;
            stats.count += 1;
        }

        self.total_records += 1;
    }

    /// Mean latency of a leg, zero when nothing has been observed
    pub fn mean(&self, leg: Leg) -> Latency {
        let stats = &self.legs[leg.index()];
        if stats.count == 0 {
            return Latency::ZERO;
        }
        Latency::from_micros((stats.sum_us / stats.count as u128) as i64)
    }

    /// Mean latency of a leg in milliseconds, zero when nothing has been observed
    pub fn mean_ms(&self, leg: Leg) -> f64 {
        let stats = &self.legs[leg.index()];
        if stats.count == 0 {
            return 0.0;
        }
        stats.sum_us as f64 / stats.count as f64 / 1000.0
    }

    pub fn samples(&self, leg: Leg) -> u64 {
        self.legs[leg.index()].count
    }

    pub fn anomalies(&self, leg: Leg) -> u64 {
        self.legs[leg.index()].anomalies
    }

    /// Get current record count
    pub fn record_count(&self) -> u64 {
        self.total_records
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Snapshot every leg the mode measures
    pub fn report(
        &self,
        elapsed_secs: u64,
        table: TableStats,
        drivers: Vec<DriverReport>,
    ) -> LatencySummary {
        let legs = self
            .mode
            .legs()
            .iter()
            .map(|&leg| LegSummary {
                leg,
                samples: self.samples(leg),
                mean_ms: self.mean_ms(leg),
                anomalies: self.anomalies(leg),
            })
            .collect();

        LatencySummary {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            mode: self.mode,
            total_records: self.total_records,
            legs,
            table,
            drivers,
        }
    }
}
