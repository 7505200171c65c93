//! Line-oriented measurement report
//!
//! One line per completed measurement, then a summary block of per-leg
//! means in milliseconds once the capture has stopped.

use crate::session::SessionRecord;
use crate::types::{LatencySummary, MeasurementRecord};
use std::io::{self, Write};

/// Text sink for measurement lines and the final summary
pub struct ReportSink<W: Write> {
    out: W,
    seq: u64,
}

impl<W: Write> ReportSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, seq: 0 }
    }

    /// Write one record as `seq: <n>, <leg>: <sec>.<usec>, ...`
    ///
    /// Sequence numbers start at 1 and follow the order records reach the sink.
    pub fn write_record(&mut self, record: &MeasurementRecord) -> io::Result<u64> {
        self.seq += 1;
        write!(self.out, "seq: {}", self.seq)?;
        for (leg, latency) in record.legs() {
            write!(self.out, ", {}: {}", leg, latency)?;
        }
        writeln!(self.out)?;
        Ok(self.seq)
    }

    /// Write one echo session on the same numbering as measurement lines
    pub fn write_session(&mut self, session: &SessionRecord) -> io::Result<u64> {
        self.seq += 1;
        writeln!(
            self.out,
            "seq: {}, send: {}, recv: {}, round_trip: {}, app_round_trip: {}",
            self.seq,
            session.send(),
            session.recv(),
            session.round_trip(),
            session.app_round_trip()
        )?;
        Ok(self.seq)
    }

    /// Write the final summary block
    pub fn write_summary(&mut self, summary: &LatencySummary) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "==== {} latency summary ====", summary.mode.name())?;
        writeln!(self.out, "records: {}", summary.total_records)?;
        for leg in &summary.legs {
            writeln!(
                self.out,
                "{}: mean {:.3} ms ({} samples, {} anomalies)",
                leg.leg, leg.mean_ms, leg.samples, leg.anomalies
            )?;
        }
        let table = &summary.table;
        writeln!(
            self.out,
            "table: {} completed, {} collisions, {} restarts, {} ignored",
            table.completed, table.collisions, table.restarts, table.ignored
        )?;
        self.out.flush()
    }

    /// Records written so far
    pub fn written(&self) -> u64 {
        self.seq
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::LatencyCollector;
    use crate::types::*;

    fn record(id: u16, out_us: u64, in_us: u64) -> MeasurementRecord {
        MeasurementRecord::new(
            CorrelationKey::echo(id, 1),
            CorrelationMode::Outbound,
            [
                Some(Timestamp::from_micros(in_us)),
                Some(Timestamp::from_micros(out_us)),
                None,
                None,
            ],
        )
    }

    #[test]
    fn test_record_lines_are_numbered() {
        let mut sink = ReportSink::new(Vec::new());

        assert_eq!(sink.write_record(&record(1, 1_000_250, 1_000_000)).unwrap(), 1);
        assert_eq!(sink.write_record(&record(2, 3_000_000, 1_500_000)).unwrap(), 2);
        assert_eq!(sink.written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "seq: 1, outbound: 0.000250");
        assert_eq!(lines[1], "seq: 2, outbound: 1.500000");
    }

    #[test]
    fn test_round_trip_line_lists_every_leg() {
        let record = MeasurementRecord::new(
            CorrelationKey::echo(7, 3),
            CorrelationMode::RoundTrip,
            [
                Some(Timestamp::from_micros(10_000_000)),
                Some(Timestamp::from_micros(10_000_040)),
                Some(Timestamp::from_micros(10_002_000)),
                Some(Timestamp::from_micros(10_002_030)),
            ],
        );
        let mut sink = ReportSink::new(Vec::new());
        sink.write_record(&record).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "seq: 1, outbound: 0.000040, inbound: 0.000030, round_trip: 0.002030\n"
        );
    }

    #[test]
    fn test_session_line() {
        use crate::packet::{IcmpKind, PacketEvent};
        use crate::session::SessionTracker;

        let mut tracker = SessionTracker::new();
        for (point, micros) in [
            (SyscallPoint::EnterSend, 2_000_000),
            (SyscallPoint::ExitSend, 2_000_015),
            (SyscallPoint::EnterRecv, 2_000_020),
            (SyscallPoint::ExitRecv, 2_000_900),
        ] {
            tracker.observe_syscall(point, Timestamp::from_micros(micros));
        }
        let echo = |kind, micros| PacketEvent {
            timestamp: Timestamp::from_micros(micros),
            kind,
            id: 1,
            seq: 1,
        };
        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 2_000_010));
        let session = tracker
            .observe_echo(&echo(IcmpKind::EchoReply, 2_000_810))
            .unwrap();

        let mut sink = ReportSink::new(Vec::new());
        sink.write_record(&record(1, 1_000_250, 1_000_000)).unwrap();
        assert_eq!(sink.write_session(&session).unwrap(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some("seq: 2, send: 0.000015, recv: 0.000880, round_trip: 0.000800, app_round_trip: 0.000900")
        );
    }

    #[test]
    fn test_summary_block() {
        let mut collector = LatencyCollector::new(CorrelationMode::Outbound);
        collector.observe(&record(1, 1_500, 1_000));
        collector.observe(&record(2, 2_250, 1_000));
        let summary = collector.report(
            3,
            TableStats {
                completed: 2,
                collisions: 1,
                ..TableStats::default()
            },
            Vec::new(),
        );

        let mut sink = ReportSink::new(Vec::new());
        sink.write_summary(&summary).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();

        assert!(text.contains("==== outbound latency summary ===="));
        assert!(text.contains("records: 2"));
        assert!(text.contains("outbound: mean 0.875 ms (2 samples, 0 anomalies)"));
        assert!(text.contains("table: 2 completed, 1 collisions, 0 restarts, 0 ignored"));
    }

    #[test]
    fn test_summary_without_samples() {
        let collector = LatencyCollector::new(CorrelationMode::Inbound);
        let summary = collector.report(0, TableStats::default(), Vec::new());

        let mut sink = ReportSink::new(Vec::new());
        sink.write_summary(&summary).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();

        assert!(text.contains("inbound: mean 0.000 ms (0 samples, 0 anomalies)"));
    }
}
