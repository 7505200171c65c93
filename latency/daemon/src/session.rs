//! Echo session tracking
//!
//! Times one ping process end to end: its syscall trace gives the moments
//! it entered and left `sendto` and `recvmsg`, the capture on its device
//! gives the echo request and reply on the wire.
//!
//! Each stream is walked in ping-cycle order on its own. Syscalls go
//! enter sendto, exit sendto, enter recvmsg, exit recvmsg; echoes go
//! request, then the reply with the same id and sequence. Events that do
//! not fit the step a stream is waiting for are skipped. Because the trace
//! and the capture are read independently, finished cycles are queued and
//! paired by time: a request belongs to the syscall cycle it left between
//! entering `sendto` and leaving `recvmsg`.

use crate::{
    packet::{self, CapturedPacket, IcmpKind, PacketEvent},
    parser::{self, ParseError},
    types::*,
};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::{collections::VecDeque, fmt};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Finished cycles kept per stream while waiting for a partner
pub const MAX_PENDING_CYCLES: usize = 64;

/// One echo session timed at both syscalls and on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRecord {
    pub key: CorrelationKey,
    syscalls: [Timestamp; 4],
    pub request: Timestamp,
    pub reply: Timestamp,
}

impl SessionRecord {
    pub fn syscall(&self, point: SyscallPoint) -> Timestamp {
        self.syscalls[point.index()]
    }

    /// Time spent inside `sendto`
    pub fn send(&self) -> Latency {
        self.syscall(SyscallPoint::ExitSend)
            .elapsed_since(self.syscall(SyscallPoint::EnterSend))
    }

    /// Time spent inside `recvmsg`
    pub fn recv(&self) -> Latency {
        self.syscall(SyscallPoint::ExitRecv)
            .elapsed_since(self.syscall(SyscallPoint::EnterRecv))
    }

    /// Request to reply on the wire
    pub fn round_trip(&self) -> Latency {
        self.reply.elapsed_since(self.request)
    }

    /// Entering `sendto` to leaving `recvmsg`, as the application sees it
    pub fn app_round_trip(&self) -> Latency {
        self.syscall(SyscallPoint::ExitRecv)
            .elapsed_since(self.syscall(SyscallPoint::EnterSend))
    }
}

impl fmt::Display for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key: {}, send: {}, recv: {}, round_trip: {}, app_round_trip: {}",
            self.key,
            self.send(),
            self.recv(),
            self.round_trip(),
            self.app_round_trip()
        )
    }
}

/// Counters kept by the session tracker
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions paired and emitted
    pub completed: u64,
    /// Cycles abandoned because a new one started halfway through
    pub restarts: u64,
    /// Events that did not fit the step their stream was waiting for
    pub skipped: u64,
    /// Finished cycles dropped without a partner from the other stream
    pub unmatched: u64,
}

#[derive(Debug, Clone, Copy)]
struct EchoCycle {
    id: u16,
    seq: u16,
    request: Timestamp,
    reply: Timestamp,
}

/// Pairs syscall cycles with echo cycles
#[derive(Debug)]
pub struct SessionTracker {
    expected: SyscallPoint,
    syscalls: [Timestamp; 4],
    request: Option<PacketEvent>,
    syscall_cycles: VecDeque<[Timestamp; 4]>,
    echo_cycles: VecDeque<EchoCycle>,
    stats: SessionStats,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            expected: SyscallPoint::EnterSend,
            syscalls: [Timestamp::default(); 4],
            request: None,
            syscall_cycles: VecDeque::new(),
            echo_cycles: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    /// Feed one syscall boundary from the trace
    pub fn observe_syscall(
        &mut self,
        point: SyscallPoint,
        timestamp: Timestamp,
    ) -> Option<SessionRecord> {
        if point != self.expected {
            if point != SyscallPoint::EnterSend {
                self.stats.skipped += 1;
                trace!("Skipping {} while waiting for {}", point, self.expected);
                return None;
            }
            // A new sendto halfway through: the previous cycle never finishes
            self.stats.restarts += 1;
            debug!("Syscall cycle restarted at {}", timestamp);
        }

        self.syscalls[point.index()] = timestamp;
        match point.next() {
            Some(next) => {
                self.expected = next;
                None
            }
            None => {
                self.expected = SyscallPoint::EnterSend;
                push_bounded(&mut self.syscall_cycles, self.syscalls, &mut self.stats);
                self.pair()
            }
        }
    }

    /// Feed one echo message from the capture
    pub fn observe_echo(&mut self, event: &PacketEvent) -> Option<SessionRecord> {
        match event.kind {
            IcmpKind::EchoRequest => {
                if self.request.replace(*event).is_some() {
                    self.stats.restarts += 1;
                    debug!("Echo cycle restarted by request {}", event.key());
                }
                None
            }
            IcmpKind::EchoReply => {
                let Some(request) = self
                    .request
                    .filter(|r| r.id == event.id && r.seq == event.seq)
                else {
                    self.stats.skipped += 1;
                    trace!("Skipping reply {} with no matching request", event.key());
                    return None;
                };
                self.request = None;

                let cycle = EchoCycle {
                    id: request.id,
                    seq: request.seq,
                    request: request.timestamp,
                    reply: event.timestamp,
                };
                push_bounded(&mut self.echo_cycles, cycle, &mut self.stats);
                self.pair()
            }
        }
    }

    /// Pair the oldest syscall cycle with the echo that left during it
    ///
    /// Echoes older than the syscall cycle, and syscall cycles that ended
    /// before the oldest echo, can never be paired and are dropped.
    fn pair(&mut self) -> Option<SessionRecord> {
        loop {
            let syscalls = *self.syscall_cycles.front()?;
            let echo = *self.echo_cycles.front()?;

            if echo.request < syscalls[SyscallPoint::EnterSend.index()] {
                self.echo_cycles.pop_front();
                self.stats.unmatched += 1;
                debug!("Echo id={} seq={} has no syscall cycle", echo.id, echo.seq);
                continue;
            }
            if echo.request > syscalls[SyscallPoint::ExitRecv.index()] {
                self.syscall_cycles.pop_front();
                self.stats.unmatched += 1;
                debug!("Syscall cycle has no echo on the wire");
                continue;
            }

            self.syscall_cycles.pop_front();
            self.echo_cycles.pop_front();
            self.stats.completed += 1;
            return Some(SessionRecord {
                key: CorrelationKey::echo(echo.id, echo.seq),
                syscalls,
                request: echo.request,
                reply: echo.reply,
            });
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Finished cycles still waiting for a partner
    pub fn pending(&self) -> usize {
        self.syscall_cycles.len() + self.echo_cycles.len()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, stats: &mut SessionStats) {
    if queue.len() == MAX_PENDING_CYCLES {
        queue.pop_front();
        stats.unmatched += 1;
    }
    queue.push_back(item);
}

/// Final counters of a session driver
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub driver: DriverReport,
    pub sessions: SessionStats,
}

/// Driver over a syscall trace and the echo capture of the same process
pub struct SessionDriver<R> {
    name: String,
    reader: R,
    packets: mpsc::Receiver<CapturedPacket>,
    trace_offset: Timestamp,
    records: mpsc::Sender<SessionRecord>,
}

impl<R> SessionDriver<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        name: impl Into<String>,
        reader: R,
        packets: mpsc::Receiver<CapturedPacket>,
        trace_offset: Timestamp,
        records: mpsc::Sender<SessionRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            packets,
            trace_offset,
            records,
        }
    }

    /// Run until both sources end, the trace fails, or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> SessionReport {
        let mut report = DriverReport::new(self.name.clone());
        let mut tracker = SessionTracker::new();
        let mut line = Vec::with_capacity(512);
        let mut trace_open = true;
        let mut packets_open = true;

        info!("Session driver {} started", self.name);

        while trace_open || packets_open {
            let completed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.stop = StopReason::Cancelled;
                    break;
                }
                // Bytes of a line cut short by another branch stay in `line`
                // and the next read appends the rest
                read = self.reader.read_until(b'\n', &mut line), if trace_open => {
                    match read {
                        Ok(0) => {
                            trace_open = false;
                            None
                        }
                        Ok(_) => {
                            report.inputs += 1;
                            let completed = self.handle_line(&line, &mut tracker, &mut report);
                            line.clear();
                            completed
                        }
                        Err(e) => {
                            warn!("Session driver {}: trace read failed: {}", self.name, e);
                            report.stop = StopReason::SourceError(e.to_string());
                            break;
                        }
                    }
                }
                captured = self.packets.recv(), if packets_open => {
                    match captured {
                        Some(captured) => {
                            report.inputs += 1;
                            match packet::extract(captured.timestamp, &captured.data, captured.link_type) {
                                Some(event) => tracker.observe_echo(&event),
                                None => {
                                    report.misses += 1;
                                    None
                                }
                            }
                        }
                        None => {
                            packets_open = false;
                            None
                        }
                    }
                }
            };

            let Some(record) = completed else {
                continue;
            };
            report.records += 1;
            trace!("{}: session {}", self.name, record);
            if self.records.send(record).await.is_err() {
                warn!("Session driver {}: reporter is gone, stopping", self.name);
                report.stop = StopReason::Cancelled;
                break;
            }
        }

        let sessions = tracker.stats();
        info!(
            "Session driver {} stopped: {} ({} sessions, {} unmatched)",
            self.name, report.stop, sessions.completed, sessions.unmatched
        );
        SessionReport {
            driver: report,
            sessions,
        }
    }

    fn handle_line(
        &self,
        line: &[u8],
        tracker: &mut SessionTracker,
        report: &mut DriverReport,
    ) -> Option<SessionRecord> {
        let event = match parser::parse(line) {
            Ok(event) => event,
            Err(ParseError::Empty) => {
                report.misses += 1;
                return None;
            }
            Err(e) => {
                report.parse_errors += 1;
                debug!("{}: dropping line {}: {}", self.name, report.inputs, e);
                return None;
            }
        };

        let Some(point) = event.kind.syscall_point() else {
            report.misses += 1;
            return None;
        };
        let Some(timestamp) = event.timestamp.checked_add(self.trace_offset) else {
            report.parse_errors += 1;
            return None;
        };

        tracker.observe_syscall(point, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{tests::echo_frame, LinkType};
    use bytes::Bytes;
    use pktlat_common::{ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};

    fn us(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn echo(kind: IcmpKind, seq: u16, micros: u64) -> PacketEvent {
        PacketEvent {
            timestamp: us(micros),
            kind,
            id: 4242,
            seq,
        }
    }

    /// Feed one full syscall cycle starting at `base`
    fn syscalls(tracker: &mut SessionTracker, base: u64) -> Option<SessionRecord> {
        assert!(tracker.observe_syscall(SyscallPoint::EnterSend, us(base)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::ExitSend, us(base + 20)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::EnterRecv, us(base + 30)).is_none());
        tracker.observe_syscall(SyscallPoint::ExitRecv, us(base + 400))
    }

    #[test]
    fn test_session_in_ping_cycle_order() {
        let mut tracker = SessionTracker::new();

        assert!(tracker.observe_syscall(SyscallPoint::EnterSend, us(1_000)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::ExitSend, us(1_020)).is_none());
        assert!(tracker.observe_echo(&echo(IcmpKind::EchoRequest, 1, 1_015)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::EnterRecv, us(1_030)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::ExitRecv, us(1_400)).is_none());

        let record = tracker
            .observe_echo(&echo(IcmpKind::EchoReply, 1, 1_380))
            .unwrap();
        assert_eq!(record.key, CorrelationKey::echo(4242, 1));
        assert_eq!(record.send(), Latency::from_micros(20));
        assert_eq!(record.recv(), Latency::from_micros(370));
        assert_eq!(record.round_trip(), Latency::from_micros(365));
        assert_eq!(record.app_round_trip(), Latency::from_micros(400));
        assert_eq!(
            record.to_string(),
            "key: id=4242 seq=1, send: 0.000020, recv: 0.000370, round_trip: 0.000365, app_round_trip: 0.000400"
        );
        assert_eq!(tracker.stats().completed, 1);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_capture_running_ahead_of_trace() {
        let mut tracker = SessionTracker::new();

        // Three echo cycles captured before the trace catches up
        for seq in 1..=3u16 {
            let base = seq as u64 * 1_000_000;
            tracker.observe_echo(&echo(IcmpKind::EchoRequest, seq, base + 10));
            assert!(tracker
                .observe_echo(&echo(IcmpKind::EchoReply, seq, base + 300))
                .is_none());
        }
        assert_eq!(tracker.pending(), 3);

        let keys: Vec<CorrelationKey> = (1..=3u64)
            .filter_map(|n| syscalls(&mut tracker, n * 1_000_000))
            .map(|r| r.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                CorrelationKey::echo(4242, 1),
                CorrelationKey::echo(4242, 2),
                CorrelationKey::echo(4242, 3),
            ]
        );
        assert_eq!(tracker.stats().unmatched, 0);
    }

    #[test]
    fn test_out_of_order_syscalls_are_skipped() {
        let mut tracker = SessionTracker::new();

        // Leftovers from a cycle that started before tracing
        assert!(tracker.observe_syscall(SyscallPoint::ExitSend, us(10)).is_none());
        assert!(tracker.observe_syscall(SyscallPoint::ExitRecv, us(20)).is_none());
        assert_eq!(tracker.stats().skipped, 2);

        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 9, 1_010));
        tracker.observe_echo(&echo(IcmpKind::EchoReply, 9, 1_200));
        let record = syscalls(&mut tracker, 1_000).unwrap();
        assert_eq!(record.key, CorrelationKey::echo(4242, 9));
    }

    #[test]
    fn test_new_sendto_restarts_cycle() {
        let mut tracker = SessionTracker::new();

        tracker.observe_syscall(SyscallPoint::EnterSend, us(100));
        tracker.observe_syscall(SyscallPoint::ExitSend, us(120));
        // recvmsg never seen; the next ping starts
        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 2, 5_010));
        tracker.observe_echo(&echo(IcmpKind::EchoReply, 2, 5_100));
        let record = syscalls(&mut tracker, 5_000).unwrap();

        assert_eq!(record.syscall(SyscallPoint::EnterSend), us(5_000));
        assert_eq!(tracker.stats().restarts, 1);
    }

    #[test]
    fn test_reply_must_match_request() {
        let mut tracker = SessionTracker::new();

        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 5, 1_010));
        assert!(tracker.observe_echo(&echo(IcmpKind::EchoReply, 6, 1_100)).is_none());
        assert!(tracker.observe_echo(&echo(IcmpKind::EchoReply, 5, 1_150)).is_none());
        assert_eq!(tracker.stats().skipped, 1);

        let record = syscalls(&mut tracker, 1_000).unwrap();
        assert_eq!(record.round_trip(), Latency::from_micros(140));
    }

    #[test]
    fn test_echo_outside_syscall_window_is_unmatched() {
        let mut tracker = SessionTracker::new();

        // Another process pinged before this one entered sendto
        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 1, 500));
        tracker.observe_echo(&echo(IcmpKind::EchoReply, 1, 600));
        tracker.observe_echo(&echo(IcmpKind::EchoRequest, 2, 1_010));
        tracker.observe_echo(&echo(IcmpKind::EchoReply, 2, 1_200));

        let record = syscalls(&mut tracker, 1_000).unwrap();
        assert_eq!(record.key, CorrelationKey::echo(4242, 2));
        assert_eq!(tracker.stats().unmatched, 1);
    }

    #[test]
    fn test_pending_cycles_are_bounded() {
        let mut tracker = SessionTracker::new();
        for n in 0..(MAX_PENDING_CYCLES as u64 + 5) {
            assert!(syscalls(&mut tracker, n * 10_000).is_none());
        }
        assert_eq!(tracker.pending(), MAX_PENDING_CYCLES);
        assert_eq!(tracker.stats().unmatched, 5);
    }

    fn trace_line(event: &str, secs: u64, micros: u32) -> String {
        format!("ping-2211  [002] ....  {}.{:06}: {}\n", secs, micros, event)
    }

    fn captured(icmp_type: u8, seq: u16, micros: u64) -> CapturedPacket {
        CapturedPacket {
            timestamp: Timestamp::from_micros(micros),
            data: Bytes::from(echo_frame(icmp_type, 4242, seq)),
            link_type: LinkType::Ethernet,
        }
    }

    #[tokio::test]
    async fn test_session_driver_applies_trace_offset() {
        // Trace stamps are relative to boot; the offset moves them onto the
        // capture clock at 1_700_000_000 s
        let offset = Timestamp::new(1_699_999_000, 0).unwrap();
        let trace = [
            trace_line("sys_sendto(fd: 3, buff: 55d0c1e2a0a0, len: 64, flags: 0)", 1_000, 10),
            trace_line("sys_sendto -> 0x40", 1_000, 40),
            trace_line("net_dev_queue: dev=eth0 skbaddr=ffff8880 len=98", 1_000, 45),
            trace_line("sys_recvmsg(fd: 3, msg: 7ffd2c0b1f40, flags: 0)", 1_000, 50),
            trace_line("sys_recvmsg -> 0x54", 1_000, 600),
        ]
        .concat();

        let (packets_tx, packets_rx) = mpsc::channel(8);
        let (records_tx, mut records_rx) = mpsc::channel(8);
        let base = 1_700_000_000 * 1_000_000;
        packets_tx.send(captured(ICMP_ECHO_REQUEST, 1, base + 30)).await.unwrap();
        packets_tx
            .send(CapturedPacket {
                timestamp: us(base + 35),
                data: Bytes::from_static(&[0u8; 10]),
                link_type: LinkType::Ethernet,
            })
            .await
            .unwrap();
        packets_tx.send(captured(ICMP_ECHO_REPLY, 1, base + 480)).await.unwrap();
        drop(packets_tx);

        let driver = SessionDriver::new("ping", trace.as_bytes(), packets_rx, offset, records_tx);
        let report = driver.run(CancellationToken::new()).await;

        assert_eq!(report.driver.stop, StopReason::SourceExhausted);
        assert_eq!(report.driver.inputs, 8);
        assert_eq!(report.driver.misses, 2);
        assert_eq!(report.driver.records, 1);
        assert_eq!(report.sessions.completed, 1);

        let record = records_rx.recv().await.unwrap();
        assert_eq!(record.key, CorrelationKey::echo(4242, 1));
        assert_eq!(record.syscall(SyscallPoint::EnterSend), us(base + 10));
        assert_eq!(record.send(), Latency::from_micros(30));
        assert_eq!(record.round_trip(), Latency::from_micros(450));
        assert_eq!(record.app_round_trip(), Latency::from_micros(590));
    }

    #[tokio::test]
    async fn test_session_driver_stops_on_cancel() {
        let (_trace_writer, trace_reader) = tokio::io::duplex(64);
        let (_packets_tx, packets_rx) = mpsc::channel(1);
        let (records_tx, _records_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let driver = SessionDriver::new(
            "ping",
            tokio::io::BufReader::new(trace_reader),
            packets_rx,
            Timestamp::default(),
            records_tx,
        );
        let handle = tokio::spawn(driver.run(cancel.clone()));
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.driver.stop, StopReason::Cancelled);
        assert_eq!(report.driver.inputs, 0);
    }
}
