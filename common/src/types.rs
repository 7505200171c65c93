//! Shared value types for latency correlation
//!
//! Every type here is `Copy` and heap free so observations can move between
//! capture threads and the correlation table without allocation.

use core::fmt;
use core::str::FromStr;

use crate::constants::{LEG_COUNT, MICROS_DIGITS, MICROS_PER_SEC, POINT_COUNT, SKBADDR_MAX_LEN};

// ============================================================================
// Time
// ============================================================================

/// Wall time with microsecond resolution
///
/// Invariant: `micros < 1_000_000`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Timestamp {
    secs: u64,
    micros: u32,
}

/// Reasons a `SECONDS.MICROS` timestamp fails to parse
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampError {
    /// No digits before the decimal point
    MissingSeconds,
    /// No decimal point, or no digits after it
    MissingFraction,
    /// Seconds do not fit in 64 bits
    Overflow,
    /// Bytes left over after the fraction
    TrailingBytes,
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TimestampError::MissingSeconds => "no seconds digits",
            TimestampError::MissingFraction => "no microsecond digits",
            TimestampError::Overflow => "seconds out of range",
            TimestampError::TrailingBytes => "unexpected bytes after fraction",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for TimestampError {}

impl Timestamp {
    /// Build a timestamp, rejecting `micros` outside one second
    pub const fn new(secs: u64, micros: u32) -> Option<Self> {
        if micros >= MICROS_PER_SEC {
            return None;
        }
        Some(Self { secs, micros })
    }

    pub const fn from_micros(total: u64) -> Self {
        Self {
            secs: total / MICROS_PER_SEC as u64,
            micros: (total % MICROS_PER_SEC as u64) as u32,
        }
    }

    pub const fn secs(&self) -> u64 {
        self.secs
    }

    pub const fn subsec_micros(&self) -> u32 {
        self.micros
    }

    /// Total microseconds, saturating at `u64::MAX`
    pub fn as_micros(&self) -> u64 {
        self.secs
            .saturating_mul(MICROS_PER_SEC as u64)
            .saturating_add(self.micros as u64)
    }

    /// Add an offset, carrying whole seconds out of the microsecond field
    pub fn checked_add(self, offset: Timestamp) -> Option<Timestamp> {
        let mut secs = self.secs.checked_add(offset.secs)?;
        let mut micros = self.micros + offset.micros;
        if micros >= MICROS_PER_SEC {
            micros -= MICROS_PER_SEC;
            secs = secs.checked_add(1)?;
        }
        Some(Timestamp { secs, micros })
    }

    /// Signed time from `earlier` to `self`
    ///
    /// Negative when `self` precedes `earlier`, which happens when the
    /// observations for a key arrive from clocks that disagree.
    pub fn elapsed_since(self, earlier: Timestamp) -> Latency {
        if self >= earlier {
            let (secs, micros) = self.borrow_sub(earlier);
            Latency::from_parts(false, secs, micros)
        } else {
            let (secs, micros) = earlier.borrow_sub(self);
            Latency::from_parts(true, secs, micros)
        }
    }

    // Requires self >= other.
    fn borrow_sub(self, other: Timestamp) -> (u64, u32) {
        let mut secs = self.secs - other.secs;
        let micros = if self.micros < other.micros {
            secs -= 1;
            self.micros + MICROS_PER_SEC - other.micros
        } else {
            self.micros - other.micros
        };
        (secs, micros)
    }

    /// Parse `SECONDS.FRACTION` from ASCII
    ///
    /// Fractions shorter than six digits are scaled up (`.5` is half a
    /// second); digits past the sixth are dropped.
    pub fn parse_ascii(text: &[u8]) -> Result<Self, TimestampError> {
        let secs_len = text.iter().take_while(|b| b.is_ascii_digit()).count();
        if secs_len == 0 {
            return Err(TimestampError::MissingSeconds);
        }

        let mut secs: u64 = 0;
        for &b in &text[..secs_len] {
            secs = secs
                .checked_mul(10)
                .and_then(|s| s.checked_add((b - b'0') as u64))
                .ok_or(TimestampError::Overflow)?;
        }

        let rest = &text[secs_len..];
        let frac = match rest.split_first() {
            Some((b'.', frac)) => frac,
            _ => return Err(TimestampError::MissingFraction),
        };

        let frac_len = frac.iter().take_while(|b| b.is_ascii_digit()).count();
        if frac_len == 0 {
            return Err(TimestampError::MissingFraction);
        }
        if frac_len != frac.len() {
            return Err(TimestampError::TrailingBytes);
        }

        let mut micros: u32 = 0;
        for &b in frac.iter().take(MICROS_DIGITS) {
            micros = micros * 10 + (b - b'0') as u32;
        }
        for _ in frac_len..MICROS_DIGITS {
            micros *= 10;
        }

        Ok(Timestamp { secs, micros })
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse_ascii(s.trim().as_bytes())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// Signed duration with microsecond resolution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(transparent))]
pub struct Latency {
    micros: i64,
}

impl Latency {
    pub const ZERO: Latency = Latency { micros: 0 };

    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    fn from_parts(negative: bool, secs: u64, micros: u32) -> Self {
        let magnitude = i64::try_from(secs)
            .ok()
            .and_then(|s| s.checked_mul(MICROS_PER_SEC as i64))
            .and_then(|s| s.checked_add(micros as i64))
            .unwrap_or(i64::MAX);
        Self {
            micros: if negative { -magnitude } else { magnitude },
        }
    }

    pub const fn as_micros(&self) -> i64 {
        self.micros
    }

    pub const fn is_negative(&self) -> bool {
        self.micros < 0
    }

    /// Whole seconds of the magnitude
    pub const fn secs(&self) -> u64 {
        self.micros.unsigned_abs() / MICROS_PER_SEC as u64
    }

    /// Sub-second microseconds of the magnitude
    pub const fn subsec_micros(&self) -> u32 {
        (self.micros.unsigned_abs() % MICROS_PER_SEC as u64) as u32
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.micros as f64 / 1000.0
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            f.write_str("-")?;
        }
        write!(f, "{}.{:06}", self.secs(), self.subsec_micros())
    }
}

// ============================================================================
// Pipeline Points
// ============================================================================

/// Which of the two observed devices produced an observation
///
/// Named from the measuring host's point of view: an outbound packet
/// crosses the outer device first and the inner device second, a reply
/// crosses them in the opposite order. With a container veth pair in front
/// of a physical NIC, the veth is the outer device and the NIC the inner one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceSide {
    /// Device an outbound packet crosses first (closest to the sender)
    Outer,
    /// Device an outbound packet crosses second (closest to the wire)
    Inner,
}

/// Packet direction relative to the local host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A place in the packet pipeline where an observation is taken
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PipelinePoint {
    OuterOutbound = 0,
    InnerOutbound = 1,
    InnerInbound = 2,
    OuterInbound = 3,
}

impl PipelinePoint {
    pub const ALL: [PipelinePoint; POINT_COUNT] = [
        PipelinePoint::OuterOutbound,
        PipelinePoint::InnerOutbound,
        PipelinePoint::InnerInbound,
        PipelinePoint::OuterInbound,
    ];

    pub const fn from_side(side: DeviceSide, direction: Direction) -> Self {
        match (side, direction) {
            (DeviceSide::Outer, Direction::Outbound) => PipelinePoint::OuterOutbound,
            (DeviceSide::Inner, Direction::Outbound) => PipelinePoint::InnerOutbound,
            (DeviceSide::Inner, Direction::Inbound) => PipelinePoint::InnerInbound,
            (DeviceSide::Outer, Direction::Inbound) => PipelinePoint::OuterInbound,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            PipelinePoint::OuterOutbound => "outer_outbound",
            PipelinePoint::InnerOutbound => "inner_outbound",
            PipelinePoint::InnerInbound => "inner_inbound",
            PipelinePoint::OuterInbound => "outer_inbound",
        }
    }
}

impl fmt::Display for PipelinePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Syscall boundary of one echo session on the sending host
///
/// Ordered the way a ping cycle passes them: the request leaves through
/// `sendto`, the reply is collected through `recvmsg`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SyscallPoint {
    EnterSend = 0,
    ExitSend = 1,
    EnterRecv = 2,
    ExitRecv = 3,
}

impl SyscallPoint {
    pub const ALL: [SyscallPoint; 4] = [
        SyscallPoint::EnterSend,
        SyscallPoint::ExitSend,
        SyscallPoint::EnterRecv,
        SyscallPoint::ExitRecv,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// The point expected after this one, `None` after `ExitRecv`
    pub const fn next(self) -> Option<SyscallPoint> {
        match self {
            SyscallPoint::EnterSend => Some(SyscallPoint::ExitSend),
            SyscallPoint::ExitSend => Some(SyscallPoint::EnterRecv),
            SyscallPoint::EnterRecv => Some(SyscallPoint::ExitRecv),
            SyscallPoint::ExitRecv => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SyscallPoint::EnterSend => "enter_sendto",
            SyscallPoint::ExitSend => "exit_sendto",
            SyscallPoint::EnterRecv => "enter_recvmsg",
            SyscallPoint::ExitRecv => "exit_recvmsg",
        }
    }
}

impl fmt::Display for SyscallPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of pipeline points
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PointMask(u8);

impl PointMask {
    pub const EMPTY: PointMask = PointMask(0);

    pub const fn of(points: &[PipelinePoint]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < points.len() {
            bits |= 1 << points[i] as u8;
            i += 1;
        }
        PointMask(bits)
    }

    pub const fn contains(self, point: PipelinePoint) -> bool {
        self.0 & (1 << point as u8) != 0
    }

    pub fn insert(&mut self, point: PipelinePoint) {
        self.0 |= 1 << point as u8;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn contains_all(self, other: PointMask) -> bool {
        self.0 & other.0 == other.0
    }
}

// ============================================================================
// Legs and Modes
// ============================================================================

/// An interval between two pipeline points
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Leg {
    /// Outer device to inner device on the way out
    Outbound,
    /// Inner device to outer device on the way back in
    Inbound,
    /// Leaving and returning through the outer device
    RoundTrip,
}

impl Leg {
    pub const ALL: [Leg; LEG_COUNT] = [Leg::Outbound, Leg::Inbound, Leg::RoundTrip];

    /// `(earlier, later)` points bounding this leg
    pub const fn endpoints(self) -> (PipelinePoint, PipelinePoint) {
        match self {
            Leg::Outbound => (PipelinePoint::OuterOutbound, PipelinePoint::InnerOutbound),
            Leg::Inbound => (PipelinePoint::InnerInbound, PipelinePoint::OuterInbound),
            Leg::RoundTrip => (PipelinePoint::OuterOutbound, PipelinePoint::OuterInbound),
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Leg::Outbound => "outbound",
            Leg::Inbound => "inbound",
            Leg::RoundTrip => "round_trip",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which pipeline points must be seen before a key completes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CorrelationMode {
    /// Two points: leaving through the outer and then the inner device
    Outbound,
    /// Two points: arriving on the inner and then the outer device
    Inbound,
    /// Four points: a request out through both devices and its reply back
    RoundTrip,
}

impl CorrelationMode {
    pub const fn expected(self) -> PointMask {
        match self {
            CorrelationMode::Outbound => {
                PointMask::of(&[PipelinePoint::OuterOutbound, PipelinePoint::InnerOutbound])
            }
            CorrelationMode::Inbound => {
                PointMask::of(&[PipelinePoint::InnerInbound, PipelinePoint::OuterInbound])
            }
            CorrelationMode::RoundTrip => PointMask::of(&PipelinePoint::ALL),
        }
    }

    pub const fn legs(self) -> &'static [Leg] {
        match self {
            CorrelationMode::Outbound => &[Leg::Outbound],
            CorrelationMode::Inbound => &[Leg::Inbound],
            CorrelationMode::RoundTrip => &Leg::ALL,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "outbound" => Some(CorrelationMode::Outbound),
            "inbound" => Some(CorrelationMode::Inbound),
            "round-trip" | "roundtrip" | "rtt" => Some(CorrelationMode::RoundTrip),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CorrelationMode::Outbound => "outbound",
            CorrelationMode::Inbound => "inbound",
            CorrelationMode::RoundTrip => "round-trip",
        }
    }
}

// ============================================================================
// Correlation Keys
// ============================================================================

/// Socket buffer address as printed by the kernel, stored inline
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkbAddr {
    len: u8,
    bytes: [u8; SKBADDR_MAX_LEN],
}

impl SkbAddr {
    /// Copy an address; `None` when empty or longer than `SKBADDR_MAX_LEN`
    pub fn new(addr: &[u8]) -> Option<Self> {
        if addr.is_empty() || addr.len() > SKBADDR_MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; SKBADDR_MAX_LEN];
        bytes[..addr.len()].copy_from_slice(addr);
        Some(Self {
            len: addr.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for SkbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in self.as_bytes() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for SkbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SkbAddr({})", self)
    }
}

/// Identifies one packet instance across observation points
///
/// Echo keys only carry the ICMP identifier and sequence number, so two
/// concurrent ping sessions that reuse the same pair are not told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Skb(SkbAddr),
    Echo { id: u16, seq: u16 },
}

impl CorrelationKey {
    pub fn skb(addr: &[u8]) -> Option<Self> {
        SkbAddr::new(addr).map(CorrelationKey::Skb)
    }

    pub const fn echo(id: u16, seq: u16) -> Self {
        CorrelationKey::Echo { id, seq }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Skb(addr) => write!(f, "skb={}", addr),
            CorrelationKey::Echo { id, seq } => write!(f, "id={} seq={}", id, seq),
        }
    }
}

// Compile-time size checks
const _: () = {
    assert!(POINT_COUNT <= 8);
    assert!(SKBADDR_MAX_LEN <= u8::MAX as usize);
};
