//! Trace line parsing
//!
//! Turns one line of ftrace text output into a [`TraceEvent`]. The event
//! borrows every string field from the input line; nothing is copied.
//!
//! Expected layout:
//!
//! ```text
//! ping-10508 [000] .... 31011.774831: net_dev_start_xmit: dev=wlp2s0 skbaddr=000000004398e8ba ...
//! ping-10508 [000] .... 31011.774790: sys_sendto(fd: 3, buff: 55d0c1e2a0a0, len: 64, ...)
//! ping-10508 [000] .... 31011.774850: sys_sendto -> 0x40
//! ```

use pktlat_common::{Direction, SyscallPoint, Timestamp, TimestampError};
use thiserror::Error;

/// Positional tokens before the timestamp: task-pid, cpu, flags
const PREFIX_TOKENS: usize = 3;

/// Errors that can occur while parsing a trace line.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty trace line")]
    Empty,

    #[error("line ends before the timestamp")]
    MissingTimestamp,

    #[error("bad timestamp: {0}")]
    BadTimestamp(TimestampError),

    #[error("line ends before the event name")]
    MissingEvent,
}

/// Trace events the correlation pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEventKind {
    /// `net:net_dev_queue`
    NetDevQueue,
    /// `net:net_dev_start_xmit`
    NetDevStartXmit,
    /// `net:net_dev_xmit`
    NetDevXmit,
    /// `net:netif_receive_skb`
    NetifReceiveSkb,
    /// `net:netif_rx`
    NetifRx,
    /// `net:napi_gro_receive_entry`
    NapiGroReceiveEntry,
    /// `syscalls:sys_enter_sendto`
    SysEnterSendto,
    /// `syscalls:sys_exit_sendto`
    SysExitSendto,
    /// `syscalls:sys_enter_recvmsg`
    SysEnterRecvmsg,
    /// `syscalls:sys_exit_recvmsg`
    SysExitRecvmsg,
    Unknown,
}

impl TraceEventKind {
    /// Classify an event name by exact match
    pub fn from_name(name: &[u8]) -> Self {
        match name {
            b"net_dev_queue" => TraceEventKind::NetDevQueue,
            b"net_dev_start_xmit" => TraceEventKind::NetDevStartXmit,
            b"net_dev_xmit" => TraceEventKind::NetDevXmit,
            b"netif_receive_skb" => TraceEventKind::NetifReceiveSkb,
            b"netif_rx" => TraceEventKind::NetifRx,
            b"napi_gro_receive_entry" => TraceEventKind::NapiGroReceiveEntry,
            b"sys_enter_sendto" => TraceEventKind::SysEnterSendto,
            b"sys_exit_sendto" => TraceEventKind::SysExitSendto,
            b"sys_enter_recvmsg" => TraceEventKind::SysEnterRecvmsg,
            b"sys_exit_recvmsg" => TraceEventKind::SysExitRecvmsg,
            _ => TraceEventKind::Unknown,
        }
    }

    /// Classify the syscall trace formats, where the name is printed without
    /// `enter`/`exit`: `sys_sendto(fd: 3, ...)` on entry, `sys_sendto -> 0x40`
    /// on exit.
    fn from_syscall_line(name: &[u8], delimiter: Option<u8>, fields: &[u8]) -> Self {
        let exit = skip_whitespace(fields).starts_with(b"->");
        match (name, delimiter, exit) {
            (b"sys_sendto", Some(b'('), _) => TraceEventKind::SysEnterSendto,
            (b"sys_sendto", _, true) => TraceEventKind::SysExitSendto,
            (b"sys_recvmsg", Some(b'('), _) => TraceEventKind::SysEnterRecvmsg,
            (b"sys_recvmsg", _, true) => TraceEventKind::SysExitRecvmsg,
            _ => TraceEventKind::Unknown,
        }
    }

    pub fn direction(self) -> Option<Direction> {
        match self {
            TraceEventKind::NetDevQueue
            | TraceEventKind::NetDevStartXmit
            | TraceEventKind::NetDevXmit => Some(Direction::Outbound),
            TraceEventKind::NetifReceiveSkb
            | TraceEventKind::NetifRx
            | TraceEventKind::NapiGroReceiveEntry => Some(Direction::Inbound),
            _ => None,
        }
    }

    /// Syscall boundary for the syscall events, `None` for everything else
    pub fn syscall_point(self) -> Option<SyscallPoint> {
        match self {
            TraceEventKind::SysEnterSendto => Some(SyscallPoint::EnterSend),
            TraceEventKind::SysExitSendto => Some(SyscallPoint::ExitSend),
            TraceEventKind::SysEnterRecvmsg => Some(SyscallPoint::EnterRecv),
            TraceEventKind::SysExitRecvmsg => Some(SyscallPoint::ExitRecv),
            _ => None,
        }
    }
}

/// One parsed trace line
///
/// All byte slices point into the line passed to [`parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent<'a> {
    pub timestamp: Timestamp,
    pub kind: TraceEventKind,
    /// Raw event name, e.g. `net_dev_queue`
    pub name: &'a [u8],
    /// Value of `dev=`, if present
    pub dev: Option<&'a [u8]>,
    /// Value of `skbaddr=`, if present
    pub skbaddr: Option<&'a [u8]>,
    fields: &'a [u8],
}

impl<'a> TraceEvent<'a> {
    /// Look up any `name=value` field after the event name
    pub fn field(&self, name: &str) -> Option<&'a [u8]> {
        find_field(self.fields, name.as_bytes())
    }
}

/// Parse one trace line
///
/// The task/cpu/flags prefix is skipped by position. A missing prefix only
/// shifts where the timestamp is looked for: skipping stops early at the
/// first token that ends in `:`.
pub fn parse(line: &[u8]) -> Result<TraceEvent<'_>, ParseError> {
    let line = trim_line_end(line);
    let mut tokens = Tokens::new(line);

    let mut token = tokens.next_token().ok_or(ParseError::Empty)?;
    for _ in 0..PREFIX_TOKENS {
        if token.ends_with(b":") {
            break;
        }
        token = tokens.next_token().ok_or(ParseError::MissingTimestamp)?;
    }

    let stamp = token.strip_suffix(b":").unwrap_or(token);
    let timestamp = Timestamp::parse_ascii(stamp).map_err(ParseError::BadTimestamp)?;

    let rest = skip_whitespace(tokens.rest());
    let name_len = rest
        .iter()
        .position(|&b| b == b':' || b == b'(' || b.is_ascii_whitespace())
        .unwrap_or(rest.len());
    if name_len == 0 {
        return Err(ParseError::MissingEvent);
    }
    let name = &rest[..name_len];

    let delimiter = rest.get(name_len).copied();
    let fields = match delimiter {
        Some(b':') | Some(b'(') => &rest[name_len + 1..],
        _ => &rest[name_len..],
    };

    let kind = match TraceEventKind::from_name(name) {
        TraceEventKind::Unknown => TraceEventKind::from_syscall_line(name, delimiter, fields),
        kind => kind,
    };

    Ok(TraceEvent {
        timestamp,
        kind,
        name,
        dev: find_field(fields, b"dev"),
        skbaddr: find_field(fields, b"skbaddr"),
        fields,
    })
}

/// Find the value of `name=` among whitespace separated tokens
///
/// The match is anchored at the start of a token and must be followed
/// directly by `=`, so `dev` never matches `netdev=` or `dev_id=`.
pub fn find_field<'a>(fields: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let mut tokens = Tokens::new(fields);
    while let Some(token) = tokens.next_token() {
        if let Some(value) = token.strip_prefix(name).and_then(|v| v.strip_prefix(b"=")) {
            return Some(value);
        }
    }
    None
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !matches!(b, b'\n' | b'\r'))
        .map_or(0, |i| i + 1);
    &line[..end]
}

fn skip_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Whitespace tokenizer that remembers where it stopped
struct Tokens<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next_token(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos == self.bytes.len() {
            return None;
        }
        let start = self.pos;
        while self.pos < self.bytes.len() && !self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        Some(&self.bytes[start..self.pos])
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}
