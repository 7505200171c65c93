//! Shared constants for packet latency correlation
//!
//! These constants are used by the parser, the extractor and the
//! correlation table to keep limits and wire values consistent.

// ============================================================================
// Correlation Table
// ============================================================================

/// Default number of slots in the correlation table
pub const DEFAULT_TABLE_CAPACITY: usize = 4096;

/// Maximum length of an skb address key in bytes
///
/// `skbaddr=` is printed as 16 hex digits on 64-bit kernels; the extra room
/// covers hashed pointer formats.
pub const SKBADDR_MAX_LEN: usize = 32;

/// Number of distinct pipeline points
pub const POINT_COUNT: usize = 4;

/// Number of distinct legs
pub const LEG_COUNT: usize = 3;

// ============================================================================
// Time
// ============================================================================

/// Microseconds in one second
pub const MICROS_PER_SEC: u32 = 1_000_000;

/// Digits printed after the decimal point of a timestamp or latency
pub const MICROS_DIGITS: usize = 6;

// ============================================================================
// Link Layer (from pcap/dlt.h)
// ============================================================================

/// Ethernet (10Mb and up) data link type
pub const DLT_EN10MB: u32 = 1;

/// Ethernet header length
pub const ETHER_HEADER_LEN: usize = 14;

/// IPv4 ether type
pub const ETHERTYPE_IPV4: u16 = 0x0800;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// ICMP protocol number
pub const IPPROTO_ICMP: u8 = 1;

/// Minimum IPv4 header length in bytes
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Fragment offset bits of the IPv4 flags/fragment field
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

/// ICMP echo header length (type, code, checksum, id, sequence)
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

/// ICMP echo reply message type
pub const ICMP_ECHO_REPLY: u8 = 0;

/// ICMP echo request message type
pub const ICMP_ECHO_REQUEST: u8 = 8;
