//! ICMP echo extraction from captured frames
//!
//! Pure functions over a borrowed frame: Ethernet, then IPv4, then the ICMP
//! echo header. Anything that is not an echo request or reply yields `None`.

use bytes::Bytes;
use pktlat_common::{constants::*, CorrelationKey, Direction, Timestamp};

/// Data link type reported by the capture collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Other(u32),
}

impl LinkType {
    /// Map a pcap `DLT_*` value
    pub fn from_dlt(dlt: u32) -> Self {
        match dlt {
            DLT_EN10MB => LinkType::Ethernet,
            other => LinkType::Other(other),
        }
    }
}

/// ICMP echo message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
}

impl IcmpKind {
    pub fn direction(self) -> Direction {
        match self {
            IcmpKind::EchoRequest => Direction::Outbound,
            IcmpKind::EchoReply => Direction::Inbound,
        }
    }
}

/// One echo message seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEvent {
    pub timestamp: Timestamp,
    pub kind: IcmpKind,
    pub id: u16,
    pub seq: u16,
}

impl PacketEvent {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::echo(self.id, self.seq)
    }
}

/// A frame handed over by the capture collaborator
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: Timestamp,
    pub data: Bytes,
    pub link_type: LinkType,
}

/// Extract an echo event from one captured frame
pub fn extract(timestamp: Timestamp, data: &[u8], link_type: LinkType) -> Option<PacketEvent> {
    if link_type != LinkType::Ethernet {
        return None;
    }

    let ether_type = read_u16_be(data, 12)?;
    if ether_type != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = data.get(ETHER_HEADER_LEN..)?;
    let version_ihl = *ip.first()?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = ((version_ihl & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return None;
    }
    if *ip.get(9)? != IPPROTO_ICMP {
        return None;
    }
    // Only the first fragment carries the ICMP header
    if read_u16_be(ip, 6)? & IPV4_FRAG_OFFSET_MASK != 0 {
        return None;
    }

    let icmp = ip.get(header_len..)?;
    if icmp.len() < ICMP_ECHO_HEADER_LEN {
        return None;
    }
    let kind = match icmp[0] {
        ICMP_ECHO_REQUEST => IcmpKind::EchoRequest,
        ICMP_ECHO_REPLY => IcmpKind::EchoReply,
        _ => return None,
    };

    Some(PacketEvent {
        timestamp,
        kind,
        id: read_u16_be(icmp, 4)?,
        seq: read_u16_be(icmp, 6)?,
    })
}

#[inline]
fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
