//! Link layer: immutable view over an Ethernet II frame's bytes, plus ARP
//! reply synthesis for local ARP spoofing.
//!
//! Frames are never mutated in place; [`Frame::parse`] borrows the bytes it
//! was handed and [`Frame::synthesize_arp_reply`] builds a fresh `Vec<u8>`.

use std::net::Ipv4Addr;

use byte_struct::*;

use crate::error::FrameError;
use crate::mac::MacAddr;

/// Minimum size of a frame we're willing to parse: 6 + 6 + 2.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Fixed size of an RFC 826 ARP-over-Ethernet-over-IPv4 body.
pub const ARP_BODY_LEN: usize = 28;

impl ByteStructLen for MacAddr {
    const BYTE_LEN: usize = 6;
}

impl ByteStruct for MacAddr {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; 6];
        out.copy_from_slice(&bytes[0..6]);
        MacAddr(out)
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..6].copy_from_slice(&self.0);
    }
}

/// 4-byte IPv4 address, local newtype so it can carry a [`byte_struct::ByteStruct`]
/// impl (the orphan rule forbids implementing a foreign trait on the foreign
/// `std::net::Ipv4Addr` directly).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Ipv4Bytes([u8; 4]);

impl From<Ipv4Bytes> for Ipv4Addr {
    fn from(v: Ipv4Bytes) -> Self {
        Ipv4Addr::from(v.0)
    }
}

impl From<Ipv4Addr> for Ipv4Bytes {
    fn from(v: Ipv4Addr) -> Self {
        Ipv4Bytes(v.octets())
    }
}

impl ByteStructLen for Ipv4Bytes {
    const BYTE_LEN: usize = 4;
}

impl ByteStruct for Ipv4Bytes {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; 4];
        out.copy_from_slice(&bytes[0..4]);
        Ipv4Bytes(out)
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.0);
    }
}

/// EtherType tag. Only IPv4 and ARP are dispatched on (per Non-goals, IPv6
/// and others are dropped); everything else is kept as its raw numeric
/// value for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtherType {
    Ip,
    Arp,
    Other(u16),
}

impl EtherType {
    pub const IP_VALUE: u16 = 0x0800;
    pub const ARP_VALUE: u16 = 0x0806;

    pub fn as_u16(self) -> u16 {
        match self {
            EtherType::Ip => Self::IP_VALUE,
            EtherType::Arp => Self::ARP_VALUE,
            EtherType::Other(v) => v,
        }
    }
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            Self::IP_VALUE => EtherType::Ip,
            Self::ARP_VALUE => EtherType::Arp,
            other => EtherType::Other(other),
        }
    }
}

impl ByteStructLen for EtherType {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for EtherType {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut b = [0u8; 2];
        b.copy_from_slice(&bytes[0..2]);
        EtherType::from(u16::from_be_bytes(b))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.as_u16().to_be_bytes());
    }
}

/// Header of an Ethernet II frame: destination, then source, then
/// ethertype, as laid out on the wire.
#[derive(ByteStruct, Clone, Copy, Debug)]
pub struct EthernetHeader {
    pub destination_mac: MacAddr,
    pub source_mac: MacAddr,
    pub ethertype: EtherType,
}

/// ARP operation code. Only request/reply are meaningful for this overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    Other(u16),
}

impl ArpOperation {
    fn as_u16(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
            ArpOperation::Other(v) => v,
        }
    }
}

impl From<u16> for ArpOperation {
    fn from(value: u16) -> Self {
        match value {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            other => ArpOperation::Other(other),
        }
    }
}

impl ByteStructLen for ArpOperation {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ArpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut b = [0u8; 2];
        b.copy_from_slice(&bytes[0..2]);
        ArpOperation::from(u16::from_be_bytes(b))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.as_u16().to_be_bytes());
    }
}

/// The fixed 28-byte RFC 826 body of an ARP packet resolving IPv4 addresses
/// on Ethernet. `const_assert!` pins the layout so a future field edit that
/// breaks the wire size fails at compile time rather than at runtime parse.
#[derive(ByteStruct, Clone, Copy, Debug)]
#[byte_struct_be]
struct ArpPayload {
    htype: u16,
    ptype: EtherType,
    hlen: u8,
    plen: u8,
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Bytes,
    target_mac: MacAddr,
    target_ip: Ipv4Bytes,
}

static_assertions::const_assert!(ArpPayload::BYTE_LEN == ARP_BODY_LEN);

/// Immutable view over one whole Ethernet frame's bytes (no preamble/FCS).
/// Never mutated; a new `Frame` is parsed per read.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    bytes: &'a [u8],
    header: EthernetHeader,
}

impl<'a> Frame<'a> {
    /// Parses a whole Ethernet frame. Fails if shorter than the 14-byte
    /// header.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < ETHERNET_HEADER_LEN {
            return Err(FrameError::Truncated {
                len: bytes.len(),
                min: ETHERNET_HEADER_LEN,
            });
        }
        let header = EthernetHeader::read_bytes(&bytes[0..ETHERNET_HEADER_LEN]);
        Ok(Frame { bytes, header })
    }

    pub fn destination_mac(&self) -> MacAddr {
        self.header.destination_mac
    }

    pub fn source_mac(&self) -> MacAddr {
        self.header.source_mac
    }

    pub fn destination_mac_hex(&self) -> String {
        self.header.destination_mac.to_string()
    }

    pub fn source_mac_hex(&self) -> String {
        self.header.source_mac.to_string()
    }

    pub fn ethertype(&self) -> EtherType {
        self.header.ethertype
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[ETHERNET_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The IPv4 address an ARP request is asking to resolve, i.e. the
    /// target protocol address (payload bytes 24..28). `None` unless this
    /// is an ARP request with a full 28-byte body.
    pub fn arp_requested_ip(&self) -> Option<Ipv4Addr> {
        if self.header.ethertype != EtherType::Arp {
            return None;
        }
        let payload = self.payload();
        if payload.len() < ARP_BODY_LEN {
            return None;
        }
        let arp = ArpPayload::read_bytes(&payload[0..ARP_BODY_LEN]);
        if arp.operation != ArpOperation::Request {
            return None;
        }
        Some(arp.target_ip.into())
    }

    /// Synthesizes a byte-exact ARP reply frame answering this request on
    /// `answer_mac`'s behalf: destination is the original sender's hardware
    /// address, source and sender-hw are `answer_mac`, sender-proto is the
    /// originally-requested IP, target-hw/proto echo the original request's
    /// sender fields.
    pub fn synthesize_arp_reply(&self, answer_mac: MacAddr) -> Result<Vec<u8>, FrameError> {
        if self.header.ethertype != EtherType::Arp {
            return Err(FrameError::NotArpRequest);
        }
        let payload = self.payload();
        if payload.len() < ARP_BODY_LEN {
            return Err(FrameError::Truncated {
                len: payload.len(),
                min: ARP_BODY_LEN,
            });
        }
        let request = ArpPayload::read_bytes(&payload[0..ARP_BODY_LEN]);
        if request.operation != ArpOperation::Request {
            return Err(FrameError::NotArpRequest);
        }

        let reply = ArpPayload {
            htype: request.htype,
            ptype: request.ptype,
            hlen: request.hlen,
            plen: request.plen,
            operation: ArpOperation::Reply,
            sender_mac: answer_mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        };

        let header = EthernetHeader {
            destination_mac: request.sender_mac,
            source_mac: answer_mac,
            ethertype: EtherType::Arp,
        };

        let mut out = vec![0u8; ETHERNET_HEADER_LEN + ArpPayload::BYTE_LEN];
        header.write_bytes(&mut out[0..ETHERNET_HEADER_LEN]);
        reply.write_bytes(&mut out[ETHERNET_HEADER_LEN..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arp_request_bytes(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let header = EthernetHeader {
            destination_mac: MacAddr::BROADCAST,
            source_mac: sender_mac,
            ethertype: EtherType::Arp,
        };
        let body = ArpPayload {
            htype: 1,
            ptype: EtherType::Ip,
            hlen: 6,
            plen: 4,
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip: sender_ip.into(),
            target_mac,
            target_ip: target_ip.into(),
        };
        let mut out = vec![0u8; ETHERNET_HEADER_LEN + ArpPayload::BYTE_LEN];
        header.write_bytes(&mut out[0..ETHERNET_HEADER_LEN]);
        body.write_bytes(&mut out[ETHERNET_HEADER_LEN..]);
        out
    }

    #[test]
    fn rejects_short_frame() {
        let bytes = [0u8; 13];
        assert!(matches!(
            Frame::parse(&bytes),
            Err(FrameError::Truncated { len: 13, min: 14 })
        ));
    }

    #[test]
    fn reads_header_fields() {
        let sender = MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap();
        let target = MacAddr::parse_loose("aa:aa:aa:aa:aa:02").unwrap();
        let bytes = arp_request_bytes(
            sender,
            "10.0.0.1".parse().unwrap(),
            target,
            "10.0.0.2".parse().unwrap(),
        );
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.source_mac(), sender);
        assert_eq!(frame.ethertype(), EtherType::Arp);
        assert_eq!(frame.destination_mac_hex(), "ffffffffffff");
    }

    #[test]
    fn arp_requested_ip_reads_target_protocol_address() {
        let bytes = arp_request_bytes(
            MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap(),
            "10.0.0.1".parse().unwrap(),
            MacAddr::ZERO,
            "10.0.0.2".parse().unwrap(),
        );
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.arp_requested_ip(), Some("10.0.0.2".parse().unwrap()));
    }

    /// Invariant 4 (§8): reply fields are a deterministic function of the
    /// request fields and the answering MAC.
    #[test]
    fn synthesize_arp_reply_swaps_fields_correctly() {
        let sender = MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap();
        let sender_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let requested_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let answer_mac = MacAddr::parse_loose("aa:aa:aa:aa:aa:02").unwrap();

        let request_bytes = arp_request_bytes(sender, sender_ip, MacAddr::ZERO, requested_ip);
        let request = Frame::parse(&request_bytes).unwrap();

        let reply_bytes = request.synthesize_arp_reply(answer_mac).unwrap();
        let reply = Frame::parse(&reply_bytes).unwrap();

        assert_eq!(reply.destination_mac(), sender);
        assert_eq!(reply.source_mac(), answer_mac);
        assert_eq!(reply.ethertype(), EtherType::Arp);

        let reply_body = ArpPayload::read_bytes(&reply.payload()[0..ArpPayload::BYTE_LEN]);
        assert_eq!(reply_body.operation, ArpOperation::Reply);
        assert_eq!(reply_body.sender_mac, answer_mac);
        assert_eq!(Ipv4Addr::from(reply_body.sender_ip), requested_ip);
        assert_eq!(reply_body.target_mac, sender);
        assert_eq!(Ipv4Addr::from(reply_body.target_ip), sender_ip);
    }

    #[test]
    fn non_arp_request_cannot_synthesize_reply() {
        let header = EthernetHeader {
            destination_mac: MacAddr::BROADCAST,
            source_mac: MacAddr::ZERO,
            ethertype: EtherType::Ip,
        };
        let mut bytes = vec![0u8; ETHERNET_HEADER_LEN + 4];
        header.write_bytes(&mut bytes[0..ETHERNET_HEADER_LEN]);
        let frame = Frame::parse(&bytes).unwrap();
        assert!(frame.synthesize_arp_reply(MacAddr::ZERO).is_err());
    }
}
