//! Ethernet or Linux cooked / IPv4 / TCP / UDP frame decoding.
//!
//! Anything the pipeline does not follow (non-IPv4, non-TCP/UDP, other link
//! types, truncated headers) decodes to `None`; that is not an error.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::model::{Direction, Endpoint, MacAddr, Packet, TcpHeader, TransportKind};

/// Link type number for Ethernet (DLT_EN10MB).
pub const LINKTYPE_ETHERNET: i32 = 1;
/// Linux cooked capture, what `dumpcap -i any` writes.
pub const LINKTYPE_LINUX_SLL: i32 = 113;
pub const LINKTYPE_LINUX_SLL2: i32 = 276;

/// Cooked-header packet types (`PACKET_*` in `<linux/if_packet.h>`).
pub mod sll_packet_type {
    pub const HOST: u16 = 0;
    pub const OUTGOING: u16 = 4;
}

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

type Res<'a, T> = IResult<&'a [u8], T, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

/// The parts of a Linux cooked header the decoder uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookedHeader {
    pub packet_type: u16,
    pub protocol: u16,
}

impl CookedHeader {
    pub fn direction(&self) -> Direction {
        match self.packet_type {
            sll_packet_type::OUTGOING => Direction::Outgoing,
            sll_packet_type::HOST => Direction::Incoming,
            _ => Direction::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: u8,
    pub total_len: u16,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

fn mac(i: &[u8]) -> Res<'_, MacAddr> {
    let (i, bytes) = take(6usize)(i)?;
    let mut out = [0u8; 6];
    out.copy_from_slice(bytes);
    Ok((i, MacAddr(out)))
}

fn ipv4_addr(i: &[u8]) -> Res<'_, Ipv4Addr> {
    let (i, raw) = be_u32(i)?;
    Ok((i, Ipv4Addr::from(raw)))
}

/// Parses the Ethernet header, skipping one 802.1Q tag if present.
pub fn parse_ethernet(i: &[u8]) -> Res<'_, EthernetHeader> {
    let (i, (dst, src, mut ethertype)) = tuple((mac, mac, be_u16))(i)?;
    let mut i = i;
    if ethertype == ETHERTYPE_VLAN {
        let (rest, (_tci, inner)) = tuple((be_u16, be_u16))(i)?;
        i = rest;
        ethertype = inner;
    }
    Ok((i, EthernetHeader { dst, src, ethertype }))
}

/// Parses the 16-byte SLL header: packet type, ARPHRD type, address length,
/// an 8-byte address field, protocol.
pub fn parse_sll(i: &[u8]) -> Res<'_, CookedHeader> {
    let (i, (packet_type, _arphrd, _addr_len, _addr, protocol)) =
        tuple((be_u16, be_u16, be_u16, take(8usize), be_u16))(i)?;
    Ok((i, CookedHeader { packet_type, protocol }))
}

/// Parses the 20-byte SLL2 header, which moves the protocol first and adds
/// the interface index.
pub fn parse_sll2(i: &[u8]) -> Res<'_, CookedHeader> {
    let (i, (protocol, _reserved, _ifindex, _arphrd, packet_type, _addr_len, _addr)) =
        tuple((be_u16, be_u16, be_u32, be_u16, be_u8, be_u8, take(8usize)))(i)?;
    Ok((
        i,
        CookedHeader {
            packet_type: u16::from(packet_type),
            protocol,
        },
    ))
}

/// Parses an IPv4 header and returns the datagram payload bounded by the
/// total length field, so link-layer padding never leaks into it.
pub fn parse_ipv4(i: &[u8]) -> Res<'_, (Ipv4Header, &[u8])> {
    let start = i;
    let (i, version_ihl) = be_u8(i)?;
    if version_ihl >> 4 != 4 {
        return Err(nom::Err::Error(()));
    }
    let header_len = (version_ihl & 0x0F) * 4;
    let (_, (_tos, total_len, _id, _frag, _ttl, protocol, _checksum, src, dst)) = tuple((
        be_u8, be_u16, be_u16, be_u16, be_u8, be_u8, be_u16, ipv4_addr, ipv4_addr,
    ))(i)?;
    if header_len < 20 || (total_len as usize) < header_len as usize {
        return Err(nom::Err::Error(()));
    }
    let end = (total_len as usize).min(start.len());
    if end < header_len as usize {
        return Err(nom::Err::Error(()));
    }
    let payload = &start[header_len as usize..end];
    Ok((
        &start[end..],
        (
            Ipv4Header {
                header_len,
                total_len,
                protocol,
                src,
                dst,
            },
            payload,
        ),
    ))
}

struct TcpSegment<'a> {
    src_port: u16,
    dst_port: u16,
    header: TcpHeader,
    payload: &'a [u8],
}

fn parse_tcp(i: &[u8], total_len: u16) -> Option<TcpSegment<'_>> {
    let res: Res<'_, _> = tuple((be_u16, be_u16, be_u32, be_u32, be_u16, be_u16, be_u16, be_u16))(i);
    let (_, (src_port, dst_port, seq, ack, offset_flags, window, checksum, _urgent)) = res.ok()?;
    let header_len = ((offset_flags >> 12) as u8) * 4;
    if header_len < 20 || header_len as usize > i.len() {
        return None;
    }
    Some(TcpSegment {
        src_port,
        dst_port,
        header: TcpHeader {
            seq,
            ack,
            flags: offset_flags & 0x01FF,
            window,
            checksum,
            header_len,
            total_len,
        },
        payload: &i[header_len as usize..],
    })
}

fn parse_udp(i: &[u8]) -> Option<(u16, u16, &[u8])> {
    let res: Res<'_, _> = tuple((be_u16, be_u16, be_u16, be_u16))(i);
    let (rest, (src_port, dst_port, length, _checksum)) = res.ok()?;
    let body_len = (length as usize).saturating_sub(8).min(rest.len());
    Some((src_port, dst_port, &rest[..body_len]))
}

/// Link-layer framing of one frame: the MACs, the carried ethertype and,
/// for cooked captures, the direction the kernel recorded.
struct Link<'a> {
    src: Option<MacAddr>,
    dst: Option<MacAddr>,
    ethertype: u16,
    direction: Direction,
    rest: &'a [u8],
}

fn parse_link(link_type: i32, data: &[u8]) -> Option<Link<'_>> {
    match link_type {
        LINKTYPE_ETHERNET => {
            let (rest, eth) = parse_ethernet(data).ok()?;
            Some(Link {
                src: Some(eth.src),
                dst: Some(eth.dst),
                ethertype: eth.ethertype,
                direction: Direction::Unknown,
                rest,
            })
        }
        LINKTYPE_LINUX_SLL | LINKTYPE_LINUX_SLL2 => {
            let (rest, cooked) = if link_type == LINKTYPE_LINUX_SLL {
                parse_sll(data).ok()?
            } else {
                parse_sll2(data).ok()?
            };
            // the cooked header names the sender only; MACs stay unset on
            // both sides so the two directions share a flow key
            Some(Link {
                src: None,
                dst: None,
                ethertype: cooked.protocol,
                direction: cooked.direction(),
                rest,
            })
        }
        _ => None,
    }
}

/// Decodes one captured frame into a [`Packet`].
///
/// Ethernet, SLL and SLL2 frames are followed. Cooked frames carry their
/// direction from the header; Ethernet frames leave it `Unknown`.
pub fn decode_frame(
    number: u64,
    link_type: i32,
    data: &[u8],
    timestamp: DateTime<Utc>,
) -> Option<Packet> {
    let link = parse_link(link_type, data)?;
    if link.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let (_, (ip, body)) = parse_ipv4(link.rest).ok()?;
    let endpoint = |addr: Ipv4Addr, port: u16, mac: Option<MacAddr>| Endpoint {
        ip: IpAddr::V4(addr),
        port,
        mac,
    };

    let mut packet = match ip.protocol {
        IPPROTO_TCP => {
            let seg = parse_tcp(body, ip.total_len)?;
            let mut packet = Packet::new(
                number,
                endpoint(ip.src, seg.src_port, link.src),
                endpoint(ip.dst, seg.dst_port, link.dst),
                TransportKind::Tcp,
                seg.payload.to_vec(),
                timestamp,
            );
            packet.tcp = Some(seg.header);
            packet
        }
        IPPROTO_UDP => {
            let (src_port, dst_port, payload) = parse_udp(body)?;
            Packet::new(
                number,
                endpoint(ip.src, src_port, link.src),
                endpoint(ip.dst, dst_port, link.dst),
                TransportKind::Udp,
                payload.to_vec(),
                timestamp,
            )
        }
        _ => return None,
    };
    packet.direction = link.direction;
    Some(packet)
}
