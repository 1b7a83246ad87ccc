//! `ip` layer.

use std::net::{IpAddr, Ipv4Addr};

use super::contract::{integer, ip, Contract};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Layer {
    pub version: u8,
    pub header_len: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl Default for Ipv4Layer {
    fn default() -> Self {
        Ipv4Layer {
            version: 4,
            header_len: 0,
            total_len: 0,
            id: 0,
            flags: 0,
            ttl: 0,
            protocol: 0,
            checksum: 0,
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

pub fn contract() -> Contract<Ipv4Layer> {
    Contract::new("ip")
        .plain("ip.version", |l: &mut Ipv4Layer, v| {
            l.version = integer(v, "ip.version")?;
            Ok(())
        })
        .plain("ip.hdr_len", |l: &mut Ipv4Layer, v| {
            l.header_len = integer(v, "ip.hdr_len")?;
            Ok(())
        })
        .plain("ip.len", |l: &mut Ipv4Layer, v| {
            l.total_len = integer(v, "ip.len")?;
            Ok(())
        })
        .plain("ip.id", |l: &mut Ipv4Layer, v| {
            l.id = integer(v, "ip.id")?;
            Ok(())
        })
        .plain("ip.flags", |l: &mut Ipv4Layer, v| {
            l.flags = integer(v, "ip.flags")?;
            Ok(())
        })
        .plain("ip.ttl", |l: &mut Ipv4Layer, v| {
            l.ttl = integer(v, "ip.ttl")?;
            Ok(())
        })
        .plain("ip.proto", |l: &mut Ipv4Layer, v| {
            l.protocol = integer(v, "ip.proto")?;
            Ok(())
        })
        .plain("ip.checksum", |l: &mut Ipv4Layer, v| {
            l.checksum = integer(v, "ip.checksum")?;
            Ok(())
        })
        .plain("ip.src", |l: &mut Ipv4Layer, v| {
            l.src = ip(v, "ip.src")?;
            Ok(())
        })
        .plain("ip.dst", |l: &mut Ipv4Layer, v| {
            l.dst = ip(v, "ip.dst")?;
            Ok(())
        })
}
