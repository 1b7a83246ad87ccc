//! `tcp` and `udp` layers.

use super::contract::{colon_hex, integer, Contract};
use crate::model::TcpRole;
use crate::tree::Node;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    /// tshark's conversation index.
    pub stream: u32,
    pub len: u32,
    /// Relative sequence number.
    pub seq: u32,
    pub seq_raw: u32,
    pub ack: u32,
    pub ack_raw: u32,
    pub header_len: u8,
    pub flags: u16,
    pub window: u16,
    pub checksum: u16,
    /// Option kinds in header order.
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl TcpLayer {
    pub fn role(&self) -> TcpRole {
        TcpRole::from_flags(self.flags)
    }
}

fn option_kinds(node: &Node, out: &mut Vec<u8>) {
    match node {
        Node::Scalar(_) => {}
        Node::Array(items) => items.iter().for_each(|n| option_kinds(n, out)),
        Node::Object(fields) => {
            for (key, value) in fields {
                if key == "tcp.option_kind" {
                    out.extend(
                        value
                            .occurrences()
                            .iter()
                            .filter_map(|v| integer::<u8>(v, key).ok()),
                    );
                } else {
                    option_kinds(value, out);
                }
            }
        }
    }
}

pub fn tcp_contract() -> Contract<TcpLayer> {
    Contract::new("tcp")
        .plain("tcp.srcport", |t: &mut TcpLayer, v| {
            t.src_port = integer(v, "tcp.srcport")?;
            Ok(())
        })
        .plain("tcp.dstport", |t: &mut TcpLayer, v| {
            t.dst_port = integer(v, "tcp.dstport")?;
            Ok(())
        })
        .plain("tcp.stream", |t: &mut TcpLayer, v| {
            t.stream = integer(v, "tcp.stream")?;
            Ok(())
        })
        .plain("tcp.len", |t: &mut TcpLayer, v| {
            t.len = integer(v, "tcp.len")?;
            Ok(())
        })
        .plain("tcp.seq", |t: &mut TcpLayer, v| {
            t.seq = integer(v, "tcp.seq")?;
            Ok(())
        })
        .plain("tcp.seq_raw", |t: &mut TcpLayer, v| {
            t.seq_raw = integer(v, "tcp.seq_raw")?;
            Ok(())
        })
        .plain("tcp.ack", |t: &mut TcpLayer, v| {
            t.ack = integer(v, "tcp.ack")?;
            Ok(())
        })
        .plain("tcp.ack_raw", |t: &mut TcpLayer, v| {
            t.ack_raw = integer(v, "tcp.ack_raw")?;
            Ok(())
        })
        .plain("tcp.hdr_len", |t: &mut TcpLayer, v| {
            t.header_len = integer(v, "tcp.hdr_len")?;
            Ok(())
        })
        .plain("tcp.flags", |t: &mut TcpLayer, v| {
            t.flags = integer(v, "tcp.flags")?;
            Ok(())
        })
        .plain("tcp.window_size_value", |t: &mut TcpLayer, v| {
            t.window = integer(v, "tcp.window_size_value")?;
            Ok(())
        })
        .plain("tcp.checksum", |t: &mut TcpLayer, v| {
            t.checksum = integer(v, "tcp.checksum")?;
            Ok(())
        })
        .plain("tcp.options_tree", |t: &mut TcpLayer, v| {
            option_kinds(v, &mut t.options);
            Ok(())
        })
        .plain("tcp.payload", |t: &mut TcpLayer, v| {
            t.payload = colon_hex(v, "tcp.payload")?;
            Ok(())
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub stream: u32,
}

pub fn udp_contract() -> Contract<UdpLayer> {
    Contract::new("udp")
        .plain("udp.srcport", |u: &mut UdpLayer, v| {
            u.src_port = integer(v, "udp.srcport")?;
            Ok(())
        })
        .plain("udp.dstport", |u: &mut UdpLayer, v| {
            u.dst_port = integer(v, "udp.dstport")?;
            Ok(())
        })
        .plain("udp.length", |u: &mut UdpLayer, v| {
            u.length = integer(v, "udp.length")?;
            Ok(())
        })
        .plain("udp.checksum", |u: &mut UdpLayer, v| {
            u.checksum = integer(v, "udp.checksum")?;
            Ok(())
        })
        .plain("udp.stream", |u: &mut UdpLayer, v| {
            u.stream = integer(v, "udp.stream")?;
            Ok(())
        })
}
