//! Typed views over tshark's per-packet layer trees.
//!
//! Each supported layer has a [`Contract`] describing the keys it
//! understands. The [`LayerRegistry`] owns one mapping function per layer
//! name and is built once, then shared by reference.

pub mod contract;
pub mod dns;
pub mod http;
pub mod ipv4;
pub mod link;
pub mod tls;
pub mod transport;

use std::collections::HashMap;
use std::fmt;

pub use contract::Contract;
pub use dns::{DnsLayer, DnsQuery, DnsRecord};
pub use http::{HttpLayer, HttpRequestLine, HttpStatusLine};
pub use ipv4::Ipv4Layer;
pub use link::{EthLayer, FrameLayer};
pub use tls::{TlsHandshake, TlsLayer, TlsRecord};
pub use transport::{TcpLayer, UdpLayer};

use crate::error::MapError;
use crate::tree::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Frame(FrameLayer),
    Eth(EthLayer),
    Ip(Ipv4Layer),
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Dns(DnsLayer),
    Http(HttpLayer),
    Tls(TlsLayer),
    /// A layer without a contract, kept as its normalized subtree.
    Other { name: String, tree: Node },
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Frame(_) => "frame",
            Layer::Eth(_) => "eth",
            Layer::Ip(_) => "ip",
            Layer::Tcp(_) => "tcp",
            Layer::Udp(_) => "udp",
            Layer::Dns(_) => "dns",
            Layer::Http(_) => "http",
            Layer::Tls(_) => "tls",
            Layer::Other { name, .. } => name,
        }
    }

    /// One-line description for listings.
    pub fn summary(&self) -> String {
        match self {
            Layer::Frame(f) => format!("frame {} ({} bytes, {})", f.number, f.len, f.protocols.join(":")),
            Layer::Eth(e) => format!(
                "eth {} → {} type {:#06x}",
                e.src.map(|m| m.to_string()).unwrap_or_default(),
                e.dst.map(|m| m.to_string()).unwrap_or_default(),
                e.ethertype
            ),
            Layer::Ip(ip) => format!("ip {} → {} ttl {} proto {}", ip.src, ip.dst, ip.ttl, ip.protocol),
            Layer::Tcp(t) => format!(
                "tcp {} → {} {:?} seq {} ack {} len {}",
                t.src_port,
                t.dst_port,
                t.role(),
                t.seq,
                t.ack,
                t.len
            ),
            Layer::Udp(u) => format!("udp {} → {} len {}", u.src_port, u.dst_port, u.length),
            Layer::Dns(d) => {
                let names: Vec<&str> = d.queries.iter().map(|q| q.name.as_str()).collect();
                let kind = if d.is_response { "response" } else { "query" };
                format!("dns {kind} {:#06x} {}", d.id, names.join(", "))
            }
            Layer::Http(h) => match (&h.request, &h.response) {
                (Some(req), _) => format!("http {} {} {}", req.method, req.uri, req.version),
                (None, Some(status)) => format!("http {} {} {}", status.version, status.code, status.phrase),
                (None, None) => "http (continuation)".to_owned(),
            },
            Layer::Tls(t) => match t.server_name() {
                Some(sni) => format!("tls {} record(s) sni {sni}", t.records.len()),
                None => format!("tls {} record(s)", t.records.len()),
            },
            Layer::Other { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// All layers of one dissected packet, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketLayers {
    pub number: Option<u64>,
    pub layers: Vec<Layer>,
}

impl PacketLayers {
    pub fn find(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name() == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(Layer::name)
    }
}

type MapFn = Box<dyn Fn(&Node) -> Result<Layer, MapError> + Send + Sync>;

/// Layer name → mapping function.
pub struct LayerRegistry {
    table: HashMap<&'static str, MapFn>,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.table.keys().collect();
        names.sort();
        f.debug_struct("LayerRegistry").field("layers", &names).finish()
    }
}

impl LayerRegistry {
    pub fn empty() -> Self {
        LayerRegistry { table: HashMap::new() }
    }

    /// Registry with every built-in layer.
    pub fn standard() -> Self {
        Self::empty()
            .with("frame", link::frame_contract(), Layer::Frame)
            .with("eth", link::eth_contract(), Layer::Eth)
            .with("ip", ipv4::contract(), Layer::Ip)
            .with("tcp", transport::tcp_contract(), Layer::Tcp)
            .with("udp", transport::udp_contract(), Layer::Udp)
            .with("dns", dns::contract(), Layer::Dns)
            .with("http", http::contract(), Layer::Http)
            .with("tls", tls::contract(), Layer::Tls)
    }

    pub fn with<T>(mut self, name: &'static str, contract: Contract<T>, wrap: fn(T) -> Layer) -> Self
    where
        T: Default + 'static,
    {
        self.table
            .insert(name, Box::new(move |node: &Node| contract.map(node).map(wrap)));
        self
    }

    pub fn supports(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn map_layer(&self, name: &str, node: &Node) -> Result<Layer, MapError> {
        match self.table.get(name) {
            Some(map) if node.as_object().is_some() => map(node),
            _ => Ok(Layer::Other {
                name: name.to_owned(),
                tree: node.clone(),
            }),
        }
    }

    /// Maps one normalized dissector record. Accepts either the full
    /// `{"_source": {"layers": {...}}}` envelope or the bare layers object.
    pub fn map_record(&self, record: &Node) -> Result<PacketLayers, MapError> {
        let layers_node = record
            .get("_source")
            .and_then(|source| source.get("layers"))
            .unwrap_or(record);
        let fields = layers_node.as_object().ok_or(MapError::UnexpectedShape {
            field: "layers".to_owned(),
            expected: "object",
        })?;

        let mut out = PacketLayers::default();
        for (name, value) in fields {
            // a repeated layer (tunnels) is one layer per occurrence
            for occurrence in value.occurrences() {
                let layer = self.map_layer(name, occurrence)?;
                if let Layer::Frame(frame) = &layer {
                    out.number.get_or_insert(frame.number);
                }
                out.layers.push(layer);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build;

    const RECORD: &str = r#"[
  {
    "_index": "packets-2024-01-01",
    "_type": "doc",
    "_score": null,
    "_source": {
      "layers": {
        "frame": {
          "frame.encap_type": "1",
          "frame.time_epoch": "1700000000.000250000",
          "frame.number": "7",
          "frame.len": "74",
          "frame.cap_len": "74",
          "frame.protocols": "eth:ethertype:ip:tcp"
        },
        "eth": {
          "eth.dst": "aa:bb:cc:dd:ee:ff",
          "eth.src": "02:00:00:00:00:01",
          "eth.type": "0x0800"
        },
        "ip": {
          "ip.version": "4",
          "ip.hdr_len": "20",
          "ip.len": "60",
          "ip.id": "0x1c46",
          "ip.flags": "0x02",
          "ip.ttl": "64",
          "ip.proto": "6",
          "ip.checksum": "0xb1e6",
          "ip.src": "192.168.1.10",
          "ip.dst": "93.184.216.34"
        },
        "tcp": {
          "tcp.srcport": "51514",
          "tcp.dstport": "443",
          "tcp.stream": "0",
          "tcp.len": "0",
          "tcp.seq": "0",
          "tcp.seq_raw": "2596996162",
          "tcp.ack": "0",
          "tcp.ack_raw": "0",
          "tcp.hdr_len": "40",
          "tcp.flags": "0x0002",
          "tcp.flags_tree": {"tcp.flags.syn": "1"},
          "tcp.window_size_value": "64240",
          "tcp.checksum": "0x5e1a",
          "tcp.options": "02:04:05:b4:04:02:08:0a",
          "tcp.options_tree": {
            "tcp.options.mss": {"tcp.option_kind": "2", "tcp.option_len": "4"},
            "tcp.options.sack_perm": {"tcp.option_kind": "4", "tcp.option_len": "2"},
            "tcp.options.nop": {"tcp.option_kind": "1"},
            "tcp.options.nop": {"tcp.option_kind": "1"}
          }
        },
        "_ws.expert": {"_ws.expert.message": "Connection establish request (SYN)"}
      }
    }
  }
]"#;

    #[test]
    fn maps_a_realistic_record() {
        let registry = LayerRegistry::standard();
        let node = build(RECORD).unwrap().remove(0);
        let packet = registry.map_record(&node).unwrap();

        assert_eq!(packet.number, Some(7));
        assert_eq!(
            packet.names().collect::<Vec<_>>(),
            ["frame", "eth", "ip", "tcp", "_ws.expert"]
        );

        let Some(Layer::Ip(ip)) = packet.find("ip") else {
            panic!("no ip layer");
        };
        assert_eq!(ip.id, 0x1c46);
        assert_eq!(ip.ttl, 64);
        assert_eq!(ip.dst.to_string(), "93.184.216.34");

        let Some(Layer::Tcp(tcp)) = packet.find("tcp") else {
            panic!("no tcp layer");
        };
        assert_eq!(tcp.dst_port, 443);
        assert_eq!(tcp.seq_raw, 2_596_996_162);
        assert_eq!(tcp.options, [2, 4, 1, 1]);
        assert_eq!(tcp.role(), crate::model::TcpRole::Syn);

        assert!(matches!(packet.find("_ws.expert"), Some(Layer::Other { .. })));
        assert!(packet.layers[3].summary().starts_with("tcp 51514 → 443"));
    }

    #[test]
    fn repeated_layers_yield_one_layer_each() {
        let json = r#"{"ip": {"ip.ttl": "64"}, "udp": {"udp.srcport": "4789"}, "ip": {"ip.ttl": "63"}}"#;
        let packet = LayerRegistry::standard()
            .map_record(&build(json).unwrap().remove(0))
            .unwrap();
        let ttls: Vec<u8> = packet
            .layers
            .iter()
            .filter_map(|l| match l {
                Layer::Ip(ip) => Some(ip.ttl),
                _ => None,
            })
            .collect();
        // normalization groups the repeated key at its first position
        assert_eq!(ttls, [64, 63]);
        assert_eq!(packet.number, None);
    }

    #[test]
    fn duplicate_plain_key_fails_only_that_record() {
        let registry = LayerRegistry::standard();
        let bad = build(r#"{"udp": {"udp.srcport": "1", "udp.srcport": "2"}}"#).unwrap();
        assert!(matches!(
            registry.map_record(&bad[0]),
            Err(MapError::SchemaViolation { record: "udp", count: 2, .. })
        ));
        // tcp.option_kind repeats are fine: options_tree collects them
        let good = build(RECORD).unwrap();
        assert!(registry.map_record(&good[0]).is_ok());
    }

    #[test]
    fn unknown_and_scalar_layers_become_other() {
        let registry = LayerRegistry::empty();
        assert!(!registry.supports("tcp"));
        let layer = registry.map_layer("tcp", &Node::object([("tcp.srcport", Node::scalar("1"))])).unwrap();
        assert_eq!(layer.name(), "tcp");
        assert!(matches!(layer, Layer::Other { .. }));

        let standard = LayerRegistry::standard();
        let layer = standard.map_layer("tls", &Node::scalar("Ignored Unknown Record")).unwrap();
        assert!(matches!(layer, Layer::Other { .. }));
    }
}
