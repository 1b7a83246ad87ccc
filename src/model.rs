//! Core data model: endpoints, flow keys and decoded packets.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Parses the `aa:bb:cc:dd:ee:ff` form used by sysfs.
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One side of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub mac: Option<MacAddr>,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port, mac: None }
    }

    pub fn with_mac(ip: IpAddr, port: u16, mac: MacAddr) -> Self {
        Endpoint {
            ip,
            port,
            mac: Some(mac),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Unordered pair of endpoints identifying a bidirectional flow.
///
/// `FlowKey::new(a, b) == FlowKey::new(b, a)` and both hash identically: the
/// per-endpoint hashes are combined with XOR.
#[derive(Debug, Clone, Copy)]
pub struct FlowKey {
    a: Endpoint,
    b: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        FlowKey { a, b }
    }

    /// The endpoints in the order the flow was first seen.
    pub fn endpoints(&self) -> (&Endpoint, &Endpoint) {
        (&self.a, &self.b)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.a == *endpoint || self.b == *endpoint
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        (self.a == other.a && self.b == other.b) || (self.a == other.b && self.b == other.a)
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(endpoint_hash(&self.a) ^ endpoint_hash(&self.b));
    }
}

fn endpoint_hash(endpoint: &Endpoint) -> u64 {
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    hasher.finish()
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ⇄ {}", self.a, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Other,
}

/// Which way a packet travelled relative to the capturing interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Incoming,
    Outgoing,
    #[default]
    Unknown,
}

/// TCP control bits, in header order.
pub mod tcp_flags {
    pub const FIN: u16 = 0x001;
    pub const SYN: u16 = 0x002;
    pub const RST: u16 = 0x004;
    pub const PSH: u16 = 0x008;
    pub const ACK: u16 = 0x010;
    pub const URG: u16 = 0x020;
    pub const ECE: u16 = 0x040;
    pub const CWR: u16 = 0x080;
    pub const NS: u16 = 0x100;
}

/// Role of a TCP segment in its conversation, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRole {
    SynAck,
    Syn,
    FinAck,
    Fin,
    Psh,
    Urg,
    Rst,
    Ack,
    Other,
}

impl TcpRole {
    /// Classifies flag bits; the first matching rule wins.
    pub fn from_flags(flags: u16) -> Self {
        use tcp_flags::*;
        let has = |bits: u16| flags & bits == bits;
        if has(SYN | ACK) {
            TcpRole::SynAck
        } else if has(SYN) {
            TcpRole::Syn
        } else if has(ACK | FIN) {
            TcpRole::FinAck
        } else if has(FIN) {
            TcpRole::Fin
        } else if has(PSH) {
            TcpRole::Psh
        } else if has(URG) {
            TcpRole::Urg
        } else if has(RST) {
            TcpRole::Rst
        } else if has(ACK) {
            TcpRole::Ack
        } else {
            TcpRole::Other
        }
    }
}

/// TCP header fields kept on a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: u16,
    pub window: u16,
    pub checksum: u16,
    /// TCP header length in bytes.
    pub header_len: u8,
    /// IPv4 total length of the datagram carrying the segment.
    pub total_len: u16,
}

impl TcpHeader {
    pub fn role(&self) -> TcpRole {
        TcpRole::from_flags(self.flags)
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Connection state of an OS socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    /// Connectionless sockets and unrecognized states.
    Unknown(u8),
}

impl SocketState {
    /// Maps the kernel `TCP_*` state numbers.
    pub fn from_kernel(code: u8) -> Self {
        match code {
            0x01 => SocketState::Established,
            0x02 => SocketState::SynSent,
            0x03 => SocketState::SynRecv,
            0x04 => SocketState::FinWait1,
            0x05 => SocketState::FinWait2,
            0x06 => SocketState::TimeWait,
            0x07 => SocketState::Close,
            0x08 => SocketState::CloseWait,
            0x09 => SocketState::LastAck,
            0x0A => SocketState::Listen,
            0x0B => SocketState::Closing,
            other => SocketState::Unknown(other),
        }
    }
}

/// A socket owned by a process, as seen in one OS snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub transport: TransportKind,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub pid: u32,
    pub name: String,
    pub state: SocketState,
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Packet {
    /// 1-based frame number within the capture session.
    pub number: u64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub key: FlowKey,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub transport: TransportKind,
    pub tcp: Option<TcpHeader>,
    pub process: Option<ProcessRecord>,
    pub direction: Direction,
}

impl Packet {
    pub fn new(
        number: u64,
        src: Endpoint,
        dst: Endpoint,
        transport: TransportKind,
        payload: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Packet {
            number,
            src,
            dst,
            key: FlowKey::new(src, dst),
            payload,
            timestamp,
            transport,
            tcp: None,
            process: None,
            direction: Direction::Unknown,
        }
    }

    pub fn is_dns(&self) -> bool {
        self.transport == TransportKind::Udp
            && (self.src.port == crate::dns::DNS_PORT || self.dst.port == crate::dns::DNS_PORT)
    }

    /// One-line conversation summary, e.g. `10.0.0.2:5555 ➔ 1.1.1.1:443 [HTTPS]`.
    pub fn summary(&self) -> String {
        let tag = match self.src.port.min(self.dst.port) {
            443 => " [HTTPS]",
            80 => " [HTTP]",
            53 => " [DNS]",
            22 => " [SSH]",
            _ => "",
        };
        let role = match self.tcp {
            Some(tcp) if tcp.role() != TcpRole::Ack => format!(" {:?}", tcp.role()),
            _ => String::new(),
        };
        let process = match &self.process {
            Some(p) => format!(" ({} {})", p.name, p.pid),
            None => String::new(),
        };
        format!(
            "{} ➔ {}{}{} len={}{}",
            self.src,
            self.dst,
            tag,
            role,
            self.payload.len(),
            process
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn ep(a: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(a, a, a, a)), port)
    }

    fn hash_of(key: &FlowKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[test]
    fn flow_key_is_unordered() {
        let pairs = [
            (ep(1, 22), ep(8, 99)),
            (ep(2, 33), ep(8, 99)),
            (ep(3, 0), ep(3, 1)),
            (ep(4, 7), ep(4, 7)),
        ];
        for (a, b) in pairs {
            assert_eq!(FlowKey::new(a, b), FlowKey::new(b, a));
            assert_eq!(hash_of(&FlowKey::new(a, b)), hash_of(&FlowKey::new(b, a)));
        }
    }

    #[test]
    fn flow_key_distinguishes_endpoints() {
        assert_ne!(FlowKey::new(ep(1, 22), ep(8, 99)), FlowKey::new(ep(1, 23), ep(8, 99)));
        let mut set = HashSet::new();
        set.insert(FlowKey::new(ep(1, 22), ep(8, 99)));
        set.insert(FlowKey::new(ep(8, 99), ep(1, 22)));
        set.insert(FlowKey::new(ep(2, 33), ep(8, 99)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn syn_ack_wins_over_syn_and_ack() {
        use tcp_flags::*;
        assert_eq!(TcpRole::from_flags(SYN | ACK), TcpRole::SynAck);
        assert_eq!(TcpRole::from_flags(SYN), TcpRole::Syn);
        assert_eq!(TcpRole::from_flags(FIN | ACK), TcpRole::FinAck);
        assert_eq!(TcpRole::from_flags(FIN | PSH), TcpRole::Fin);
        assert_eq!(TcpRole::from_flags(PSH | ACK), TcpRole::Psh);
        assert_eq!(TcpRole::from_flags(URG | ACK), TcpRole::Urg);
        assert_eq!(TcpRole::from_flags(RST | ACK), TcpRole::Rst);
        assert_eq!(TcpRole::from_flags(ACK), TcpRole::Ack);
        assert_eq!(TcpRole::from_flags(ECE | CWR), TcpRole::Other);
        assert_eq!(TcpRole::from_flags(0), TcpRole::Other);
    }

    #[test]
    fn mac_parse_and_display() {
        let mac = MacAddr::parse("00:1a:2B:3c:4d:5e\n").unwrap();
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert!(MacAddr::parse("00:1a:2b").is_none());
        assert!(MacAddr::parse("00:1a:2b:3c:4d:5e:6f").is_none());
    }
}
