//! Dynamic keep/drop predicate applied by the capture loop.

use std::net::IpAddr;

use regex::{escape, Regex};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Packet;

const MAX_PATTERN_LEN: usize = 256;

/// Compiles a `*` wildcard pattern into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, ConfigError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(ConfigError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: format!("{} bytes, the limit is {MAX_PATTERN_LEN}", pattern.len()),
        });
    }

    let regex_pattern = pattern
        .split('*')
        .map(escape)
        .collect::<Vec<_>>()
        .join(".*");

    // `*` also spans line breaks: dissector keys can end in a CRLF
    Regex::new(&format!("(?s)^{regex_pattern}$")).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: e.to_string(),
    })
}

/// Uncompiled filter rules, as read from configuration or the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub include_ports: Vec<u16>,
    pub exclude_ports: Vec<u16>,
    pub include_addrs: Vec<IpAddr>,
    pub exclude_addrs: Vec<IpAddr>,
    /// Glob over the correlated process name, e.g. `firefox*`.
    pub process: Option<String>,
}

/// A pre-compiled filter. Exclusions are checked first; an empty include
/// list matches everything.
#[derive(Debug, Clone)]
pub struct PacketFilter {
    include_ports: Vec<u16>,
    exclude_ports: Vec<u16>,
    include_addrs: Vec<IpAddr>,
    exclude_addrs: Vec<IpAddr>,
    process: Option<Regex>,
}

impl PacketFilter {
    /// Fails when the process glob does not compile.
    pub fn new(spec: FilterSpec) -> Result<Self, ConfigError> {
        Ok(Self {
            process: spec.process.as_deref().map(glob_to_regex).transpose()?,
            include_ports: spec.include_ports,
            exclude_ports: spec.exclude_ports,
            include_addrs: spec.include_addrs,
            exclude_addrs: spec.exclude_addrs,
        })
    }

    /// Returns `true` if the packet should be kept.
    pub fn keep(&self, packet: &Packet) -> bool {
        let ports = [packet.src.port, packet.dst.port];
        let addrs = [packet.src.ip, packet.dst.ip];

        if ports.iter().any(|p| self.exclude_ports.contains(p)) {
            return false;
        }
        if addrs.iter().any(|a| self.exclude_addrs.contains(a)) {
            return false;
        }
        if !self.include_ports.is_empty() && !ports.iter().any(|p| self.include_ports.contains(p)) {
            return false;
        }
        if !self.include_addrs.is_empty() && !addrs.iter().any(|a| self.include_addrs.contains(a)) {
            return false;
        }
        if let Some(pattern) = &self.process {
            return packet
                .process
                .as_ref()
                .is_some_and(|p| pattern.is_match(&p.name));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, ProcessRecord, SocketState, TransportKind};

    fn packet(src_port: u16, dst: &str, dst_port: u16) -> Packet {
        Packet::new(
            1,
            Endpoint::new("10.0.0.2".parse().unwrap(), src_port),
            Endpoint::new(dst.parse().unwrap(), dst_port),
            TransportKind::Tcp,
            Vec::new(),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn glob_patterns_are_anchored() {
        let re = glob_to_regex("veth*").unwrap();
        assert!(re.is_match("veth0"));
        assert!(!re.is_match("xveth0"));
        let re = glob_to_regex("a.b*c").unwrap();
        assert!(re.is_match("a.bXYc"));
        assert!(!re.is_match("aXbc"));
        assert!(matches!(
            glob_to_regex(&"x".repeat(300)),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn exclusions_win_over_inclusions() {
        let filter = PacketFilter::new(FilterSpec {
            include_ports: vec![443],
            exclude_addrs: vec!["8.8.8.8".parse().unwrap()],
            ..Default::default()
        })
        .unwrap();
        assert!(filter.keep(&packet(5555, "1.1.1.1", 443)));
        assert!(!filter.keep(&packet(5555, "1.1.1.1", 80)));
        assert!(!filter.keep(&packet(5555, "8.8.8.8", 443)));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let filter = PacketFilter::new(FilterSpec::default()).unwrap();
        assert!(filter.keep(&packet(1, "1.1.1.1", 2)));
    }

    #[test]
    fn process_glob_requires_a_correlated_process() {
        let filter = PacketFilter::new(FilterSpec {
            process: Some("fire*".into()),
            ..Default::default()
        })
        .unwrap();
        let mut p = packet(5555, "1.1.1.1", 443);
        assert!(!filter.keep(&p));
        p.process = Some(ProcessRecord {
            transport: TransportKind::Tcp,
            local: p.src.socket_addr(),
            remote: p.dst.socket_addr(),
            pid: 42,
            name: "firefox".into(),
            state: SocketState::Established,
        });
        assert!(filter.keep(&p));
    }

    #[test]
    fn oversized_process_glob_is_rejected() {
        let err = PacketFilter::new(FilterSpec {
            process: Some(format!("{}*", "a".repeat(MAX_PATTERN_LEN))),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { ref reason, .. } if reason.contains("limit")));
    }
}
