//! End-to-end replay: packets are written to a pcap file and fed back
//! through the capture loop.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hex_literal::hex;

use vshark_core::capture_file::{read_packets, write_packets};
use vshark_core::model::{tcp_flags, ProcessRecord, SocketState, TcpHeader};
use vshark_core::process::SocketTable;
use vshark_core::{
    CaptureLoop, CaptureOptions, CaptureSource, CaptureState, Endpoint, FilterSpec, MacAddr, Packet,
    ProcessCorrelator, TransportKind,
};

const LOCAL_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
const GATEWAY_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);

// A response for example.com A 93.184.216.34, answer name compressed.
const DNS_RESPONSE: [u8; 45] = hex!(
    "1234 8180 0001 0001 0000 0000"
    "07 6578616d706c65 03 636f6d 00 0001 0001"
    "c00c 0001 0001 0000012c 0004 5db8d822"
);

fn ts(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + millis).unwrap()
}

fn local(port: u16) -> Endpoint {
    Endpoint::with_mac("10.0.0.2".parse().unwrap(), port, LOCAL_MAC)
}

fn remote(ip: &str, port: u16) -> Endpoint {
    Endpoint::with_mac(ip.parse().unwrap(), port, GATEWAY_MAC)
}

fn tcp(number: u64, src: Endpoint, dst: Endpoint, flags: u16, payload: &[u8]) -> Arc<Packet> {
    let mut p = Packet::new(number, src, dst, TransportKind::Tcp, payload.to_vec(), ts(number as i64));
    p.tcp = Some(TcpHeader {
        seq: 1000 + number as u32,
        ack: 0,
        flags,
        window: 64240,
        checksum: 0,
        header_len: 20,
        total_len: 0,
    });
    Arc::new(p)
}

fn udp(number: u64, src: Endpoint, dst: Endpoint, payload: &[u8]) -> Arc<Packet> {
    Arc::new(Packet::new(number, src, dst, TransportKind::Udp, payload.to_vec(), ts(number as i64)))
}

/// SYN out, DNS answer in, SYN+ACK in, an unrelated UDP datagram, ACK out.
fn session() -> Vec<Arc<Packet>> {
    let server = remote("93.184.216.34", 443);
    vec![
        tcp(1, local(5555), server, tcp_flags::SYN, b""),
        udp(2, remote("10.0.0.1", 53), local(40000), &DNS_RESPONSE),
        tcp(3, server, local(5555), tcp_flags::SYN | tcp_flags::ACK, b""),
        udp(4, local(6000), remote("10.0.0.9", 7000), b"ping"),
        tcp(5, local(5555), server, tcp_flags::ACK | tcp_flags::PSH, b"hello"),
    ]
}

fn write_session(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("session.pcap");
    write_packets(&path, &session()).unwrap();
    path
}

fn options() -> CaptureOptions {
    CaptureOptions {
        correlate_processes: false,
        ..CaptureOptions::default()
    }
}

fn replay(capture: &CaptureLoop, path: &Path) -> Vec<Arc<Packet>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    capture
        .start(CaptureSource::File(path.to_path_buf()), None, move |p| sink.lock().unwrap().push(p))
        .unwrap();
    capture.wait().unwrap();
    let seen = seen.lock().unwrap().clone();
    seen
}

#[test]
fn written_packets_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let packets = read_packets(&path).unwrap();
    assert_eq!(packets.len(), 5);
    assert_eq!(packets[4].payload, b"hello");
    assert_eq!(packets[2].tcp.unwrap().flags, tcp_flags::SYN | tcp_flags::ACK);
    assert_eq!(packets[1].src.port, 53);
}

#[test]
fn replay_builds_flows_and_snoops_dns() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let capture = CaptureLoop::new(options());

    let delivered = replay(&capture, &path);
    assert_eq!(capture.state(), CaptureState::Idle);

    // DNS is consumed by the cache and never delivered
    let numbers: Vec<u64> = delivered.iter().map(|p| p.number).collect();
    assert_eq!(numbers, [1, 3, 4, 5]);
    assert_eq!(
        capture.dns_cache().lookup(&"93.184.216.34".parse().unwrap()).as_deref(),
        Some("example.com")
    );

    let flows = capture.flows();
    assert_eq!(flows.len(), 2);
    let (_, tcp_flow) = &flows[0];
    let tcp_numbers: Vec<u64> = tcp_flow.iter().map(|p| p.number).collect();
    assert_eq!(tcp_numbers, [1, 3, 5]);
    assert_eq!(flows[1].1.len(), 1);

    let stats = capture.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.decoded, 5);
    assert_eq!(stats.dns, 1);
    assert_eq!(stats.delivered, 4);
    assert_eq!(capture.raw_frames().len(), 4);

    let server = remote("93.184.216.34", 443);
    assert_eq!(capture.packets_involving(&server).len(), 3);
}

#[test]
fn direction_is_unknown_for_file_replays() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let capture = CaptureLoop::new(options());
    let delivered = replay(&capture, &path);
    assert!(delivered
        .iter()
        .all(|p| p.direction == vshark_core::Direction::Unknown));
}

#[test]
fn saved_capture_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let capture = CaptureLoop::new(options());
    replay(&capture, &path);

    let saved = dir.path().join("saved.pcap");
    assert_eq!(capture.write_capture(&saved).unwrap(), 4);

    // a second session starts from scratch
    let delivered = replay(&capture, &saved);
    assert_eq!(delivered.len(), 4);
    assert_eq!(capture.flows().len(), 2);
    assert_eq!(capture.stats().dns, 0);
}

#[test]
fn ring_keeps_only_the_newest_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let capture = CaptureLoop::new(CaptureOptions {
        ring_capacity: 2,
        queue_capacity: 1,
        ..options()
    });
    replay(&capture, &path);
    let ring = capture.raw_frames();
    assert_eq!(ring.len(), 2);
    // frames 4 and 5 of the file: the UDP datagram, then the ACK
    assert_eq!(ring[0].timestamp, ts(4));
    assert_eq!(ring[1].timestamp, ts(5));
}

struct FixedTable(Vec<ProcessRecord>);

impl SocketTable for FixedTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        Ok(self.0.clone())
    }
}

#[test]
fn correlation_and_process_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());

    let local_addr = SocketAddr::new("10.0.0.2".parse::<IpAddr>().unwrap(), 5555);
    let table = FixedTable(vec![ProcessRecord {
        transport: TransportKind::Tcp,
        local: local_addr,
        remote: "93.184.216.34:443".parse().unwrap(),
        pid: 4242,
        name: "curl".into(),
        state: SocketState::Established,
    }]);
    let capture = CaptureLoop::with_correlator(options(), ProcessCorrelator::new(table, Duration::ZERO));
    capture
        .set_filter(Some(FilterSpec {
            process: Some("cur*".into()),
            ..FilterSpec::default()
        }))
        .unwrap();

    let delivered = replay(&capture, &path);
    assert_eq!(delivered.len(), 3);
    assert!(delivered
        .iter()
        .all(|p| p.process.as_ref().is_some_and(|owner| owner.pid == 4242)));
    assert_eq!(capture.stats().filtered, 1);

    // clearing the filter lets the UDP datagram through again
    capture.set_filter(None).unwrap();
    assert_eq!(replay(&capture, &path).len(), 4);
}

#[test]
fn starting_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_session(dir.path());
    let capture = CaptureLoop::new(options());
    capture
        .start(CaptureSource::File(path.clone()), None, |_| {})
        .unwrap();
    assert!(matches!(
        capture.start(CaptureSource::File(path), None, |_| {}),
        Err(vshark_core::error::CaptureError::AlreadyRunning)
    ));
    capture.stop().unwrap();
    assert_eq!(capture.state(), CaptureState::Idle);
}
