//! Live capture and file replay.
//!
//! `dumpcap` (or a capture file) feeds a producer thread that parses the
//! pcap stream and pushes raw frames into a bounded queue. One consumer
//! thread does everything else, in arrival order: decode, direction,
//! DNS snooping, process correlation, filtering, flow bucketing, the raw
//! ring and finally the caller's callback.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::capture_file::{for_each_frame, write_frames, RawFrame};
use crate::config::CaptureConfig;
use crate::decode::decode_frame;
use crate::dns::{parse_message, DnsCache};
use crate::error::{CaptureError, CaptureFileError, ConfigError};
use crate::filter::{FilterSpec, PacketFilter};
use crate::flow::{FlowTable, DEFAULT_FLOW_CAPACITY};
use crate::model::{Direction, Endpoint, FlowKey, MacAddr, Packet};
use crate::process::{ProcFs, ProcessCorrelator, DEFAULT_REFRESH_INTERVAL};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_RING_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// A network interface, captured through dumpcap.
    Device(String),
    /// A pcap or pcapng file, replayed as fast as it can be read.
    File(PathBuf),
}

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub decoded: u64,
    pub dns: u64,
    pub filtered: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub dumpcap: PathBuf,
    pub queue_capacity: usize,
    pub flow_capacity: usize,
    pub ring_capacity: usize,
    pub correlate_processes: bool,
    pub process_refresh: Duration,
    /// Where interface MAC addresses are read from.
    pub sys_class_net: PathBuf,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            dumpcap: PathBuf::from("dumpcap"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flow_capacity: DEFAULT_FLOW_CAPACITY,
            ring_capacity: DEFAULT_RING_CAPACITY,
            correlate_processes: true,
            process_refresh: DEFAULT_REFRESH_INTERVAL,
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl From<&CaptureConfig> for CaptureOptions {
    fn from(config: &CaptureConfig) -> Self {
        CaptureOptions {
            dumpcap: config.dumpcap.clone(),
            queue_capacity: config.queue_capacity.max(1),
            flow_capacity: config.flow_capacity,
            ring_capacity: config.ring_capacity,
            correlate_processes: config.correlate_processes,
            process_refresh: Duration::from_millis(config.process_refresh_ms),
            ..CaptureOptions::default()
        }
    }
}

/// Reads `<root>/<iface>/address`. Interfaces without a hardware address
/// (`any`, `lo`) yield `None`.
pub fn read_own_mac(root: &Path, iface: &str) -> Option<MacAddr> {
    let text = std::fs::read_to_string(root.join(iface).join("address")).ok()?;
    MacAddr::parse(text.trim()).filter(|mac| *mac != MacAddr::ZERO)
}

/// Direction against the interface's own MAC. Without a MAC (files, `any`)
/// the direction the decoder found in a cooked header is kept.
pub fn direction(packet: &Packet, own_mac: Option<MacAddr>) -> Direction {
    match own_mac {
        Some(own) if packet.src.mac == Some(own) => Direction::Outgoing,
        Some(own) if packet.dst.mac == Some(own) => Direction::Incoming,
        Some(_) => Direction::Unknown,
        None => packet.direction,
    }
}

/// Kills and waits for a capture child that will never be handed to a session.
fn reap(child: Option<Child>) {
    if let Some(mut child) = child {
        child.kill().ok();
        if let Err(e) = child.wait() {
            warn!(event.name = "capture.reap_failed", error = %e, "failed to reap dumpcap");
        }
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    decoded: AtomicU64,
    dns: AtomicU64,
    filtered: AtomicU64,
    delivered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            dns: self.dns.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [&self.received, &self.decoded, &self.dns, &self.filtered, &self.delivered] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// State shared with the consumer thread.
struct Shared {
    flows: Mutex<FlowTable>,
    ring: Mutex<VecDeque<RawFrame>>,
    ring_capacity: usize,
    dns: DnsCache,
    filter: RwLock<Option<PacketFilter>>,
    correlator: Option<ProcessCorrelator>,
    counters: Counters,
}

impl Shared {
    fn handle_frame(&self, frame: RawFrame, own_mac: Option<MacAddr>, on_packet: &mut dyn FnMut(Arc<Packet>)) {
        let number = Counters::bump(&self.counters.received);
        let Some(mut packet) = decode_frame(number, frame.link_type, &frame.data, frame.timestamp) else {
            trace!(event.name = "capture.frame_dropped", number, "frame did not decode");
            return;
        };
        Counters::bump(&self.counters.decoded);
        packet.direction = direction(&packet, own_mac);

        if packet.is_dns() {
            Counters::bump(&self.counters.dns);
            match parse_message(&packet.payload) {
                Ok(message) => {
                    let entries = self.dns.record(&message);
                    trace!(event.name = "capture.dns", number, id = message.id, entries);
                }
                Err(e) => debug!(
                    event.name = "capture.dns_invalid",
                    number,
                    error = %e,
                    "ignoring malformed DNS message"
                ),
            }
            return;
        }

        if let Some(correlator) = &self.correlator {
            packet.process = correlator.correlate(&packet);
        }

        let keep = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |filter| filter.keep(&packet));
        if !keep {
            Counters::bump(&self.counters.filtered);
            return;
        }

        let packet = Arc::new(packet);
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_packet(Arc::clone(&packet));

        if self.ring_capacity > 0 {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(frame);
        }

        Counters::bump(&self.counters.delivered);
        on_packet(packet);
    }

    fn consume(&self, rx: Receiver<RawFrame>, own_mac: Option<MacAddr>, mut on_packet: impl FnMut(Arc<Packet>)) {
        // ends once the producer drops its sender and the queue is empty
        for frame in rx {
            self.handle_frame(frame, own_mac, &mut on_packet);
        }
    }
}

struct Session {
    stop: Arc<AtomicBool>,
    child: Option<Child>,
    own_mac: Option<MacAddr>,
    producer: JoinHandle<Result<u64, CaptureFileError>>,
    consumer: JoinHandle<()>,
}

/// Capture driver. `start` and `stop` may be called repeatedly; each start
/// begins a fresh session with empty flows.
pub struct CaptureLoop {
    options: CaptureOptions,
    shared: Arc<Shared>,
    state: Mutex<CaptureState>,
    session: Mutex<Option<Session>>,
}

impl Default for CaptureLoop {
    fn default() -> Self {
        Self::new(CaptureOptions::default())
    }
}

impl CaptureLoop {
    pub fn new(options: CaptureOptions) -> Self {
        let correlator = options
            .correlate_processes
            .then(|| ProcessCorrelator::new(ProcFs::default(), options.process_refresh));
        Self::build(options, correlator)
    }

    /// Uses `correlator` instead of the local procfs.
    pub fn with_correlator(options: CaptureOptions, correlator: ProcessCorrelator) -> Self {
        Self::build(options, Some(correlator))
    }

    fn build(options: CaptureOptions, correlator: Option<ProcessCorrelator>) -> Self {
        let shared = Shared {
            flows: Mutex::new(FlowTable::new(options.flow_capacity)),
            ring: Mutex::new(VecDeque::new()),
            ring_capacity: options.ring_capacity,
            dns: DnsCache::new(),
            filter: RwLock::new(None),
            correlator,
            counters: Counters::default(),
        };
        CaptureLoop {
            options,
            shared: Arc::new(shared),
            state: Mutex::new(CaptureState::Idle),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Starts a session. `bpf_filter` only applies to devices.
    pub fn start<F>(&self, source: CaptureSource, bpf_filter: Option<&str>, on_packet: F) -> Result<(), CaptureError>
    where
        F: FnMut(Arc<Packet>) + Send + 'static,
    {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let (reader, mut child, own_mac): (Box<dyn Read + Send>, Option<Child>, Option<MacAddr>) = match &source {
            CaptureSource::Device(iface) => {
                let mut child = self.spawn_dumpcap(iface, bpf_filter)?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| CaptureError::Spawn(io::Error::other("dumpcap stdout is not piped")))?;
                let own_mac = read_own_mac(&self.options.sys_class_net, iface);
                (Box::new(stdout), Some(child), own_mac)
            }
            CaptureSource::File(path) => {
                if let Some(bpf) = bpf_filter {
                    warn!(
                        event.name = "capture.bpf_ignored",
                        filter = bpf,
                        "capture filters only apply to live devices"
                    );
                }
                let file = File::open(path).map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => CaptureError::File(CaptureFileError::FileNotFound { path: path.clone() }),
                    _ => CaptureError::Io(e),
                })?;
                (Box::new(file), None, None)
            }
        };

        self.shared.flows.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.shared.ring.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.shared.counters.reset();

        let (tx, rx) = sync_channel::<RawFrame>(self.options.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let producer_stop = Arc::clone(&stop);
        let producer = thread::Builder::new()
            .name("vshark-producer".into())
            .spawn(move || {
                for_each_frame(BufReader::new(reader), |frame| {
                    if producer_stop.load(Ordering::Acquire) || tx.send(frame).is_err() {
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                })
            });
        let producer = match producer {
            Ok(handle) => handle,
            Err(e) => {
                reap(child.take());
                return Err(CaptureError::Spawn(e));
            }
        };

        let shared = Arc::clone(&self.shared);
        let consumer = thread::Builder::new()
            .name("vshark-consumer".into())
            .spawn(move || shared.consume(rx, own_mac, on_packet));
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                // the receiver went down with the closure, so the producer
                // exits once dumpcap's pipe closes
                stop.store(true, Ordering::Release);
                reap(child.take());
                producer.join().ok();
                return Err(CaptureError::Spawn(e));
            }
        };

        *session = Some(Session {
            stop,
            child,
            own_mac,
            producer,
            consumer,
        });
        self.set_state(CaptureState::Capturing);
        info!(
            event.name = "capture.started",
            source = ?source,
            own_mac = ?own_mac,
            "capture started"
        );
        Ok(())
    }

    fn spawn_dumpcap(&self, iface: &str, bpf_filter: Option<&str>) -> Result<Child, CaptureError> {
        let mut cmd = Command::new(&self.options.dumpcap);
        cmd.args(["-i", iface]);
        if let Some(bpf) = bpf_filter {
            cmd.args(["-f", bpf]);
        }
        cmd.args(["-F", "pcap", "-n", "-q", "-w", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CaptureError::ToolMissing {
                tool: self.options.dumpcap.display().to_string(),
            },
            _ => CaptureError::Spawn(e),
        })
    }

    /// Stops the session: unhooks the producer, kills dumpcap, drains the
    /// queue, then reaps the child. Idle loops return the last stats.
    pub fn stop(&self) -> Result<CaptureStats, CaptureError> {
        self.shutdown(true)
    }

    /// Waits for the source to run dry (end of file, or dumpcap exiting) and
    /// then finishes the session like [`CaptureLoop::stop`].
    pub fn wait(&self) -> Result<CaptureStats, CaptureError> {
        self.shutdown(false)
    }

    fn shutdown(&self, interrupt: bool) -> Result<CaptureStats, CaptureError> {
        let Some(mut session) = self.session.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(self.stats());
        };
        self.set_state(CaptureState::Stopping);

        if interrupt {
            session.stop.store(true, Ordering::Release);
            if let Some(child) = session.child.as_mut() {
                // already exited is fine
                child.kill().ok();
            }
        }

        let produced = session.producer.join();
        let drained = session.consumer.join();
        if let Some(mut child) = session.child.take() {
            child.wait()?;
        }
        self.set_state(CaptureState::Idle);

        match produced {
            Ok(Ok(frames)) => debug!(event.name = "capture.producer_done", frames),
            Ok(Err(e)) if interrupt => debug!(event.name = "capture.producer_done", error = %e),
            Ok(Err(e)) => warn!(event.name = "capture.source_error", error = %e, "capture source ended with an error"),
            Err(_) => return Err(CaptureError::ThreadPanicked),
        }
        drained.map_err(|_| CaptureError::ThreadPanicked)?;

        let stats = self.stats();
        info!(
            event.name = "capture.stopped",
            received = stats.received,
            delivered = stats.delivered,
            dns = stats.dns,
            filtered = stats.filtered,
            own_mac = ?session.own_mac,
            "capture stopped"
        );
        Ok(stats)
    }

    /// `true` once the producer has stopped reading; the consumer may still
    /// be draining the queue.
    pub fn source_exhausted(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |session| session.producer.is_finished())
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Snapshot of every flow, in first-seen order.
    pub fn flows(&self) -> Vec<(FlowKey, Vec<Arc<Packet>>)> {
        self.shared
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .all_flows()
            .map(|(key, packets)| (*key, packets.to_vec()))
            .collect()
    }

    pub fn packets_involving(&self, endpoint: &Endpoint) -> Vec<Arc<Packet>> {
        self.shared
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .packets_involving(endpoint)
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.shared.dns
    }

    /// Replaces the packet filter; `None` keeps everything. Takes effect
    /// from the next frame on. A spec that does not compile leaves the
    /// current filter in place.
    pub fn set_filter(&self, spec: Option<FilterSpec>) -> Result<(), ConfigError> {
        let filter = spec.map(PacketFilter::new).transpose()?;
        *self.shared.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
        Ok(())
    }

    /// Frames delivered in this session, oldest first, capped at the ring
    /// capacity.
    pub fn raw_frames(&self) -> Vec<RawFrame> {
        self.shared
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Writes the raw ring as a pcap file. Returns the number of frames.
    pub fn write_capture(&self, path: impl AsRef<Path>) -> Result<usize, CaptureError> {
        let frames = self.raw_frames();
        write_frames(path, &frames)?;
        Ok(frames.len())
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(event.name = "capture.drop_failed", error = %e, "capture did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::model::TransportKind;

    fn packet_with_macs(src: MacAddr, dst: MacAddr) -> Packet {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        Packet::new(
            1,
            Endpoint::with_mac(ip, 1, src),
            Endpoint::with_mac(ip, 2, dst),
            TransportKind::Udp,
            Vec::new(),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn direction_follows_own_mac() {
        let own = MacAddr([2, 0, 0, 0, 0, 1]);
        let other = MacAddr([2, 0, 0, 0, 0, 2]);
        assert_eq!(direction(&packet_with_macs(own, other), Some(own)), Direction::Outgoing);
        assert_eq!(direction(&packet_with_macs(other, own), Some(own)), Direction::Incoming);
        assert_eq!(direction(&packet_with_macs(other, other), Some(own)), Direction::Unknown);
        assert_eq!(direction(&packet_with_macs(own, other), None), Direction::Unknown);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reap_kills_and_waits_for_the_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", child.id()));
        assert!(proc_entry.exists());
        reap(Some(child));
        // a zombie would still have its /proc entry
        assert!(!proc_entry.exists());
        reap(None);
    }

    #[test]
    fn bad_filter_is_rejected_and_keeps_the_current_one() {
        let capture = CaptureLoop::new(CaptureOptions {
            correlate_processes: false,
            ..CaptureOptions::default()
        });
        let keep_443 = FilterSpec {
            include_ports: vec![443],
            ..FilterSpec::default()
        };
        capture.set_filter(Some(keep_443)).unwrap();
        let bad = FilterSpec {
            process: Some("x".repeat(1000)),
            ..FilterSpec::default()
        };
        assert!(matches!(
            capture.set_filter(Some(bad)),
            Err(ConfigError::InvalidPattern { .. })
        ));
        let filter = capture.shared.filter.read().unwrap();
        let kept = filter.as_ref().unwrap();
        assert!(!kept.keep(&packet_with_macs(MacAddr::ZERO, MacAddr::ZERO)));
    }

    #[test]
    fn cooked_direction_is_kept_without_own_mac() {
        let own = MacAddr([2, 0, 0, 0, 0, 1]);
        let other = MacAddr([2, 0, 0, 0, 0, 2]);
        let mut packet = packet_with_macs(other, other);
        packet.direction = Direction::Outgoing;
        assert_eq!(direction(&packet, None), Direction::Outgoing);
        assert_eq!(direction(&packet, Some(own)), Direction::Unknown);
    }

    #[test]
    fn own_mac_comes_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("eth0")).unwrap();
        std::fs::write(root.path().join("eth0/address"), "02:00:00:00:00:01\n").unwrap();
        std::fs::create_dir_all(root.path().join("lo")).unwrap();
        std::fs::write(root.path().join("lo/address"), "00:00:00:00:00:00\n").unwrap();

        assert_eq!(read_own_mac(root.path(), "eth0"), Some(MacAddr([2, 0, 0, 0, 0, 1])));
        assert_eq!(read_own_mac(root.path(), "lo"), None);
        assert_eq!(read_own_mac(root.path(), "any"), None);
    }

    #[test]
    fn missing_dumpcap_is_reported() {
        let capture = CaptureLoop::new(CaptureOptions {
            dumpcap: PathBuf::from("/nonexistent/dumpcap"),
            correlate_processes: false,
            ..CaptureOptions::default()
        });
        let err = capture
            .start(CaptureSource::Device("eth0".into()), None, |_| {})
            .unwrap_err();
        assert!(matches!(err, CaptureError::ToolMissing { .. }));
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[test]
    fn stopping_an_idle_loop_is_a_no_op() {
        let capture = CaptureLoop::new(CaptureOptions {
            correlate_processes: false,
            ..CaptureOptions::default()
        });
        assert_eq!(capture.stop().unwrap(), CaptureStats::default());
        assert!(matches!(
            capture.start(CaptureSource::File("/nonexistent.pcap".into()), None, |_| {}),
            Err(CaptureError::File(CaptureFileError::FileNotFound { .. }))
        ));
    }
}
