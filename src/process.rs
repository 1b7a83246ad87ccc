//! Socket-to-process correlation.
//!
//! A snapshot of the OS socket table is indexed by `(transport, local port)`
//! and swapped in atomically. Lookups that miss trigger one rate-limited
//! refresh before giving up.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::model::{Direction, Packet, ProcessRecord, SocketState, TransportKind};

/// Source of socket-table snapshots.
pub trait SocketTable: Send + Sync {
    /// Every TCP and UDP endpoint (IPv4 and IPv6) with its owning process.
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>>;
}

/// Reads sockets and their owners from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

struct RawSocket {
    local: SocketAddr,
    remote: SocketAddr,
    state: u8,
    inode: u64,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parses one table under `net/`. A missing file (no IPv6) is empty.
    fn read_table(&self, name: &str) -> io::Result<Vec<RawSocket>> {
        let path = self.root.join("net").join(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    event.name = "process.table_not_found",
                    path = %path.display(),
                    "skipping socket table, file not found"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut sockets = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            // header
            if idx == 0 {
                continue;
            }
            if let Some(socket) = parse_socket_line(&line?) {
                sockets.push(socket);
            }
        }
        Ok(sockets)
    }

    /// Maps socket inode → pid by walking `<pid>/fd`. Processes that vanish
    /// or deny access mid-walk are skipped.
    fn socket_owners(&self) -> io::Result<(HashMap<u64, u32>, HashMap<u32, String>)> {
        let mut owners = HashMap::new();
        let mut names = HashMap::new();

        for entry in fs::read_dir(&self.root)? {
            let Some((pid, dir)) = pid_dir(entry) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(dir.join("fd")) else {
                continue;
            };
            let mut owns_socket = false;
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                if let Some(inode) = socket_inode(&target) {
                    owners.entry(inode).or_insert(pid);
                    owns_socket = true;
                }
            }
            if owns_socket {
                names.insert(pid, read_comm(&dir));
            }
        }
        Ok((owners, names))
    }
}

/// A `<root>/<pid>` directory. Unreadable entries and non-numeric names
/// yield `None`.
fn pid_dir(entry: io::Result<fs::DirEntry>) -> Option<(u32, PathBuf)> {
    let entry = entry.ok()?;
    let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
    Some((pid, entry.path()))
}

impl SocketTable for ProcFs {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        let (owners, names) = self.socket_owners()?;
        let tables = [
            ("tcp", TransportKind::Tcp),
            ("tcp6", TransportKind::Tcp),
            ("udp", TransportKind::Udp),
            ("udp6", TransportKind::Udp),
        ];

        let mut records = Vec::new();
        for (name, transport) in tables {
            for socket in self.read_table(name)? {
                let Some(&pid) = owners.get(&socket.inode) else {
                    continue;
                };
                let state = match transport {
                    TransportKind::Tcp => SocketState::from_kernel(socket.state),
                    _ => SocketState::Unknown(socket.state),
                };
                records.push(ProcessRecord {
                    transport,
                    local: socket.local,
                    remote: socket.remote,
                    pid,
                    name: names.get(&pid).cloned().unwrap_or_default(),
                    state,
                });
            }
        }

        trace!(
            event.name = "process.snapshot_complete",
            records = records.len(),
            "read socket table"
        );
        Ok(records)
    }
}

fn read_comm(pid_dir: &Path) -> String {
    fs::read_to_string(pid_dir.join("comm"))
        .map(|s| s.trim_end().to_owned())
        .unwrap_or_default()
}

/// `socket:[12345]` → 12345
fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parses one `/proc/net/{tcp,udp}[6]` row:
/// `sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode ...`
fn parse_socket_line(line: &str) -> Option<RawSocket> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }
    Some(RawSocket {
        local: parse_hex_socket_addr(parts[1])?,
        remote: parse_hex_socket_addr(parts[2])?,
        state: u8::from_str_radix(parts[3], 16).ok()?,
        inode: parts[9].parse().ok()?,
    })
}

/// Decodes `0100007F:1F90`. The address words are printed in host byte
/// order, the port in big-endian hex.
fn parse_hex_socket_addr(s: &str) -> Option<SocketAddr> {
    let (addr, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (chunk, out) in addr.as_bytes().chunks(8).zip(octets.chunks_mut(4)) {
                let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
                out.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Snapshot indexed by `(transport, local port)`.
#[derive(Debug, Default)]
pub struct PortIndex {
    by_port: HashMap<(TransportKind, u16), ProcessRecord>,
}

impl PortIndex {
    /// The first record for a port wins.
    pub fn build(records: Vec<ProcessRecord>) -> Self {
        let mut by_port = HashMap::with_capacity(records.len());
        for record in records {
            by_port
                .entry((record.transport, record.local.port()))
                .or_insert(record);
        }
        Self { by_port }
    }

    pub fn get(&self, transport: TransportKind, port: u16) -> Option<&ProcessRecord> {
        self.by_port.get(&(transport, port))
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation<'a> {
    Found(&'a ProcessRecord),
    /// Both ports of a packet with unknown direction are owned locally.
    Ambiguous,
    Missing,
}

/// Finds the local process for `packet` using its direction to pick the
/// local port.
pub fn lookup<'a>(packet: &Packet, index: &'a PortIndex) -> Correlation<'a> {
    let by_port = move |port: u16| index.get(packet.transport, port);
    let found = |hit: Option<&'a ProcessRecord>| match hit {
        Some(record) => Correlation::Found(record),
        None => Correlation::Missing,
    };
    match packet.direction {
        Direction::Outgoing => found(by_port(packet.src.port)),
        Direction::Incoming => found(by_port(packet.dst.port)),
        Direction::Unknown => match (by_port(packet.src.port), by_port(packet.dst.port)) {
            (Some(_), Some(_)) => Correlation::Ambiguous,
            (Some(record), None) | (None, Some(record)) => Correlation::Found(record),
            (None, None) => Correlation::Missing,
        },
    }
}

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the current socket snapshot and refreshes it on demand.
pub struct ProcessCorrelator {
    source: Box<dyn SocketTable>,
    index: RwLock<Arc<PortIndex>>,
    last_refresh: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl ProcessCorrelator {
    pub fn new(source: impl SocketTable + 'static, min_interval: Duration) -> Self {
        Self {
            source: Box::new(source),
            index: RwLock::new(Arc::new(PortIndex::default())),
            last_refresh: Mutex::new(None),
            min_interval,
        }
    }

    /// Correlator over the local procfs.
    pub fn system() -> Self {
        Self::new(ProcFs::default(), DEFAULT_REFRESH_INTERVAL)
    }

    /// The current snapshot.
    pub fn index(&self) -> Arc<PortIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Takes a new snapshot and swaps it in, ignoring the rate limit.
    pub fn refresh(&self) -> io::Result<usize> {
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.rebuild()
    }

    fn rebuild(&self) -> io::Result<usize> {
        let index = Arc::new(PortIndex::build(self.source.snapshot()?));
        let len = index.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        debug!(event.name = "process.refreshed", ports = len, "process snapshot replaced");
        Ok(len)
    }

    /// Refreshes unless the last refresh is more recent than the minimum
    /// interval. Returns whether a new snapshot was installed.
    fn refresh_if_due(&self) -> bool {
        {
            let mut last = self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*last, Some(at) if at.elapsed() < self.min_interval) {
                return false;
            }
            *last = Some(Instant::now());
        }
        match self.rebuild() {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    event.name = "process.refresh_failed",
                    error = %e,
                    "failed to read socket table"
                );
                false
            }
        }
    }

    /// Looks `packet` up in the current snapshot, refreshing once on a miss.
    pub fn correlate(&self, packet: &Packet) -> Option<ProcessRecord> {
        match lookup(packet, &self.index()) {
            Correlation::Found(record) => return Some(record.clone()),
            Correlation::Ambiguous => return None,
            Correlation::Missing => {}
        }
        if !self.refresh_if_due() {
            return None;
        }
        match lookup(packet, &self.index()) {
            Correlation::Found(record) => Some(record.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ProcessCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCorrelator")
            .field("ports", &self.index().len())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}
