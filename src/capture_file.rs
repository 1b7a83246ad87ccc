//! Capture file reading (pcap and pcapng) and pcap writing.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cookie_factory::bytes::{be_u16, be_u32, be_u8};
use cookie_factory::combinator::slice;
use cookie_factory::sequence::tuple;
use cookie_factory::gen_simple;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, Block, LegacyPcapBlock, Linktype, PcapBlockOwned, PcapError, PcapHeader, ToVec};
use tracing::{debug, warn};

use crate::decode::{decode_frame, ETHERTYPE_IPV4, IPPROTO_TCP, IPPROTO_UDP, LINKTYPE_ETHERNET};
use crate::error::CaptureFileError;
use crate::model::{MacAddr, Packet, TransportKind};

const READ_BUFFER: usize = 1 << 20;
const SNAPLEN: u32 = 262_144;

/// One captured frame as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub link_type: i32,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub orig_len: u32,
}

impl RawFrame {
    pub fn new(link_type: i32, timestamp: DateTime<Utc>, data: Vec<u8>) -> Self {
        let orig_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        RawFrame {
            link_type,
            timestamp,
            data,
            orig_len,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link_type: i32,
    resolution: u64,
    offset: i64,
}

impl Default for Interface {
    fn default() -> Self {
        Interface {
            link_type: LINKTYPE_ETHERNET,
            resolution: 1_000_000,
            offset: 0,
        }
    }
}

fn invalid(reason: impl Into<String>) -> CaptureFileError {
    CaptureFileError::InvalidFormat {
        reason: reason.into(),
    }
}

fn timestamp(secs: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Streams every packet frame of a pcap or pcapng source into `on_frame`
/// until the source ends or the callback breaks. Returns the number of
/// frames delivered.
pub fn for_each_frame<R, F>(source: R, mut on_frame: F) -> Result<u64, CaptureFileError>
where
    R: Read + Send,
    F: FnMut(RawFrame) -> ControlFlow<()>,
{
    let mut reader =
        create_reader(READ_BUFFER, source).map_err(|e| invalid(format!("{e:?}")))?;
    let mut legacy = Interface::default();
    let mut legacy_nanos = false;
    let mut interfaces: Vec<Interface> = Vec::new();
    let mut delivered = 0;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        legacy.link_type = header.network.0;
                        legacy_nanos = header.is_nanosecond_precision();
                        None
                    }
                    PcapBlockOwned::Legacy(b) => {
                        let nanos = if legacy_nanos {
                            b.ts_usec
                        } else {
                            b.ts_usec.saturating_mul(1_000)
                        };
                        Some(RawFrame {
                            link_type: legacy.link_type,
                            timestamp: timestamp(b.ts_sec as i64, nanos),
                            data: b.data.to_vec(),
                            orig_len: b.origlen,
                        })
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(Interface {
                            link_type: idb.linktype.0,
                            resolution: idb.ts_resolution().unwrap_or(1_000_000),
                            offset: idb.ts_offset(),
                        });
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let iface = interfaces.get(epb.if_id as usize).copied().unwrap_or_default();
                        let (secs, frac) = epb.decode_ts(iface.offset as u64, iface.resolution);
                        let nanos = if iface.resolution == 0 {
                            0
                        } else {
                            (frac as u64 * 1_000_000_000 / iface.resolution) as u32
                        };
                        let len = (epb.caplen as usize).min(epb.data.len());
                        Some(RawFrame {
                            link_type: iface.link_type,
                            timestamp: timestamp(secs as i64, nanos),
                            data: epb.data[..len].to_vec(),
                            orig_len: epb.origlen,
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        let iface = interfaces.first().copied().unwrap_or_default();
                        let len = (spb.origlen as usize).min(spb.data.len());
                        Some(RawFrame {
                            link_type: iface.link_type,
                            timestamp: DateTime::<Utc>::default(),
                            data: spb.data[..len].to_vec(),
                            orig_len: spb.origlen,
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);

                if let Some(frame) = frame {
                    delivered += 1;
                    if on_frame(frame).is_break() {
                        break;
                    }
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| invalid(format!("refill failed: {e:?}")))?;
            }
            Err(PcapError::UnexpectedEof) => {
                warn!(
                    event.name = "capture_file.truncated",
                    frames = delivered,
                    "capture stream ended inside a block"
                );
                break;
            }
            Err(e) => return Err(invalid(format!("{e:?}"))),
        }
    }

    Ok(delivered)
}

fn open(path: &Path) -> Result<File, CaptureFileError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CaptureFileError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => CaptureFileError::Io(e),
    })
}

/// Reads every frame of a pcap or pcapng file.
pub fn read_frames(path: impl AsRef<Path>) -> Result<Vec<RawFrame>, CaptureFileError> {
    let file = open(path.as_ref())?;
    let mut frames = Vec::new();
    for_each_frame(BufReader::new(file), |frame| {
        frames.push(frame);
        ControlFlow::Continue(())
    })?;
    Ok(frames)
}

/// Reads a capture file and decodes it. Frame numbers are 1-based positions
/// in the file, so frames that do not decode leave gaps.
pub fn read_packets(path: impl AsRef<Path>) -> Result<Vec<Packet>, CaptureFileError> {
    let frames = read_frames(path)?;
    Ok(frames
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| decode_frame(idx as u64 + 1, f.link_type, &f.data, f.timestamp))
        .collect())
}

/// Writes legacy pcap records to any sink.
pub struct PcapWriter<W: Write> {
    out: W,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut out: W, link_type: i32) -> Result<Self, CaptureFileError> {
        let mut header = PcapHeader::new();
        header.snaplen = SNAPLEN;
        header.network = Linktype(link_type);
        let bytes = header.to_vec().map_err(serialize_error)?;
        out.write_all(&bytes)?;
        Ok(Self { out })
    }

    pub fn write_frame(&mut self, frame: &RawFrame) -> Result<(), CaptureFileError> {
        let ts_sec: u32 = fits("timestamp", frame.timestamp.timestamp())?;
        let caplen: u32 = fits("captured length", frame.data.len())?;
        let mut block = LegacyPcapBlock {
            ts_sec,
            ts_usec: frame.timestamp.timestamp_subsec_micros(),
            caplen,
            origlen: frame.orig_len.max(caplen),
            data: &frame.data,
        };
        let bytes = block.to_vec().map_err(serialize_error)?;
        self.out.write_all(&bytes)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, CaptureFileError> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Converts `value` into a narrower header field, or names the field that
/// overflowed.
fn fits<T, V>(field: &'static str, value: V) -> Result<T, CaptureFileError>
where
    V: Copy + TryInto<T> + TryInto<i64>,
{
    TryInto::<T>::try_into(value).map_err(|_| CaptureFileError::OutOfRange {
        field,
        value: TryInto::<i64>::try_into(value).unwrap_or(i64::MAX),
    })
}

fn serialize_error(e: cookie_factory::GenError) -> CaptureFileError {
    CaptureFileError::Serialize {
        reason: format!("{e:?}"),
    }
}

/// Serializes frames into an in-memory pcap image.
pub fn frames_to_pcap(frames: &[RawFrame]) -> Result<Vec<u8>, CaptureFileError> {
    let link_type = frames.first().map_or(LINKTYPE_ETHERNET, |f| f.link_type);
    let mut writer = PcapWriter::new(Vec::new(), link_type)?;
    for frame in frames {
        if frame.link_type != link_type {
            debug!(
                event.name = "capture_file.link_type_mismatch",
                expected = link_type,
                found = frame.link_type,
                "skipping frame with a different link type"
            );
            continue;
        }
        writer.write_frame(frame)?;
    }
    writer.finish()
}

/// Writes raw frames as a pcap file.
pub fn write_frames(path: impl AsRef<Path>, frames: &[RawFrame]) -> Result<(), CaptureFileError> {
    let bytes = frames_to_pcap(frames)?;
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

/// RFC 1071 checksum over an IPv4 header whose checksum field is zero.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Rebuilds an Ethernet/IPv4/TCP|UDP frame from a decoded packet. TCP
/// options are not retained, so the segment always has a 20-byte header.
/// Returns `None` for packets that cannot be expressed that way.
pub fn encode_packet(packet: &Packet) -> Result<Option<Vec<u8>>, CaptureFileError> {
    let (std::net::IpAddr::V4(src_ip), std::net::IpAddr::V4(dst_ip)) = (packet.src.ip, packet.dst.ip)
    else {
        return Ok(None);
    };

    let transport = match packet.transport {
        TransportKind::Tcp => {
            let tcp = packet.tcp.unwrap_or(crate::model::TcpHeader {
                seq: 0,
                ack: 0,
                flags: 0,
                window: 0,
                checksum: 0,
                header_len: 20,
                total_len: 0,
            });
            gen_simple(
                tuple((
                    be_u16(packet.src.port),
                    be_u16(packet.dst.port),
                    be_u32(tcp.seq),
                    be_u32(tcp.ack),
                    be_u16((5 << 12) | (tcp.flags & 0x01FF)),
                    be_u16(tcp.window),
                    be_u16(tcp.checksum),
                    be_u16(0),
                    slice(&packet.payload),
                )),
                Vec::new(),
            )
        }
        TransportKind::Udp => gen_simple(
            tuple((
                be_u16(packet.src.port),
                be_u16(packet.dst.port),
                be_u16(fits("UDP length", 8 + packet.payload.len())?),
                be_u16(0),
                slice(&packet.payload),
            )),
            Vec::new(),
        ),
        TransportKind::Other => return Ok(None),
    }
    .map_err(serialize_error)?;

    let protocol = match packet.transport {
        TransportKind::Tcp => IPPROTO_TCP,
        _ => IPPROTO_UDP,
    };
    let mut ip_header = gen_simple(
        tuple((
            be_u8(0x45),
            be_u8(0),
            be_u16(fits("IPv4 total length", 20 + transport.len())?),
            // the identification field wraps
            be_u16((packet.number & 0xFFFF) as u16),
            be_u16(0x4000),
            be_u8(64),
            be_u8(protocol),
            be_u16(0),
            slice(&src_ip.octets()),
            slice(&dst_ip.octets()),
        )),
        Vec::new(),
    )
    .map_err(serialize_error)?;
    let checksum = ipv4_checksum(&ip_header);
    ip_header[10..12].copy_from_slice(&checksum.to_be_bytes());

    let dst_mac = packet.dst.mac.unwrap_or(MacAddr::ZERO);
    let src_mac = packet.src.mac.unwrap_or(MacAddr::ZERO);
    let frame = gen_simple(
        tuple((
            slice(&dst_mac.0),
            slice(&src_mac.0),
            be_u16(ETHERTYPE_IPV4),
            slice(&ip_header),
            slice(&transport),
        )),
        Vec::new(),
    )
    .map_err(serialize_error)?;
    Ok(Some(frame))
}

/// Synthesizes one Ethernet frame per packet, skipping those that cannot be
/// encoded.
pub fn packets_to_frames<'a, I>(packets: I) -> Result<Vec<RawFrame>, CaptureFileError>
where
    I: IntoIterator<Item = &'a Arc<Packet>>,
{
    let mut frames = Vec::new();
    for packet in packets {
        match encode_packet(packet)? {
            Some(data) => frames.push(RawFrame::new(LINKTYPE_ETHERNET, packet.timestamp, data)),
            None => debug!(
                event.name = "capture_file.packet_skipped",
                number = packet.number,
                "packet cannot be re-encoded as an IPv4 frame"
            ),
        }
    }
    Ok(frames)
}

/// Writes decoded packets as synthetic Ethernet frames to a pcap file.
pub fn write_packets<'a, I>(path: impl AsRef<Path>, packets: I) -> Result<(), CaptureFileError>
where
    I: IntoIterator<Item = &'a Arc<Packet>>,
{
    write_frames(path, &packets_to_frames(packets)?)
}
