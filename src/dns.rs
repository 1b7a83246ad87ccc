//! DNS message parser (RFC 1035 §4) and the inline resolution cache.
//!
//! Names are decoded against the whole message so compression pointers work
//! from inside bounded record-data slices. Every pointer must target an
//! offset strictly before both itself and any earlier pointer of the same
//! name, so adversarial or cyclic names always terminate.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{PoisonError, RwLock};

use nom::bytes::complete::take;
use nom::multi::{count, length_data};
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::sequence::tuple;
use nom::{IResult, Offset};
use tracing::trace;

use crate::error::DnsError;

pub const DNS_PORT: u16 = 53;

const MAX_LABELS: usize = 128;
const MAX_NAME_BYTES: usize = 255;

type Res<'a, T> = IResult<&'a [u8], T, DnsError>;

/// The 16-bit flags word of a DNS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsFlags(pub u16);

impl DnsFlags {
    pub fn is_response(&self) -> bool {
        self.0 & 0x8000 != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.0 >> 11) & 0x0F) as u8
    }

    pub fn authoritative(&self) -> bool {
        self.0 & 0x0400 != 0
    }

    pub fn truncated(&self) -> bool {
        self.0 & 0x0200 != 0
    }

    pub fn recursion_desired(&self) -> bool {
        self.0 & 0x0100 != 0
    }

    pub fn recursion_available(&self) -> bool {
        self.0 & 0x0080 != 0
    }

    pub fn z(&self) -> bool {
        self.0 & 0x0040 != 0
    }

    pub fn authentic_data(&self) -> bool {
        self.0 & 0x0020 != 0
    }

    pub fn checking_disabled(&self) -> bool {
        self.0 & 0x0010 != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.0 & 0x000F) as u8
    }

    /// QUERY, IQUERY and STATUS are the only opcodes with a defined body.
    pub fn has_defined_body(&self) -> bool {
        self.opcode() <= 2
    }
}

/// A domain name as its sequence of labels. The root name has no labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(pub Vec<String>);

impl DomainName {
    pub fn labels(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(rtype: RecordType) -> u16 {
        match rtype {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(DomainName),
    Ns(DomainName),
    Ptr(DomainName),
    Mx {
        preference: u16,
        exchange: DomainName,
    },
    Soa {
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },
    Txt(Vec<Vec<u8>>),
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: DomainName,
    pub qtype: RecordType,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: DomainName,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionCounts {
    pub questions: u16,
    pub answers: u16,
    pub authorities: u16,
    pub additionals: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: DnsFlags,
    /// `None` when the opcode leaves the body undefined.
    pub counts: Option<SectionCounts>,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

/// Decodes the name starting at absolute offset `start`. Returns the name and
/// the offset just past it in the original (non-pointer) byte stream.
pub fn read_name(msg: &[u8], start: usize) -> Result<(DomainName, usize), DnsError> {
    let mut labels = Vec::new();
    let mut pos = start;
    let mut end = None;
    let mut last_target = usize::MAX;
    let mut wire_len = 1;

    loop {
        let len = *msg.get(pos).ok_or(DnsError::Truncated)? as usize;
        if len >= 0xC0 {
            let low = *msg.get(pos + 1).ok_or(DnsError::Truncated)? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if target >= pos.min(last_target) {
                return Err(DnsError::BadPointer { at: pos, target });
            }
            end.get_or_insert(pos + 2);
            last_target = target;
            pos = target;
            continue;
        }
        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }
        let label = msg
            .get(pos + 1..pos + 1 + len)
            .ok_or(DnsError::Truncated)?;
        wire_len += len + 1;
        if labels.len() >= MAX_LABELS || wire_len > MAX_NAME_BYTES {
            return Err(DnsError::NameTooLong);
        }
        let label = std::str::from_utf8(label).map_err(|_| DnsError::InvalidLabel)?;
        labels.push(label.to_owned());
        pos += 1 + len;
    }

    // `end` is always set before the loop breaks
    Ok((DomainName(labels), end.unwrap_or(pos + 1)))
}

fn name<'m>(msg: &'m [u8]) -> impl Fn(&'m [u8]) -> Res<'m, DomainName> {
    move |i: &'m [u8]| {
        let start = msg.offset(i);
        let (name, end) = read_name(msg, start).map_err(nom::Err::Error)?;
        let consumed = end - start;
        if consumed > i.len() {
            return Err(nom::Err::Error(DnsError::Truncated));
        }
        Ok((&i[consumed..], name))
    }
}

fn question<'m>(msg: &'m [u8]) -> impl Fn(&'m [u8]) -> Res<'m, Question> {
    move |i: &'m [u8]| {
        let (i, (name, qtype, qclass)) = tuple((name(msg), be_u16, be_u16))(i)?;
        Ok((
            i,
            Question {
                name,
                qtype: qtype.into(),
                qclass,
            },
        ))
    }
}

fn txt_strings(mut i: &[u8]) -> Res<'_, Vec<Vec<u8>>> {
    let mut strings = Vec::new();
    while !i.is_empty() {
        let (rest, s) = length_data(be_u8)(i)?;
        strings.push(s.to_vec());
        i = rest;
    }
    Ok((i, strings))
}

/// Parses record data from a slice bounded by RDLENGTH.
fn record_data<'m>(
    msg: &'m [u8],
    rtype: RecordType,
) -> impl Fn(&'m [u8]) -> Res<'m, RecordData> {
    move |i: &'m [u8]| match rtype {
        RecordType::A => {
            let (i, raw) = be_u32(i)?;
            Ok((i, RecordData::A(Ipv4Addr::from(raw))))
        }
        RecordType::Aaaa => {
            let (i, raw) = take(16usize)(i)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok((i, RecordData::Aaaa(Ipv6Addr::from(octets))))
        }
        RecordType::Cname => {
            let (i, n) = name(msg)(i)?;
            Ok((i, RecordData::Cname(n)))
        }
        RecordType::Ns => {
            let (i, n) = name(msg)(i)?;
            Ok((i, RecordData::Ns(n)))
        }
        RecordType::Ptr => {
            let (i, n) = name(msg)(i)?;
            Ok((i, RecordData::Ptr(n)))
        }
        RecordType::Mx => {
            let (i, (preference, exchange)) = tuple((be_u16, name(msg)))(i)?;
            Ok((
                i,
                RecordData::Mx {
                    preference,
                    exchange,
                },
            ))
        }
        RecordType::Soa => {
            let (i, (mname, rname, serial, refresh, retry, expire, minimum)) = tuple((
                name(msg),
                name(msg),
                be_u32,
                be_u32,
                be_u32,
                be_u32,
                be_u32,
            ))(i)?;
            Ok((
                i,
                RecordData::Soa {
                    mname,
                    rname,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                },
            ))
        }
        RecordType::Srv => {
            let (i, (priority, weight, port, target)) =
                tuple((be_u16, be_u16, be_u16, name(msg)))(i)?;
            Ok((
                i,
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                },
            ))
        }
        RecordType::Txt => {
            let (i, strings) = txt_strings(i)?;
            Ok((i, RecordData::Txt(strings)))
        }
        RecordType::Other(_) => Ok((&i[i.len()..], RecordData::Opaque(i.to_vec()))),
    }
}

fn resource_record<'m>(msg: &'m [u8]) -> impl Fn(&'m [u8]) -> Res<'m, ResourceRecord> {
    move |i: &'m [u8]| {
        let (i, (name, rtype, class, ttl, rdata)) = tuple((
            name(msg),
            be_u16,
            be_u16,
            be_u32,
            length_data(be_u16),
        ))(i)?;
        let rtype = RecordType::from(rtype);
        let (_, data) = record_data(msg, rtype)(rdata)?;
        Ok((
            i,
            ResourceRecord {
                name,
                rtype,
                class,
                ttl,
                data,
            },
        ))
    }
}

fn message(msg: &[u8]) -> Res<'_, DnsMessage> {
    let (i, (id, flags)) = tuple((be_u16, be_u16))(msg)?;
    let flags = DnsFlags(flags);
    let mut out = DnsMessage {
        id,
        flags,
        counts: None,
        questions: Vec::new(),
        answers: Vec::new(),
        authorities: Vec::new(),
        additionals: Vec::new(),
    };
    if !flags.has_defined_body() {
        return Ok((i, out));
    }

    let (i, (qd, an, ns, ar)) = tuple((be_u16, be_u16, be_u16, be_u16))(i)?;
    let (i, questions) = count(question(msg), qd as usize)(i)?;
    let (i, answers) = count(resource_record(msg), an as usize)(i)?;
    let (i, authorities) = count(resource_record(msg), ns as usize)(i)?;
    let (i, additionals) = count(resource_record(msg), ar as usize)(i)?;

    out.counts = Some(SectionCounts {
        questions: qd,
        answers: an,
        authorities: ns,
        additionals: ar,
    });
    out.questions = questions;
    out.answers = answers;
    out.authorities = authorities;
    out.additionals = additionals;
    Ok((i, out))
}

/// Parses a complete DNS message.
pub fn parse_message(msg: &[u8]) -> Result<DnsMessage, DnsError> {
    match message(msg) {
        Ok((_, m)) => Ok(m),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(_)) => Err(DnsError::Truncated),
    }
}

/// IP address → most recently seen query name. Last write wins.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: RwLock<HashMap<IpAddr, String>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every A/AAAA answer of a response under the queried name.
    /// Returns the number of entries written.
    pub fn record(&self, message: &DnsMessage) -> usize {
        if !message.flags.is_response() {
            return 0;
        }
        let mut updates = Vec::new();
        for answer in &message.answers {
            let ip = match answer.data {
                RecordData::A(v4) => IpAddr::V4(v4),
                RecordData::Aaaa(v6) => IpAddr::V6(v6),
                _ => continue,
            };
            let name = message
                .questions
                .first()
                .map(|q| &q.name)
                .unwrap_or(&answer.name);
            updates.push((ip, name.to_string()));
        }
        if updates.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (ip, name) in &updates {
            trace!(event.name = "dns.cache_update", ip = %ip, name = %name, "dns cache updated");
            entries.insert(*ip, name.clone());
        }
        updates.len()
    }

    pub fn insert(&self, ip: IpAddr, name: impl Into<String>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip, name.into());
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<IpAddr, String> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
