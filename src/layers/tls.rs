//! `tls` layer.

use super::contract::{colon_hex, find_scalar, integer, text, Contract};
use crate::tree::Node;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsLayer {
    pub records: Vec<TlsRecord>,
}

impl TlsLayer {
    pub fn handshakes(&self) -> impl Iterator<Item = &TlsHandshake> {
        self.records.iter().flat_map(|r| r.handshakes.iter())
    }

    /// SNI of the first ClientHello in the layer.
    pub fn server_name(&self) -> Option<&str> {
        self.handshakes().find_map(|h| h.server_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: u8,
    pub version: u16,
    pub length: u16,
    pub handshakes: Vec<TlsHandshake>,
    /// Set by tshark once the record is decrypted, e.g. `http-over-tls`.
    pub app_data_protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsHandshake {
    pub kind: u8,
    pub length: u32,
    pub version: u16,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    /// The suite the server picked, on a ServerHello.
    pub cipher_suite: Option<u16>,
    pub server_name: Option<String>,
    /// Extension summaries (`server_name (len=16)`, ...).
    pub extensions: Vec<String>,
}

pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;

fn handshake_contract() -> Contract<TlsHandshake> {
    Contract::new("tls.handshake")
        .plain("tls.handshake.type", |h: &mut TlsHandshake, v| {
            h.kind = integer(v, "tls.handshake.type")?;
            Ok(())
        })
        .plain("tls.handshake.length", |h: &mut TlsHandshake, v| {
            h.length = integer(v, "tls.handshake.length")?;
            Ok(())
        })
        .plain("tls.handshake.version", |h: &mut TlsHandshake, v| {
            h.version = integer(v, "tls.handshake.version")?;
            Ok(())
        })
        .plain("tls.handshake.random", |h: &mut TlsHandshake, v| {
            h.random = colon_hex(v, "tls.handshake.random")?;
            Ok(())
        })
        .plain("tls.handshake.session_id", |h: &mut TlsHandshake, v| {
            h.session_id = colon_hex(v, "tls.handshake.session_id")?;
            Ok(())
        })
        .plain("tls.handshake.ciphersuites", |h: &mut TlsHandshake, v| {
            if let Node::Object(fields) = v {
                for (key, value) in fields {
                    if key == "tls.handshake.ciphersuite" {
                        for suite in value.occurrences() {
                            h.cipher_suites.push(integer(suite, key)?);
                        }
                    }
                }
            }
            Ok(())
        })
        .plain("tls.handshake.ciphersuite", |h: &mut TlsHandshake, v| {
            h.cipher_suite = Some(integer(v, "tls.handshake.ciphersuite")?);
            Ok(())
        })
        .dynamic("Extension: server_name*", |h: &mut TlsHandshake, key, v| {
            h.extensions.push(extension_name(key));
            h.server_name = find_scalar(v, "tls.handshake.extensions_server_name").map(str::to_owned);
            Ok(())
        })
        .dynamic("Extension: *", |h: &mut TlsHandshake, key, _| {
            h.extensions.push(extension_name(key));
            Ok(())
        })
}

fn extension_name(key: &str) -> String {
    key.strip_prefix("Extension: ").unwrap_or(key).to_owned()
}

fn record_contract() -> Contract<TlsRecord> {
    let handshake = handshake_contract();
    Contract::new("tls.record")
        .plain("tls.record.content_type", |r: &mut TlsRecord, v| {
            r.content_type = integer(v, "tls.record.content_type")?;
            Ok(())
        })
        .plain("tls.record.opaque_type", |r: &mut TlsRecord, v| {
            r.content_type = integer(v, "tls.record.opaque_type")?;
            Ok(())
        })
        .plain("tls.record.version", |r: &mut TlsRecord, v| {
            r.version = integer(v, "tls.record.version")?;
            Ok(())
        })
        .plain("tls.record.length", |r: &mut TlsRecord, v| {
            r.length = integer(v, "tls.record.length")?;
            Ok(())
        })
        .plain("tls.app_data_proto", |r: &mut TlsRecord, v| {
            r.app_data_protocol = Some(text(v, "tls.app_data_proto")?);
            Ok(())
        })
        .aggregate("tls.handshake", move |r: &mut TlsRecord, v| {
            // a bare marker string appears for encrypted handshake messages
            if v.as_object().is_some() {
                r.handshakes.push(handshake.map(v)?);
            }
            Ok(())
        })
}

pub fn contract() -> Contract<TlsLayer> {
    let record = record_contract();
    Contract::new("tls").aggregate("tls.record", move |t: &mut TlsLayer, v| {
        if v.as_object().is_some() {
            t.records.push(record.map(v)?);
        }
        Ok(())
    })
}
