//! `dns` layer.
//!
//! tshark nests questions and records under summary keys such as
//! `example.com: type A, class IN, addr 93.184.216.34`; the name and type
//! are read from the key itself.

use super::contract::{boolean, integer, text, Contract};
use crate::error::MapError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsLayer {
    pub id: u16,
    pub flags: u16,
    pub is_response: bool,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
    pub queries: Vec<DnsQuery>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    /// Frame number of the matching query, on responses.
    pub response_to: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub type_name: String,
    pub qtype: u16,
    pub class: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub type_name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    /// Address, target name or text, depending on the type.
    pub data: Option<String>,
}

/// `name: type A, class IN[, ...]` → (`name`, `A`)
fn parse_summary(key: &str) -> Result<(String, String), MapError> {
    let bad = || MapError::InvalidValue {
        field: "dns summary".to_owned(),
        value: key.to_owned(),
        expected: "`<name>: type <TYPE>, ...`",
    };
    let (name, rest) = key.rsplit_once(": type ").ok_or_else(bad)?;
    let type_name = rest.split(',').next().unwrap_or_default().trim();
    if type_name.is_empty() {
        return Err(bad());
    }
    Ok((name.to_owned(), type_name.to_owned()))
}

fn query_contract() -> Contract<DnsQuery> {
    Contract::new("dns.query")
        .plain("dns.qry.name", |q: &mut DnsQuery, v| {
            q.name = text(v, "dns.qry.name")?;
            Ok(())
        })
        .plain("dns.qry.type", |q: &mut DnsQuery, v| {
            q.qtype = integer(v, "dns.qry.type")?;
            Ok(())
        })
        .plain("dns.qry.class", |q: &mut DnsQuery, v| {
            q.class = integer(v, "dns.qry.class")?;
            Ok(())
        })
}

const RECORD_DATA_FIELDS: [&str; 8] = [
    "dns.a",
    "dns.aaaa",
    "dns.cname",
    "dns.ns",
    "dns.ptr.domain_name",
    "dns.mx.mail_exchange",
    "dns.srv.target",
    "dns.txt",
];

fn record_contract() -> Contract<DnsRecord> {
    let mut contract = Contract::new("dns.record")
        .plain("dns.resp.name", |r: &mut DnsRecord, v| {
            r.name = text(v, "dns.resp.name")?;
            Ok(())
        })
        .plain("dns.resp.type", |r: &mut DnsRecord, v| {
            r.rtype = integer(v, "dns.resp.type")?;
            Ok(())
        })
        .plain("dns.resp.class", |r: &mut DnsRecord, v| {
            r.class = integer(v, "dns.resp.class")?;
            Ok(())
        })
        .plain("dns.resp.ttl", |r: &mut DnsRecord, v| {
            r.ttl = integer(v, "dns.resp.ttl")?;
            Ok(())
        });
    for field in RECORD_DATA_FIELDS {
        contract = contract.plain(field, move |r: &mut DnsRecord, v| {
            r.data = Some(text(v, field)?);
            Ok(())
        });
    }
    contract
}

fn queries_contract() -> Contract<Vec<DnsQuery>> {
    let query = query_contract();
    Contract::new("dns.queries").dynamic("*: type *", move |list: &mut Vec<DnsQuery>, key, v| {
        let (name, type_name) = parse_summary(key)?;
        let mut q = query.map(v)?;
        if q.name.is_empty() {
            q.name = name;
        }
        q.type_name = type_name;
        list.push(q);
        Ok(())
    })
}

fn records_contract(section: &'static str) -> Contract<Vec<DnsRecord>> {
    let record = record_contract();
    Contract::new(section).dynamic("*: type *", move |list: &mut Vec<DnsRecord>, key, v| {
        let (name, type_name) = parse_summary(key)?;
        let mut r = record.map(v)?;
        if r.name.is_empty() {
            r.name = name;
        }
        r.type_name = type_name;
        list.push(r);
        Ok(())
    })
}

pub fn contract() -> Contract<DnsLayer> {
    let queries = queries_contract();
    let answers = records_contract("dns.answers");
    let authorities = records_contract("dns.authorities");
    let additionals = records_contract("dns.additionals");

    Contract::new("dns")
        .plain("dns.id", |d: &mut DnsLayer, v| {
            d.id = integer(v, "dns.id")?;
            Ok(())
        })
        .plain("dns.flags", |d: &mut DnsLayer, v| {
            d.flags = integer(v, "dns.flags")?;
            Ok(())
        })
        .plain("dns.flags_tree", |d: &mut DnsLayer, v| {
            if let Some(response) = v.get("dns.flags.response") {
                d.is_response = boolean(response, "dns.flags.response")?;
            }
            Ok(())
        })
        .plain("dns.count.queries", |d: &mut DnsLayer, v| {
            d.question_count = integer(v, "dns.count.queries")?;
            Ok(())
        })
        .plain("dns.count.answers", |d: &mut DnsLayer, v| {
            d.answer_count = integer(v, "dns.count.answers")?;
            Ok(())
        })
        .plain("dns.count.auth_rr", |d: &mut DnsLayer, v| {
            d.authority_count = integer(v, "dns.count.auth_rr")?;
            Ok(())
        })
        .plain("dns.count.add_rr", |d: &mut DnsLayer, v| {
            d.additional_count = integer(v, "dns.count.add_rr")?;
            Ok(())
        })
        .plain("Queries", move |d: &mut DnsLayer, v| {
            d.queries = queries.map(v)?;
            Ok(())
        })
        .plain("Answers", move |d: &mut DnsLayer, v| {
            d.answers = answers.map(v)?;
            Ok(())
        })
        .plain("Authoritative nameservers", move |d: &mut DnsLayer, v| {
            d.authorities = authorities.map(v)?;
            Ok(())
        })
        .plain("Additional records", move |d: &mut DnsLayer, v| {
            d.additionals = additionals.map(v)?;
            Ok(())
        })
        .plain("dns.response_to", |d: &mut DnsLayer, v| {
            d.response_to = Some(integer(v, "dns.response_to")?);
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build;

    #[test]
    fn maps_a_response() {
        let json = r#"{
            "dns.id": "0x1234",
            "dns.flags": "0x8180",
            "dns.flags_tree": {"dns.flags.response": "1", "dns.flags.opcode": "0"},
            "dns.count.queries": "1",
            "dns.count.answers": "2",
            "dns.count.auth_rr": "0",
            "dns.count.add_rr": "0",
            "Queries": {
                "example.com: type A, class IN": {
                    "dns.qry.name": "example.com",
                    "dns.qry.type": "1",
                    "dns.qry.class": "0x0001"
                }
            },
            "Answers": {
                "example.com: type A, class IN, addr 93.184.216.34": {
                    "dns.resp.name": "example.com",
                    "dns.resp.type": "1",
                    "dns.resp.class": "0x0001",
                    "dns.resp.ttl": "300",
                    "dns.a": "93.184.216.34"
                },
                "www.example.com: type CNAME, class IN, cname example.com": {
                    "dns.resp.type": "5",
                    "dns.resp.ttl": "60",
                    "dns.cname": "example.com"
                }
            },
            "dns.response_to": "1"
        }"#;
        let node = build(json).unwrap().remove(0);
        let dns = contract().map(&node).unwrap();
        assert_eq!(dns.id, 0x1234);
        assert!(dns.is_response);
        assert_eq!(dns.answer_count, 2);
        assert_eq!(dns.queries.len(), 1);
        assert_eq!(dns.queries[0].name, "example.com");
        assert_eq!(dns.queries[0].type_name, "A");
        assert_eq!(dns.queries[0].class, 1);
        assert_eq!(dns.answers[0].data.as_deref(), Some("93.184.216.34"));
        assert_eq!(dns.answers[0].ttl, 300);
        // name recovered from the summary key
        assert_eq!(dns.answers[1].name, "www.example.com");
        assert_eq!(dns.answers[1].type_name, "CNAME");
        assert_eq!(dns.response_to, Some(1));
    }

    #[test]
    fn summary_keys() {
        assert_eq!(
            parse_summary("a.b: type AAAA, class IN, addr ::1").unwrap(),
            ("a.b".to_owned(), "AAAA".to_owned())
        );
        assert!(parse_summary("garbage").is_err());
    }
}
