//! Declarative mapping of normalized trees onto typed records.
//!
//! A [`Contract`] lists the keys a record understands. Keys are matched
//! exactly first, then against the dynamic wildcard templates in declaration
//! order; anything else is skipped.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use crate::error::MapError;
use crate::filter::glob_to_regex;
use crate::model::MacAddr;
use crate::tree::Node;

type Setter<T> = Box<dyn Fn(&mut T, &Node) -> Result<(), MapError> + Send + Sync>;
type Hook<T> = Box<dyn Fn(&mut T, &str, &Node) -> Result<(), MapError> + Send + Sync>;

enum Field<T> {
    /// Single-valued: a repeated key is a schema violation.
    Plain(Setter<T>),
    /// Called once per occurrence.
    Aggregate(Setter<T>),
}

struct Dynamic<T> {
    template: &'static str,
    pattern: Regex,
    hook: Hook<T>,
}

pub struct Contract<T> {
    record: &'static str,
    fields: Vec<(&'static str, Field<T>)>,
    dynamic: Vec<Dynamic<T>>,
}

impl<T: Default> Contract<T> {
    pub fn new(record: &'static str) -> Self {
        Contract {
            record,
            fields: Vec::new(),
            dynamic: Vec::new(),
        }
    }

    pub fn plain<F>(mut self, key: &'static str, setter: F) -> Self
    where
        F: Fn(&mut T, &Node) -> Result<(), MapError> + Send + Sync + 'static,
    {
        self.fields.push((key, Field::Plain(Box::new(setter))));
        self
    }

    pub fn aggregate<F>(mut self, key: &'static str, setter: F) -> Self
    where
        F: Fn(&mut T, &Node) -> Result<(), MapError> + Send + Sync + 'static,
    {
        self.fields.push((key, Field::Aggregate(Box::new(setter))));
        self
    }

    /// Registers a wildcard key template; `*` matches any text. The hook
    /// receives the concrete key with each occurrence.
    pub fn dynamic<F>(mut self, template: &'static str, hook: F) -> Self
    where
        F: Fn(&mut T, &str, &Node) -> Result<(), MapError> + Send + Sync + 'static,
    {
        match glob_to_regex(template) {
            Ok(pattern) => self.dynamic.push(Dynamic {
                template,
                pattern,
                hook: Box::new(hook),
            }),
            Err(e) => warn!(
                event.name = "layers.bad_template",
                record = self.record,
                template,
                error = %e,
                "dynamic key template does not compile, ignoring"
            ),
        }
        self
    }

    pub fn record(&self) -> &'static str {
        self.record
    }

    pub fn templates(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.dynamic.iter().map(|d| d.template)
    }

    /// Maps a normalized object onto a fresh `T`.
    pub fn map(&self, node: &Node) -> Result<T, MapError> {
        let fields = node.as_object().ok_or(MapError::UnexpectedShape {
            field: self.record.to_owned(),
            expected: "object",
        })?;

        let mut out = T::default();
        for (key, value) in fields {
            if let Some((_, field)) = self.fields.iter().find(|(k, _)| k == key) {
                let occurrences = value.occurrences();
                match field {
                    Field::Plain(set) => match occurrences {
                        [] => {}
                        [single] => set(&mut out, single)?,
                        _ => {
                            return Err(MapError::SchemaViolation {
                                record: self.record,
                                field: key.clone(),
                                count: occurrences.len(),
                            })
                        }
                    },
                    Field::Aggregate(set) => {
                        for occurrence in occurrences {
                            set(&mut out, occurrence)?;
                        }
                    }
                }
            } else if let Some(dynamic) = self.dynamic.iter().find(|d| d.pattern.is_match(key)) {
                for occurrence in value.occurrences() {
                    (dynamic.hook)(&mut out, key.as_str(), occurrence)?;
                }
            }
        }
        Ok(out)
    }
}

fn invalid(field: &str, value: &str, expected: &'static str) -> MapError {
    MapError::InvalidValue {
        field: field.to_owned(),
        value: value.to_owned(),
        expected,
    }
}

/// The scalar text of a node.
pub fn text(node: &Node, field: &str) -> Result<String, MapError> {
    node.as_str()
        .map(str::to_owned)
        .ok_or_else(|| MapError::UnexpectedShape {
            field: field.to_owned(),
            expected: "scalar",
        })
}

fn scalar<'a>(node: &'a Node, field: &str) -> Result<&'a str, MapError> {
    node.as_str().ok_or_else(|| MapError::UnexpectedShape {
        field: field.to_owned(),
        expected: "scalar",
    })
}

pub fn decimal<N: FromStr>(node: &Node, field: &str) -> Result<N, MapError> {
    let s = scalar(node, field)?;
    s.trim().parse().map_err(|_| invalid(field, s, "decimal"))
}

pub fn hex(node: &Node, field: &str) -> Result<u64, MapError> {
    let s = scalar(node, field)?;
    let digits = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .ok_or_else(|| invalid(field, s, "hex"))?;
    u64::from_str_radix(digits, 16).map_err(|_| invalid(field, s, "hex"))
}

/// Decimal or `0x` hex, whichever the dissector chose for the field.
pub fn integer<N: TryFrom<u64>>(node: &Node, field: &str) -> Result<N, MapError> {
    let s = scalar(node, field)?;
    let wide = if s.trim().starts_with("0x") || s.trim().starts_with("0X") {
        hex(node, field)?
    } else {
        decimal::<u64>(node, field)?
    };
    N::try_from(wide).map_err(|_| invalid(field, s, "integer in range"))
}

pub fn boolean(node: &Node, field: &str) -> Result<bool, MapError> {
    let s = scalar(node, field)?;
    match s.trim() {
        "1" | "True" | "true" => Ok(true),
        "0" | "False" | "false" => Ok(false),
        _ => Err(invalid(field, s, "boolean")),
    }
}

pub fn ip(node: &Node, field: &str) -> Result<IpAddr, MapError> {
    let s = scalar(node, field)?;
    s.trim().parse().map_err(|_| invalid(field, s, "IP address"))
}

pub fn mac(node: &Node, field: &str) -> Result<MacAddr, MapError> {
    let s = scalar(node, field)?;
    MacAddr::parse(s).ok_or_else(|| invalid(field, s, "MAC address"))
}

/// `1700000000.123456000` → UTC timestamp.
pub fn epoch(node: &Node, field: &str) -> Result<DateTime<Utc>, MapError> {
    let s = scalar(node, field)?;
    let (secs, frac) = s.trim().split_once('.').unwrap_or((s.trim(), ""));
    let secs: i64 = secs.parse().map_err(|_| invalid(field, s, "epoch seconds"))?;
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits
            .parse::<u32>()
            .map_err(|_| invalid(field, s, "epoch seconds"))?
    };
    DateTime::<Utc>::from_timestamp(secs, nanos).ok_or_else(|| invalid(field, s, "epoch seconds"))
}

/// `68:69:6a` → bytes.
pub fn colon_hex(node: &Node, field: &str) -> Result<Vec<u8>, MapError> {
    let s = scalar(node, field)?;
    s.trim()
        .split(':')
        .filter(|b| !b.is_empty())
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| invalid(field, s, "hex bytes")))
        .collect()
}

/// First scalar stored under `key` anywhere below `node`, depth first.
pub fn find_scalar<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    match node {
        Node::Scalar(_) => None,
        Node::Array(items) => items.iter().find_map(|n| find_scalar(n, key)),
        Node::Object(fields) => fields.iter().find_map(|(k, v)| {
            if k == key {
                v.occurrences().first().and_then(Node::as_str)
            } else {
                find_scalar(v, key)
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{normalize, parse_record};

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        id: u32,
        tags: Vec<String>,
        lines: Vec<(String, String)>,
    }

    fn contract() -> Contract<Sample> {
        Contract::new("sample")
            .plain("id", |s: &mut Sample, v| {
                s.id = integer(v, "id")?;
                Ok(())
            })
            .aggregate("tag", |s: &mut Sample, v| {
                s.tags.push(text(v, "tag")?);
                Ok(())
            })
            .dynamic("line *", |s: &mut Sample, key, v| {
                s.lines.push((key.to_owned(), text(v, "line")?));
                Ok(())
            })
    }

    fn tree(json: &str) -> Node {
        normalize(&parse_record(json).unwrap())
    }

    #[test]
    fn maps_plain_aggregate_and_dynamic_fields() {
        let out = contract()
            .map(&tree(r#"{"id":"0x10","tag":"a","tag":"b","line 1":"x","unknown":{"z":1}}"#))
            .unwrap();
        assert_eq!(
            out,
            Sample {
                id: 16,
                tags: vec!["a".into(), "b".into()],
                lines: vec![("line 1".into(), "x".into())],
            }
        );
    }

    #[test]
    fn duplicate_plain_field_is_a_violation() {
        let err = contract().map(&tree(r#"{"id":"1","id":"2"}"#)).unwrap_err();
        assert_eq!(
            err,
            MapError::SchemaViolation {
                record: "sample",
                field: "id".into(),
                count: 2,
            }
        );
    }

    #[test]
    fn exact_keys_win_over_templates() {
        let c = Contract::<Sample>::new("s")
            .dynamic("*", |s: &mut Sample, _, _| {
                s.id = 99;
                Ok(())
            })
            .plain("id", |s: &mut Sample, v| {
                s.id = decimal(v, "id")?;
                Ok(())
            });
        assert_eq!(c.map(&tree(r#"{"id":"5"}"#)).unwrap().id, 5);
        assert_eq!(c.map(&tree(r#"{"other":"5"}"#)).unwrap().id, 99);
        assert_eq!(c.templates().collect::<Vec<_>>(), ["*"]);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(matches!(
            contract().map(&Node::scalar("x")),
            Err(MapError::UnexpectedShape { .. })
        ));
    }

    #[test]
    fn scalar_helpers() {
        let n = |s: &str| Node::scalar(s);
        assert_eq!(integer::<u16>(&n("0x0800"), "f").unwrap(), 0x0800);
        assert_eq!(integer::<u8>(&n("64"), "f").unwrap(), 64);
        assert!(integer::<u8>(&n("300"), "f").is_err());
        assert!(hex(&n("12"), "f").is_err());
        assert!(boolean(&n("True"), "f").unwrap());
        assert!(!boolean(&n("0"), "f").unwrap());
        assert!(boolean(&n("maybe"), "f").is_err());
        assert_eq!(
            epoch(&n("1700000000.123456000"), "f").unwrap(),
            DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_000).unwrap()
        );
        assert_eq!(
            epoch(&n("1700000000.5"), "f").unwrap(),
            DateTime::<Utc>::from_timestamp(1_700_000_000, 500_000_000).unwrap()
        );
        assert_eq!(colon_hex(&n("68:69"), "f").unwrap(), b"hi");
        assert_eq!(ip(&n("10.0.0.1"), "f").unwrap().to_string(), "10.0.0.1");
        assert!(matches!(
            decimal::<u32>(&n("abc"), "f"),
            Err(MapError::InvalidValue { expected: "decimal", .. })
        ));
        let nested = tree(r#"{"a":{"b":[{"c":"x"}]},"c":"y"}"#);
        assert_eq!(find_scalar(&nested, "c"), Some("x"));
    }
}
