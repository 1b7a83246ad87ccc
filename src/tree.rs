//! Duplicate-key aware JSON trees.
//!
//! tshark's JSON output repeats object keys (one `"tcp.option_kind"` per
//! option, one `"tls.record"` per record, ...) instead of emitting arrays.
//! A standard JSON map keeps only the last value, so records are parsed into
//! an order-preserving [`Node`] tree first and repeated keys are folded into
//! arrays by [`normalize`]. Values are walked as raw JSON text, so a number
//! keeps its spelling (`1.0` stays `1.0`).

use std::collections::HashMap;
use std::fmt;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::value::RawValue;

use crate::error::TreeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Scalar(String),
    Array(Vec<Node>),
    /// Keys in document order; may repeat until normalized.
    Object(Vec<(String, Node)>),
}

impl Node {
    pub fn scalar(value: impl Into<String>) -> Node {
        Node::Scalar(value.into())
    }

    pub fn array(items: Vec<Node>) -> Node {
        Node::Array(items)
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Node)>) -> Node {
        Node::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Node)]> {
        match self {
            Node::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// First value stored under `key` in an object.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// On a normalized tree an array stands for repeated occurrences; any
    /// other node is a single occurrence.
    pub fn occurrences(&self) -> &[Node] {
        match self {
            Node::Array(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Scalar(_) => "scalar",
            Node::Array(_) => "array",
            Node::Object(_) => "object",
        }
    }
}

/// Object entries in document order, values still unparsed.
struct Entries<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for Entries<'de> {
    fn deserialize<D>(deserializer: D) -> Result<Entries<'de>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(EntriesVisitor)
    }
}

struct EntriesVisitor;

impl<'de> Visitor<'de> for EntriesVisitor {
    type Value = Entries<'de>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Entries<'de>, A::Error>
    where
        A: MapAccess<'de>,
    {
        // serde_json hands out every entry, repeated keys included
        let mut fields = Vec::new();
        while let Some(entry) = map.next_entry::<String, &'de RawValue>()? {
            fields.push(entry);
        }
        Ok(Entries(fields))
    }
}

fn from_raw(raw: &RawValue) -> Result<Node, serde_json::Error> {
    let text = raw.get();
    match text.as_bytes().first() {
        Some(b'{') => {
            let Entries(fields) = serde_json::from_str(text)?;
            let fields = fields
                .into_iter()
                .map(|(key, value)| Ok((key, from_raw(value)?)))
                .collect::<Result<Vec<_>, serde_json::Error>>()?;
            Ok(Node::Object(fields))
        }
        Some(b'[') => {
            let items: Vec<&RawValue> = serde_json::from_str(text)?;
            let items = items.into_iter().map(from_raw).collect::<Result<Vec<_>, _>>()?;
            Ok(Node::array(items))
        }
        Some(b'"') => serde_json::from_str::<String>(text).map(Node::Scalar),
        _ if text == "null" => Ok(Node::scalar("")),
        // numbers and booleans, as written
        _ => Ok(Node::scalar(text)),
    }
}

/// Splits a stream of JSON objects (optionally wrapped in one array) into
/// one slice per top-level object.
pub fn split_records(text: &str) -> Result<Vec<&str>, TreeError> {
    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut outer_open = false;

    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' if depth > 0 => depth += 1,
            b'{' => {
                depth = 1;
                start = i;
            }
            b'[' => {
                if outer_open {
                    return Err(TreeError::Unbalanced {
                        reason: "array outside a record",
                    });
                }
                outer_open = true;
            }
            b'}' | b']' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    records.push(&text[start..=i]);
                }
            }
            b']' if outer_open => outer_open = false,
            b'}' | b']' => {
                return Err(TreeError::Unbalanced {
                    reason: "closing bracket without an opening one",
                })
            }
            _ => {}
        }
    }

    if depth > 0 || in_string {
        return Err(TreeError::Unbalanced {
            reason: "unterminated record",
        });
    }
    Ok(records)
}

/// Parses one object, keeping repeated keys in order and number literals
/// exactly as written.
pub fn parse_record(text: &str) -> Result<Node, TreeError> {
    let raw: &RawValue = serde_json::from_str(text)?;
    Ok(from_raw(raw)?)
}

/// Folds repeated object keys into arrays, recursively. Returns a new tree.
pub fn normalize(node: &Node) -> Node {
    match node {
        Node::Scalar(s) => Node::scalar(s.as_str()),
        Node::Array(items) => Node::array(items.iter().map(normalize).collect()),
        Node::Object(fields) => {
            let mut out: Vec<(String, Node)> = Vec::with_capacity(fields.len());
            let mut slots: HashMap<&str, usize> = HashMap::with_capacity(fields.len());
            for (key, value) in fields {
                let value = normalize(value);
                match slots.get(key.as_str()) {
                    Some(&slot) => merge(&mut out[slot].1, value),
                    None => {
                        slots.insert(key, out.len());
                        out.push((key.clone(), value));
                    }
                }
            }
            Node::Object(out)
        }
    }
}

fn merge(existing: &mut Node, value: Node) {
    if !matches!(existing, Node::Array(_)) {
        let old = std::mem::replace(existing, Node::array(Vec::new()));
        *existing = Node::array(vec![old]);
    }
    if let Node::Array(items) = existing {
        match value {
            Node::Array(more) => items.extend(more),
            single => items.push(single),
        }
    }
}

/// Splits, parses and normalizes a whole dissector document.
pub fn build(text: &str) -> Result<Vec<Node>, TreeError> {
    split_records(text)?
        .into_iter()
        .map(|record| parse_record(record).map(|raw| normalize(&raw)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Node {
        Node::scalar(v)
    }

    #[test]
    fn repeated_keys_become_arrays() {
        let tree = normalize(&parse_record(r#"{"Foo":1,"Foo":2}"#).unwrap());
        assert_eq!(tree, Node::object([("Foo", Node::array(vec![s("1"), s("2")]))]));
    }

    #[test]
    fn repeated_array_values_are_flattened() {
        let tree = normalize(&parse_record(r#"{"Foo":1,"Foo":[2],"Foo":[3,4]}"#).unwrap());
        assert_eq!(
            tree.get("Foo").unwrap(),
            &Node::array(vec![s("1"), s("2"), s("3"), s("4")])
        );
    }

    #[test]
    fn nested_duplicates_merge_independently() {
        let raw = parse_record(r#"{"a":{"x":1,"x":2},"a":{"y":3,"y":{"z":4}},"b":true}"#).unwrap();
        let tree = normalize(&raw);
        assert_eq!(
            tree,
            Node::object([
                (
                    "a",
                    Node::array(vec![
                        Node::object([("x", Node::array(vec![s("1"), s("2")]))]),
                        Node::object([(
                            "y",
                            Node::array(vec![s("3"), Node::object([("z", s("4"))])])
                        )]),
                    ])
                ),
                ("b", s("true")),
            ])
        );
        // the raw tree is untouched
        assert_eq!(raw.as_object().unwrap().len(), 3);
    }

    #[test]
    fn scalars_keep_their_text() {
        let tree = parse_record(r#"{"n":null,"i":-3,"f":1.5,"t":"0x0010","e":"é"}"#).unwrap();
        assert_eq!(tree.get("n"), Some(&s("")));
        assert_eq!(tree.get("i"), Some(&s("-3")));
        assert_eq!(tree.get("f"), Some(&s("1.5")));
        assert_eq!(tree.get("t"), Some(&s("0x0010")));
        assert_eq!(tree.get("e"), Some(&s("é")));
    }

    #[test]
    fn number_literals_are_not_reformatted() {
        let tree = parse_record(r#"{"a": 1.0, "b": 1e3, "c": -0.50, "d": false, "l": [2.00, {"x": 0.10}]}"#)
            .unwrap();
        assert_eq!(tree.get("a"), Some(&s("1.0")));
        assert_eq!(tree.get("b"), Some(&s("1e3")));
        assert_eq!(tree.get("c"), Some(&s("-0.50")));
        assert_eq!(tree.get("d"), Some(&s("false")));
        assert_eq!(
            tree.get("l"),
            Some(&Node::array(vec![s("2.00"), Node::object([("x", s("0.10"))])]))
        );
    }

    #[test]
    fn escaped_strings_and_keys_are_decoded() {
        let tree = parse_record(r#"{"k\u0041": "line\r\n", "q": "\"x\""}"#).unwrap();
        assert_eq!(tree.get("kA"), Some(&s("line\r\n")));
        assert_eq!(tree.get("q"), Some(&s("\"x\"")));
    }

    #[test]
    fn splits_records_ignoring_braces_in_strings() {
        let text = "[\n  {\"a\": \"}{\"},\n  {\"b\": {\"c\": \"\\\"{[\"}, \"d\": [1, {\"e\": 2}]}\n]\n";
        let records = split_records(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], r#"{"a": "}{"}"#);
        assert!(records[1].starts_with(r#"{"b""#));
        assert!(records[1].ends_with("]}"));
        for record in records {
            parse_record(record).unwrap();
        }
    }

    #[test]
    fn splits_back_to_back_objects() {
        let records = split_records(r#"{"a":1}{"b":2} {"c":3}"#).unwrap();
        assert_eq!(records, [r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]);
        assert!(split_records("").unwrap().is_empty());
        assert!(split_records("[]").unwrap().is_empty());
    }

    #[test]
    fn rejects_unbalanced_input() {
        assert!(matches!(split_records(r#"[{"a":1"#), Err(TreeError::Unbalanced { .. })));
        assert!(matches!(split_records(r#"{"a":"open}"#), Err(TreeError::Unbalanced { .. })));
        assert!(matches!(split_records("}"), Err(TreeError::Unbalanced { .. })));
        assert!(matches!(parse_record(r#"{"a":}"#), Err(TreeError::Json(_))));
    }

    #[test]
    fn build_normalizes_every_record() {
        let nodes = build(r#"[{"k":1,"k":2},{"k":3}]"#).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].get("k").unwrap().occurrences().len(), 2);
        assert_eq!(nodes[1].get("k").unwrap().occurrences(), [s("3")]);
    }
}
