//! Address strings: dotted paths into nested JSON
//!
//! An address is a `.`-separated list of segments. A plain segment steps into
//! an object by key; on a list it fans out over every element. A mapping
//! segment `{source}>{target}` must meet a list: for each element it binds
//! `element[source]` under `target` in the parameter record and continues into
//! the element.
//!
//! ```rust
//! use restable::address::resolve;
//! use serde_json::json;
//!
//! let data = json!([{"id": 1}, {"id": 2}]);
//! let records = resolve(&data, "{id}>{customerId}").unwrap();
//! assert_eq!(records.len(), 2);
//! assert_eq!(records[1]["customerId"], 2);
//! ```

use crate::error::AddressError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

static MAPPING_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{([^{}]+)\}>\{([^{}]+)\}$").unwrap()
});

/// Target name → value bindings collected while resolving an address
pub type ParameterRecord = Map<String, Value>;

/// One step of an address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Plain field name
    Field(String),
    /// `{source}>{target}`: bind `source` of each list element as `target`
    Mapping { source: String, target: String },
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => f.write_str(name),
            Segment::Mapping { source, target } => write!(f, "{{{}}}>{{{}}}", source, target),
        }
    }
}

/// A parsed address string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
    segments: Vec<Segment>,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        let segments = raw
            .split('.')
            .map(|part| parse_segment(raw, part))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Address {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Name of the top-level field this address starts in, if it starts with a plain segment
    pub fn head(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Field(name)) => Some(name),
            _ => None,
        }
    }

    /// True when no segment is a mapping segment
    pub fn is_plain(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Field(_)))
    }

    /// Resolve this address against `data` into parameter records.
    ///
    /// Every list met along the way fans out into one record per element. An
    /// address that ends on a plain segment binds the value it reaches under
    /// that segment's name, so a purely plain address yields one named-value
    /// record. Empty lists contribute no records.
    pub fn resolve(&self, data: &Value) -> Result<Vec<ParameterRecord>, AddressError> {
        let mut out = Vec::new();
        self.resolve_from(data, 0, ParameterRecord::new(), &mut out)?;
        Ok(out)
    }

    fn resolve_from(
        &self,
        data: &Value,
        start: usize,
        mut record: ParameterRecord,
        out: &mut Vec<ParameterRecord>,
    ) -> Result<(), AddressError> {
        let mut current = data;
        let mut pos = start;

        loop {
            let Some(segment) = self.segments.get(pos) else {
                out.push(record);
                return Ok(());
            };

            match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => {
                    let next = map
                        .get(name)
                        .ok_or_else(|| self.resolution_error(pos, "missing key".to_string()))?;

                    if pos + 1 == self.segments.len() {
                        record.insert(name.clone(), next.clone());
                        out.push(record);
                        return Ok(());
                    }

                    current = next;
                    pos += 1;
                }
                (Segment::Field(_), Value::Array(items)) => {
                    for item in items {
                        self.resolve_from(item, pos, record.clone(), out)?;
                    }
                    return Ok(());
                }
                (Segment::Mapping { source, target }, Value::Array(items)) => {
                    for item in items {
                        let value = item.as_object().and_then(|obj| obj.get(source)).ok_or_else(|| {
                            self.resolution_error(
                                pos,
                                format!("list element has no field {:?}", source),
                            )
                        })?;

                        let mut child = record.clone();
                        child.insert(target.clone(), value.clone());
                        self.resolve_from(item, pos + 1, child, out)?;
                    }
                    return Ok(());
                }
                (Segment::Field(_), other) => {
                    return Err(self.resolution_error(
                        pos,
                        format!("expected an object or list, found {}", value_kind(other)),
                    ));
                }
                (Segment::Mapping { .. }, other) => {
                    return Err(self.resolution_error(
                        pos,
                        format!("expected a list, found {}", value_kind(other)),
                    ));
                }
            }
        }
    }

    /// Remove and return the value this address points at.
    ///
    /// A path that does not exist is a no-op returning `None`, so popping the
    /// same address twice is safe. Lists met along the way fan out; the values
    /// removed from their elements come back as an array.
    pub fn pop(&self, data: &mut Value) -> Option<Value> {
        pop_at(data, &self.segments)
    }

    /// Non-destructive lookup through plain segments
    pub fn get<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(data, |current, segment| match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name),
                _ => None,
            })
    }

    fn resolution_error(&self, pos: usize, reason: String) -> AddressError {
        let consumed = self.segments[..pos]
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");

        AddressError::Resolution {
            segment: self.segments[pos].to_string(),
            consumed,
            reason,
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_segment(raw: &str, part: &str) -> Result<Segment, AddressError> {
    let malformed = || AddressError::MalformedSegment {
        address: raw.to_string(),
        segment: part.to_string(),
    };

    if part.is_empty() {
        return Err(malformed());
    }

    if let Some(caps) = MAPPING_SEGMENT.captures(part) {
        return Ok(Segment::Mapping {
            source: caps[1].to_string(),
            target: caps[2].to_string(),
        });
    }

    if part.contains(['{', '}']) {
        return Err(malformed());
    }

    Ok(Segment::Field(part.to_string()))
}

fn pop_at(data: &mut Value, segments: &[Segment]) -> Option<Value> {
    let (first, rest) = segments.split_first()?;

    match (first, data) {
        (Segment::Field(name), Value::Object(map)) => {
            if rest.is_empty() {
                map.remove(name)
            } else {
                pop_at(map.get_mut(name)?, rest)
            }
        }
        (Segment::Field(_), Value::Array(items)) => collect_popped(items, segments),
        (Segment::Mapping { source, .. }, Value::Array(items)) => {
            if rest.is_empty() {
                let popped: Vec<Value> = items
                    .iter_mut()
                    .filter_map(|item| item.as_object_mut()?.remove(source))
                    .collect();
                (!popped.is_empty()).then(|| Value::Array(popped))
            } else {
                collect_popped(items, rest)
            }
        }
        _ => None,
    }
}

fn collect_popped(items: &mut [Value], segments: &[Segment]) -> Option<Value> {
    let popped: Vec<Value> = items
        .iter_mut()
        .filter_map(|item| pop_at(item, segments))
        .collect();
    (!popped.is_empty()).then(|| Value::Array(popped))
}

/// Resolve an address string against `data`
pub fn resolve(data: &Value, address: &str) -> Result<Vec<ParameterRecord>, AddressError> {
    Address::parse(address)?.resolve(data)
}

/// Remove the value at an address string from `data`.
///
/// Only a malformed address is an error; a missing path yields `Ok(None)`.
pub fn pop(data: &mut Value, address: &str) -> Result<Option<Value>, AddressError> {
    Ok(Address::parse(address)?.pop(data))
}

/// Text of a scalar as it appears in keys and URLs: strings unquoted,
/// everything else as JSON
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let address = Address::parse("{id}>{customerID}.l.{id}>{itemID}").unwrap();
        assert_eq!(
            address.segments(),
            &[
                Segment::Mapping { source: "id".into(), target: "customerID".into() },
                Segment::Field("l".into()),
                Segment::Mapping { source: "id".into(), target: "itemID".into() },
            ]
        );
        assert_eq!(address.to_string(), "{id}>{customerID}.l.{id}>{itemID}");
        assert!(!address.is_plain());
        assert!(Address::parse("content.category").unwrap().is_plain());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(
            Address::parse("a..b"),
            Err(AddressError::MalformedSegment { .. })
        ));
        assert!(matches!(
            Address::parse("{id}>customer"),
            Err(AddressError::MalformedSegment { .. })
        ));
        assert!(matches!(
            Address::parse("{}>{x}"),
            Err(AddressError::MalformedSegment { .. })
        ));
    }

    #[test]
    fn test_single_mapping_segment() {
        let data = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        let records = resolve(&data, "{id}>{customerId}").unwrap();

        assert_eq!(
            records,
            vec![
                json!({"customerId": 1}).as_object().unwrap().clone(),
                json!({"customerId": 2}).as_object().unwrap().clone(),
                json!({"customerId": 3}).as_object().unwrap().clone(),
            ]
        );
    }

    #[test]
    fn test_nested_fan_out() {
        let data = json!([
            {"id": 1, "l": [{"id": "a"}, {"id": "b"}]},
            {"id": 2, "l": []},
            {"id": 3, "l": [{"id": "c"}, {"id": "d"}]}
        ]);

        let records = resolve(&data, "{id}>{customerID}.l.{id}>{itemID}").unwrap();
        let records: Vec<Value> = records.into_iter().map(Value::Object).collect();

        assert_eq!(
            records,
            vec![
                json!({"customerID": 1, "itemID": "a"}),
                json!({"customerID": 1, "itemID": "b"}),
                json!({"customerID": 3, "itemID": "c"}),
                json!({"customerID": 3, "itemID": "d"}),
            ]
        );
    }

    #[test]
    fn test_plain_prefix_before_list() {
        let data = json!({"data": {"customers": [{"id": 7}, {"id": 8}]}});
        let records = resolve(&data, "data.customers.{id}>{customer}").unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["customer"], 7);
        assert_eq!(records[1]["customer"], 8);
    }

    #[test]
    fn test_plain_address_yields_named_value() {
        let data = json!({"meta": {"next_cursor": "abc"}});
        let records = resolve(&data, "meta.next_cursor").unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["next_cursor"], "abc");
    }

    #[test]
    fn test_missing_key_reports_segment_and_prefix() {
        let data = json!({"data": {"items": []}});
        let err = resolve(&data, "data.customers.{id}>{c}").unwrap_err();

        match err {
            AddressError::Resolution { segment, consumed, .. } => {
                assert_eq!(segment, "customers");
                assert_eq!(consumed, "data");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_mapping_segment_requires_list() {
        let data = json!({"id": 1});
        let err = resolve(&data, "{id}>{customer}").unwrap_err();
        assert!(matches!(err, AddressError::Resolution { .. }));

        let data = json!([{"name": "x"}]);
        assert!(resolve(&data, "{id}>{customer}").is_err());
    }

    #[test]
    fn test_pop_is_idempotent() {
        let mut data = json!({"id": 1, "orders": [{"id": 10}]});

        let first = pop(&mut data, "orders").unwrap();
        assert_eq!(first, Some(json!([{"id": 10}])));
        assert_eq!(data, json!({"id": 1}));

        let second = pop(&mut data, "orders").unwrap();
        assert_eq!(second, None);
        assert_eq!(data, json!({"id": 1}));
    }

    #[test]
    fn test_pop_nested_and_through_lists() {
        let mut data = json!({
            "content": {"category": "a", "blob": "xxx"},
            "lines": [{"sku": 1, "notes": "n1"}, {"sku": 2, "notes": "n2"}, {"sku": 3}]
        });

        assert_eq!(pop(&mut data, "content.blob").unwrap(), Some(json!("xxx")));
        assert_eq!(pop(&mut data, "lines.notes").unwrap(), Some(json!(["n1", "n2"])));
        assert_eq!(
            data,
            json!({
                "content": {"category": "a"},
                "lines": [{"sku": 1}, {"sku": 2}, {"sku": 3}]
            })
        );
        assert_eq!(pop(&mut data, "lines.notes").unwrap(), None);
        assert_eq!(pop(&mut data, "missing.path").unwrap(), None);
    }

    #[test]
    fn test_get_dotted() {
        let data = json!({"id": 4, "content": {"category": "books"}});
        let address = Address::parse("content.category").unwrap();

        assert_eq!(address.get(&data), Some(&json!("books")));
        assert_eq!(Address::parse("content.missing").unwrap().get(&data), None);
    }
}
