//! Settings inference from sample payloads
//!
//! Statistics are accumulated field by field over every sample, then turned
//! into a [`TableSettings`] tree once at the end. Arrays nested in a sample
//! become sub-tables; everything else becomes a typed column.

use super::{is_meta_column, LogicalType, TableSettings};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

static ISO_DATETIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$").unwrap()
});

static ISO_DATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// Key field preferred whenever every sample carries it
const PREFERRED_KEY: &str = "id";

/// Field names that would not survive as a sub-table address
fn is_addressable(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '{', '}'])
}

fn looks_like_datetime(s: &str) -> bool {
    let len = s.len();
    (len == 10 && is_date(s)) || (len >= 19 && ISO_DATETIME_REGEX.is_match(s))
}

fn is_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes[4] == b'-' && bytes[7] == b'-' && ISO_DATE_REGEX.is_match(s)
}

/// Counts of what one field held across samples
#[derive(Debug, Default)]
struct FieldStats {
    booleans: usize,
    numbers: usize,
    /// Numbers that fit in an `i64`
    integers: usize,
    strings: usize,
    datetimes: usize,
    objects: usize,
    arrays: usize,
    /// Object elements of arrays, accumulated as rows of a sub-table
    element_rows: Option<Box<TableBuilder>>,
    /// Scalar elements of arrays
    element_values: Option<Box<FieldStats>>,
}

impl FieldStats {
    fn add_value(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(_) => self.booleans += 1,
            Value::Number(n) => {
                self.numbers += 1;
                if n.is_i64() {
                    self.integers += 1;
                }
            }
            Value::String(s) => {
                self.strings += 1;
                if looks_like_datetime(s) {
                    self.datetimes += 1;
                }
            }
            Value::Object(_) => self.objects += 1,
            Value::Array(items) => {
                self.arrays += 1;
                self.add_elements(items);
            }
        }
    }

    fn add_elements(&mut self, items: &[Value]) {
        for item in items {
            match item {
                Value::Object(obj) => self
                    .element_rows
                    .get_or_insert_with(Default::default)
                    .add_object(obj),
                Value::Array(nested) => self.add_elements(nested),
                Value::Null => {}
                scalar => self
                    .element_values
                    .get_or_insert_with(Default::default)
                    .add_value(scalar),
            }
        }
    }

    /// Present with a scalar value (not null, not nested)
    fn scalar_count(&self) -> usize {
        self.booleans + self.numbers + self.strings
    }

    /// Arrays win when they are at least as common as every other shape
    fn is_list(&self) -> bool {
        self.arrays > 0 && self.arrays >= self.scalar_count() + self.objects
    }

    fn logical_type(&self) -> LogicalType {
        if self.objects > 0 || self.arrays > 0 {
            return LogicalType::String;
        }

        match (self.booleans, self.numbers, self.strings) {
            (b, 0, 0) if b > 0 => LogicalType::Boolean,
            (0, n, 0) if n > 0 && self.integers == n => LogicalType::Integer,
            (0, n, 0) if n > 0 => LogicalType::Number,
            (0, 0, s) if s > 0 && self.datetimes == s => LogicalType::Datetime,
            _ => LogicalType::String,
        }
    }

    fn into_sub_table(self, target_table: &str) -> TableSettings {
        let object_rows = self.element_rows.as_ref().map_or(0, |rows| rows.rows);
        let scalar_values = self.element_values.as_ref().map_or(0, |v| v.scalar_count());

        match (self.element_rows, self.element_values) {
            (Some(rows), _) if object_rows >= scalar_values => {
                let key = rows.guess_key();
                rows.build(target_table, vec![key])
            }
            (_, Some(values)) => TableSettings::new(target_table, ["_idx"])
                .with_column("value", values.logical_type())
                .with_column("_idx", LogicalType::Integer),
            // Only ever empty lists: keep the shape, nothing to type
            _ => TableSettings::new(target_table, ["_idx"])
                .with_column("value", LogicalType::String)
                .with_column("_idx", LogicalType::Integer),
        }
    }
}

/// Accumulates the fields of every row seen for one table
#[derive(Debug, Default)]
struct TableBuilder {
    fields: IndexMap<String, FieldStats>,
    /// Rows in which each field held a scalar
    scalar_rows: IndexMap<String, usize>,
    rows: usize,
}

impl TableBuilder {
    fn add_object(&mut self, obj: &Map<String, Value>) {
        self.rows += 1;

        for (key, value) in obj {
            self.fields.entry(key.clone()).or_default().add_value(value);

            if matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_)) {
                *self.scalar_rows.entry(key.clone()).or_insert(0) += 1;
            }
        }
    }

    fn add_sample(&mut self, sample: &Value) {
        match sample {
            Value::Object(obj) => self.add_object(obj),
            Value::Array(items) => items.iter().for_each(|item| self.add_sample(item)),
            _ => {}
        }
    }

    /// `id` when every row has it, else the first field every row has
    fn guess_key(&self) -> String {
        let always_present = |name: &str| {
            self.scalar_rows.get(name).copied() == Some(self.rows) && !is_meta_column(name)
        };

        if always_present(PREFERRED_KEY) {
            return PREFERRED_KEY.to_string();
        }

        self.fields
            .keys()
            .find(|name| always_present(name))
            .or_else(|| self.fields.keys().next())
            .cloned()
            .unwrap_or_else(|| PREFERRED_KEY.to_string())
    }

    fn build(self, target_table: &str, composite_key: Vec<String>) -> TableSettings {
        let mut settings = TableSettings::new(target_table, composite_key);

        for (name, stats) in self.fields {
            if is_meta_column(&name) {
                debug!(table = target_table, field = %name, "skipping reserved field name");
                continue;
            }

            if stats.is_list() && is_addressable(&name) {
                let child_table = format!("{}_{}", target_table, name);
                settings = settings.with_sub_table(name, stats.into_sub_table(&child_table));
                continue;
            }

            settings = settings.with_column(name, stats.logical_type());
        }

        settings
    }
}

/// Propose settings for `target_table` from sample payloads.
///
/// Array samples count each element as a row. An empty `composite_key` picks
/// one from the samples: `id` if every row has it, else the first field every
/// row has.
pub fn infer_settings<I, S>(samples: &[Value], target_table: &str, composite_key: I) -> TableSettings
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut builder = TableBuilder::default();
    for sample in samples {
        builder.add_sample(sample);
    }

    let mut composite_key: Vec<String> = composite_key.into_iter().map(Into::into).collect();
    if composite_key.is_empty() {
        composite_key.push(builder.guess_key());
    }

    debug!(
        table = target_table,
        rows = builder.rows,
        fields = builder.fields.len(),
        "inferring table settings"
    );
    builder.build(target_table, composite_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableCache;
    use serde_json::json;

    #[test]
    fn test_infers_scalar_types() {
        let samples = vec![
            json!({"id": 1, "name": "Alice", "active": true, "joined": "2024-01-01T10:00:00Z", "born": "1990-05-01"}),
            json!({"id": 2, "name": null, "active": false, "joined": "2024-02-01 11:30:00", "born": "1985-12-24"}),
        ];

        let settings = infer_settings(&samples, "users", ["id"]);

        assert_eq!(settings.composite_key, vec!["id"]);
        assert_eq!(settings.columns["id"], LogicalType::Integer);
        assert_eq!(settings.columns["name"], LogicalType::String);
        assert_eq!(settings.columns["active"], LogicalType::Boolean);
        assert_eq!(settings.columns["joined"], LogicalType::Datetime);
        assert_eq!(settings.columns["born"], LogicalType::Datetime);
    }

    #[test]
    fn test_mixed_values_fall_back_to_string() {
        let samples = vec![json!({"id": 1, "v": 1}), json!({"id": 2, "v": "one"}), json!({"id": 3, "v": {"x": 1}})];

        let settings = infer_settings(&samples, "t", ["id"]);
        assert_eq!(settings.columns["v"], LogicalType::String);

        let dates = vec![json!({"id": 1, "d": "2024-01-01"}), json!({"id": 2, "d": "soon"})];
        assert_eq!(infer_settings(&dates, "t", ["id"]).columns["d"], LogicalType::String);
    }

    #[test]
    fn test_nested_arrays_become_sub_tables() {
        let samples = vec![json!([
            {
                "id": 1,
                "tags": ["a", "b"],
                "orders": [
                    {"order_id": 10, "total": 9.5, "lines": [{"sku": "x", "qty": 1}]},
                    {"order_id": 11, "total": 3.0, "lines": []}
                ]
            },
            {"id": 2, "tags": [], "orders": []}
        ])];

        let settings = infer_settings(&samples, "customers", Vec::<String>::new());

        assert_eq!(settings.composite_key, vec!["id"]);
        assert!(!settings.columns.contains_key("orders"));

        let orders = &settings.sub_tables["orders"];
        assert_eq!(orders.target_table, "customers_orders");
        assert_eq!(orders.composite_key, vec!["order_id"]);
        assert_eq!(orders.columns["order_id"], LogicalType::Integer);
        assert_eq!(orders.columns["total"], LogicalType::Number);

        let lines = &orders.sub_tables["lines"];
        assert_eq!(lines.target_table, "customers_orders_lines");
        assert_eq!(lines.composite_key, vec!["sku"]);

        let tags = &settings.sub_tables["tags"];
        assert_eq!(tags.composite_key, vec!["_idx"]);
        assert_eq!(tags.columns["value"], LogicalType::String);
    }

    #[test]
    fn test_inferred_settings_build_and_ingest() {
        let sample = json!({
            "id": 7,
            "when": "2024-03-01T00:00:00Z",
            "items": [{"id": "i1", "n": 2}, {"id": "i2", "n": 3}]
        });

        let settings = infer_settings(std::slice::from_ref(&sample), "events", ["id"]);
        let mut cache = TableCache::build(&settings).unwrap();
        cache.ingest(sample).unwrap();

        assert_eq!(cache.root().row_count(), 1);
        assert_eq!(cache.node("items").unwrap().row_count(), 2);
        assert_eq!(cache.node("items").unwrap().key_column(), "id:id");
    }

    #[test]
    fn test_reserved_and_unaddressable_fields() {
        let samples = vec![json!({"id": 1, "_DT_CREATED": "x", "a.b": [1, 2]})];
        let settings = infer_settings(&samples, "t", ["id"]);

        assert!(!settings.columns.contains_key("_DT_CREATED"));
        assert_eq!(settings.columns["a.b"], LogicalType::String);
        assert!(settings.sub_tables.is_empty());
    }
}
