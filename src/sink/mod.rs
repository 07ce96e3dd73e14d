//! Relational sinks: where flushed table batches go

mod jsonl;
mod sqlite;

pub use jsonl::JsonLinesSink;
pub use sqlite::SqliteSink;

use crate::cache::{CacheNode, ColumnBuffer};
use crate::error::SinkError;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// A table's buffered rows, borrowed from its cache node for one write
#[derive(Debug, Clone, Copy)]
pub struct TableBatch<'a> {
    pub table: &'a str,
    pub meta_table: &'a str,
    /// Synthetic key column; sinks that merge rows treat it as the row identity
    pub key_column: &'a str,
    /// Key column first, then declared columns, then metadata columns
    pub columns: &'a IndexMap<String, ColumnBuffer>,
}

impl<'a> TableBatch<'a> {
    pub(crate) fn from_node(node: &'a CacheNode) -> Self {
        TableBatch {
            table: node.target_table(),
            meta_table: node.meta_table(),
            key_column: node.key_column(),
            columns: node.buffers(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.columns.get(self.key_column).map_or(0, ColumnBuffer::len)
    }

    /// Row `index` as a JSON object, columns in batch order
    pub fn row(&self, index: usize) -> Map<String, Value> {
        self.columns
            .iter()
            .map(|(name, buffer)| {
                let value = buffer.cell(index).map_or(Value::Null, |cell| cell.to_json());
                (name.clone(), value)
            })
            .collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        (0..self.row_count()).map(move |index| self.row(index))
    }
}

/// Destination for flushed batches.
///
/// A successful write must have persisted every row of the batch; the cache
/// clears the node's buffers as soon as `write_rows` returns `Ok`.
pub trait RelationalSink {
    /// Write one table's batch, returning the number of rows written
    fn write_rows(&mut self, batch: &TableBatch<'_>) -> Result<usize, SinkError>;
}

/// Keeps every written row in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: HashMap<String, Vec<Map<String, Value>>>,
    write_order: Vec<String>,
    failing: HashSet<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write to `table` until [`heal_table`](Self::heal_table)
    pub fn fail_table(&mut self, table: impl Into<String>) {
        self.failing.insert(table.into());
    }

    pub fn heal_table(&mut self, table: &str) {
        self.failing.remove(table);
    }

    pub fn rows(&self, table: &str) -> &[Map<String, Value>] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Table names in the order they were written, one entry per batch
    pub fn write_order(&self) -> &[String] {
        &self.write_order
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl RelationalSink for MemorySink {
    fn write_rows(&mut self, batch: &TableBatch<'_>) -> Result<usize, SinkError> {
        if self.failing.contains(batch.table) {
            return Err(SinkError::Rejected {
                table: batch.table.to_string(),
                message: "table marked as failing".to_string(),
            });
        }

        let rows = self.tables.entry(batch.table.to_string()).or_default();
        let before = rows.len();
        rows.extend(batch.rows());
        self.write_order.push(batch.table.to_string());

        Ok(rows.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RowMetadata, TableCache};
    use crate::settings::{LogicalType, TableSettings, DELETED_FLAG};
    use serde_json::json;

    #[test]
    fn test_batch_rows_as_json() {
        let settings = TableSettings::new("people", ["id"]).with_column("age", LogicalType::Number);
        let mut cache = TableCache::build(&settings).unwrap();
        cache
            .ingest_with(json!({"id": "p1", "age": 41}), &RowMetadata::now())
            .unwrap();

        let batch = TableBatch::from_node(cache.root());
        assert_eq!(batch.row_count(), 1);
        assert_eq!(batch.meta_table, "META_people");

        let row = batch.row(0);
        assert_eq!(row["id"], json!("p1"));
        assert_eq!(row["age"], json!(41));
        assert_eq!(row[DELETED_FLAG], json!(false));
        assert_eq!(row.keys().next().map(String::as_str), Some("id"));
    }

    #[test]
    fn test_integers_above_f64_precision_reach_the_sink() {
        let settings = TableSettings::new("r", ["k"])
            .with_column("big", LogicalType::Number)
            .with_column("id", LogicalType::Integer);
        let mut cache = TableCache::build(&settings).unwrap();
        let mut sink = MemorySink::new();

        cache
            .ingest(json!({"k": 1, "big": 9007199254740993i64, "id": 9007199254740995i64}))
            .unwrap();
        cache.flush(&mut sink).unwrap();

        let row = &sink.rows("r")[0];
        assert_eq!(row["big"], json!(9007199254740993i64));
        assert_eq!(row["id"], json!(9007199254740995i64));
    }

    #[test]
    fn test_memory_sink_failing_table() {
        let settings = TableSettings::new("people", ["id"]);
        let mut cache = TableCache::build(&settings).unwrap();
        cache.ingest(json!({"id": 1})).unwrap();

        let mut sink = MemorySink::new();
        sink.fail_table("people");
        let batch = TableBatch::from_node(cache.root());
        assert!(matches!(sink.write_rows(&batch), Err(SinkError::Rejected { .. })));
        assert!(sink.rows("people").is_empty());

        sink.heal_table("people");
        assert_eq!(sink.write_rows(&batch).unwrap(), 1);
        assert_eq!(sink.rows("people")[0]["id"], json!("1"));
    }
}
