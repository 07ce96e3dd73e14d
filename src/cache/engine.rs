//! The table cache: ingest payloads into node buffers, flush them to a sink

use crate::address::{value_kind, value_text};
use crate::cache::buffer::Cell;
use crate::cache::node::{build_tree, CacheNode, NodeId};
use crate::error::{ConfigError, Error, Result, SinkError};
use crate::settings::{TableSettings, UnknownFieldPolicy, COMPOSITE_JOIN};
use crate::sink::{RelationalSink, TableBatch};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Values for the metadata columns of rows ingested together
#[derive(Debug, Clone, PartialEq)]
pub struct RowMetadata {
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub created: DateTime<Utc>,
    /// Overrides the source table name, which defaults to each node's target table
    pub source_table: Option<String>,
}

impl RowMetadata {
    pub fn now() -> Self {
        let now = Utc::now();
        RowMetadata {
            is_deleted: false,
            deleted_at: None,
            last_updated: now,
            created: now,
            source_table: None,
        }
    }

    pub fn with_source_table(mut self, source_table: impl Into<String>) -> Self {
        self.source_table = Some(source_table.into());
        self
    }

    pub fn deleted_at(mut self, at: DateTime<Utc>) -> Self {
        self.is_deleted = true;
        self.deleted_at = Some(at);
        self
    }

    fn cells(&self, node: &CacheNode) -> [Cell; 5] {
        [
            Cell::Boolean(self.is_deleted),
            self.deleted_at.map_or(Cell::Null, Cell::Datetime),
            Cell::Datetime(self.last_updated),
            Cell::Datetime(self.created),
            Cell::String(
                self.source_table
                    .clone()
                    .unwrap_or_else(|| node.target_table.clone()),
            ),
        ]
    }
}

impl Default for RowMetadata {
    fn default() -> Self {
        Self::now()
    }
}

/// When the orchestration loop should flush. `None` disables a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPolicy {
    /// Total buffered rows across all tables
    pub max_rows: Option<usize>,
    /// Top-level payload items ingested since the last flush
    pub max_payloads: Option<usize>,
}

/// Outcome of [`TableCache::ingest_all`]
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub ingested: usize,
    /// Index of each skipped item in the response, with the reason
    pub skipped: Vec<(usize, Error)>,
}

/// Outcome of a flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub tables_written: usize,
    pub rows_written: usize,
    /// Tables left buffered because an ancestor's write failed
    pub tables_deferred: usize,
}

/// Some tables failed to flush; their rows are still buffered
#[derive(Debug, thiserror::Error)]
#[error("{} table write(s) failed during flush", .failures.len())]
pub struct FlushError {
    pub summary: FlushSummary,
    pub failures: Vec<SinkError>,
}

/// One engine per endpoint: the cache node tree built from its table settings
#[derive(Debug)]
pub struct TableCache {
    nodes: Vec<CacheNode>,
    registry: IndexMap<String, NodeId>,
    policy: BufferPolicy,
    payloads: usize,
}

impl TableCache {
    /// Build the node tree, validating the whole settings tree up front
    pub fn build(settings: &TableSettings) -> Result<Self, ConfigError> {
        let tree = build_tree(settings)?;
        debug!(
            table = %settings.target_table,
            nodes = tree.nodes.len(),
            "built table cache"
        );

        Ok(TableCache {
            nodes: tree.nodes,
            registry: tree.registry,
            policy: BufferPolicy::default(),
            payloads: 0,
        })
    }

    pub fn with_policy(mut self, policy: BufferPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &CacheNode {
        &self.nodes[0]
    }

    /// Look a node up by its path (`""`, `"orders"`, `"orders/lines"`, ...)
    pub fn node(&self, path: &str) -> Option<&CacheNode> {
        self.registry.get(path).map(|&id| &self.nodes[id])
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&CacheNode> {
        self.nodes.get(id)
    }

    /// Nodes in pre-order, parents before children
    pub fn nodes(&self) -> impl Iterator<Item = &CacheNode> {
        self.nodes.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    pub fn buffered_rows(&self) -> usize {
        self.nodes.iter().map(CacheNode::row_count).sum()
    }

    pub fn buffered_payloads(&self) -> usize {
        self.payloads
    }

    pub fn should_flush(&self) -> bool {
        self.policy.max_rows.is_some_and(|max| self.buffered_rows() >= max)
            || self.policy.max_payloads.is_some_and(|max| self.payloads >= max)
    }

    /// Ingest one top-level payload item with fresh metadata
    pub fn ingest(&mut self, payload: Value) -> Result<()> {
        self.ingest_with(payload, &RowMetadata::now())
    }

    /// Ingest one top-level payload item.
    ///
    /// All-or-nothing: if any row of the item, in any table, fails, every row
    /// the item added is removed again before the error is returned.
    pub fn ingest_with(&mut self, payload: Value, metadata: &RowMetadata) -> Result<()> {
        let snapshot: Vec<usize> = self.nodes.iter().map(CacheNode::row_count).collect();

        match self.ingest_node(0, payload, None, metadata) {
            Ok(()) => {
                self.payloads += 1;
                Ok(())
            }
            Err(err) => {
                for (node, len) in self.nodes.iter_mut().zip(snapshot) {
                    node.truncate(len);
                }
                Err(err)
            }
        }
    }

    /// Ingest a whole response: each element of an array is a top-level item,
    /// any other value is a single item. Failed items are logged and skipped.
    pub fn ingest_all(&mut self, response: Value, metadata: &RowMetadata) -> IngestSummary {
        let items = match response {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut summary = IngestSummary::default();
        for (index, item) in items.into_iter().enumerate() {
            match self.ingest_with(item, metadata) {
                Ok(()) => summary.ingested += 1,
                Err(err) => {
                    warn!(
                        table = %self.root().target_table,
                        index,
                        error = %err,
                        "skipping payload item"
                    );
                    summary.skipped.push((index, err));
                }
            }
        }
        summary
    }

    fn ingest_node(
        &mut self,
        id: NodeId,
        mut data: Value,
        parent_key: Option<&str>,
        metadata: &RowMetadata,
    ) -> Result<()> {
        if !data.is_object() {
            return Err(Error::NotAnObject {
                table: self.nodes[id].target_table.clone(),
                found: value_kind(&data),
            });
        }

        let key = self.derive_key(id, &data, parent_key)?;

        for index in 0..self.nodes[id].children.len() {
            let (address, child) = &self.nodes[id].children[index];
            let child = *child;
            let Some(popped) = address.pop(&mut data) else {
                continue;
            };

            let mut instances = Vec::new();
            flatten_instances(popped, &mut instances);
            for (position, instance) in instances.into_iter().enumerate() {
                let instance = match instance {
                    Value::Object(_) => instance,
                    scalar => {
                        let mut wrapped = Map::new();
                        wrapped.insert("value".to_string(), scalar);
                        wrapped.insert("_idx".to_string(), Value::from(position));
                        Value::Object(wrapped)
                    }
                };
                self.ingest_node(child, instance, Some(&key), metadata)?;
            }
        }

        let node = &self.nodes[id];
        for address in &node.ignore {
            address.pop(&mut data);
        }

        let Value::Object(mut fields) = data else {
            unreachable!("checked above that the payload is an object");
        };
        fields.remove(&node.key_column);

        let mut cells = Vec::with_capacity(node.buffers.len());
        cells.push(Cell::String(key));

        for column in &node.columns {
            let value = fields.remove(&column.name).unwrap_or(Value::Null);
            let cell = Cell::convert(column.logical_type, value, column.datetime_format.as_deref())
                .map_err(|value| Error::ValueConversion {
                    table: node.target_table.clone(),
                    column: column.name.clone(),
                    expected: column.logical_type.name(),
                    value,
                })?;
            cells.push(cell);
        }

        let unknown: Vec<&String> = fields
            .iter()
            .filter(|(name, leftover)| !node.consumes(name, leftover))
            .map(|(name, _)| name)
            .collect();

        if let Some(field) = unknown.first() {
            match node.unknown_fields {
                UnknownFieldPolicy::Reject => {
                    return Err(Error::UnknownField {
                        table: node.target_table.clone(),
                        field: field.to_string(),
                    });
                }
                UnknownFieldPolicy::Ignore => {
                    debug!(table = %node.target_table, fields = ?unknown, "dropping undeclared fields");
                }
            }
        }

        cells.extend(metadata.cells(node));
        self.nodes[id].append(cells);
        Ok(())
    }

    /// The payload's own key column wins; otherwise the parent key followed by
    /// this table's composite key values, joined with `:`.
    fn derive_key(&self, id: NodeId, data: &Value, parent_key: Option<&str>) -> Result<String> {
        let node = &self.nodes[id];

        if let Some(existing) = data.get(&node.key_column).filter(|v| !v.is_null()) {
            return Ok(value_text(existing));
        }

        let mut parts: Vec<String> = Vec::with_capacity(node.local_key.len() + 1);
        parts.extend(parent_key.map(str::to_string));

        for field in &node.local_key {
            let value = field
                .get(data)
                .filter(|v| !v.is_null())
                .ok_or_else(|| Error::KeyDerivation {
                    table: node.target_table.clone(),
                    field: field.to_string(),
                })?;
            parts.push(value_text(value));
        }

        Ok(parts.join(COMPOSITE_JOIN))
    }

    /// Write every non-empty node to `sink` in pre-order, clearing each node
    /// whose write succeeds.
    ///
    /// A failed node keeps its rows for a retry, and its descendants are not
    /// written in this pass so children never reach the sink ahead of their
    /// parent rows.
    pub fn flush(&mut self, sink: &mut dyn RelationalSink) -> Result<FlushSummary, FlushError> {
        let mut summary = FlushSummary::default();
        let mut failures = Vec::new();
        let mut held_back = vec![false; self.nodes.len()];

        for id in 0..self.nodes.len() {
            if let Some(parent) = self.nodes[id].parent {
                if held_back[parent] {
                    held_back[id] = true;
                    if !self.nodes[id].is_empty() {
                        summary.tables_deferred += 1;
                    }
                    continue;
                }
            }

            let node = &mut self.nodes[id];
            if node.is_empty() {
                continue;
            }

            let rows = node.row_count();
            let result = {
                let batch = TableBatch::from_node(node);
                sink.write_rows(&batch)
            };

            match result {
                Ok(_) => {
                    debug!(table = %node.target_table, rows, "flushed table");
                    node.clear();
                    summary.tables_written += 1;
                    summary.rows_written += rows;
                }
                Err(err) => {
                    warn!(table = %node.target_table, rows, error = %err, "flush failed, keeping rows");
                    held_back[id] = true;
                    failures.push(err);
                }
            }
        }

        if failures.is_empty() {
            self.payloads = 0;
            info!(
                tables = summary.tables_written,
                rows = summary.rows_written,
                "flush complete"
            );
            Ok(summary)
        } else {
            Err(FlushError { summary, failures })
        }
    }

    /// Drop every buffered row without writing it
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            node.clear();
        }
        self.payloads = 0;
    }
}

fn flatten_instances(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_instances(item, out);
            }
        }
        Value::Null => {}
        other => out.push(other),
    }
}
