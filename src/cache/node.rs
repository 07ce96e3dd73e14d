//! Cache nodes and the depth-first build of a node tree from table settings

use crate::address::Address;
use crate::cache::buffer::{Cell, ColumnBuffer};
use crate::error::ConfigError;
use crate::settings::{
    is_meta_column, LogicalType, TableSettings, UnknownFieldPolicy, COMPOSITE_JOIN, MAX_DEPTH,
    META_COLUMNS,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Index of a node in its cache's arena
pub type NodeId = usize;

/// A declared column and how payload values are converted into it
#[derive(Debug, Clone)]
pub(crate) struct ColumnSpec {
    pub name: String,
    pub logical_type: LogicalType,
    pub datetime_format: Option<String>,
}

/// Runtime buffer and schema for one (sub)table
#[derive(Debug)]
pub struct CacheNode {
    pub(crate) path: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) target_table: String,
    pub(crate) meta_table: String,
    pub(crate) key_column: String,
    pub(crate) key_fields: Vec<String>,
    pub(crate) local_key: Vec<Address>,
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) children: Vec<(Address, NodeId)>,
    pub(crate) ignore: Vec<Address>,
    pub(crate) unknown_fields: UnknownFieldPolicy,
    /// Key column first, then declared columns, then metadata columns
    pub(crate) buffers: IndexMap<String, ColumnBuffer>,
    /// Buffered rows per key value
    seen_keys: HashMap<String, usize>,
}

impl CacheNode {
    /// Sub-table addresses from the root joined with `/`; the root's path is empty
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    pub fn meta_table(&self) -> &str {
        &self.meta_table
    }

    /// Name of the synthetic key column, e.g. `id:order_id`
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Ancestor key fields followed by this table's own
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    pub fn buffer(&self, column: &str) -> Option<&ColumnBuffer> {
        self.buffers.get(column)
    }

    pub fn buffers(&self) -> &IndexMap<String, ColumnBuffer> {
        &self.buffers
    }

    /// Sub-table addresses and the nodes they feed, in declaration order
    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(address, id)| (address.as_str(), *id))
    }

    pub fn ignored_addresses(&self) -> impl Iterator<Item = &str> {
        self.ignore.iter().map(Address::as_str)
    }

    /// Buffered rows; every buffer of a node has this length
    pub fn row_count(&self) -> usize {
        self.buffers.get(&self.key_column).map_or(0, ColumnBuffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Append one converted row, cells in buffer order
    pub(crate) fn append(&mut self, cells: Vec<Cell>) {
        debug_assert_eq!(cells.len(), self.buffers.len());

        if let Some(Cell::String(key)) = cells.first() {
            let count = self.seen_keys.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                warn!(table = %self.target_table, key = %key, "duplicate key in buffered batch");
            }
        }

        for (buffer, cell) in self.buffers.values_mut().zip(cells) {
            buffer.push(cell);
        }
    }

    /// Drop rows beyond `len`
    pub(crate) fn truncate(&mut self, len: usize) {
        if let Some(keys) = self.buffers.get(&self.key_column).and_then(ColumnBuffer::as_strings) {
            for key in keys.iter().skip(len).flatten() {
                if let Some(count) = self.seen_keys.get_mut(key) {
                    *count -= 1;
                    if *count == 0 {
                        self.seen_keys.remove(key);
                    }
                }
            }
        }

        for buffer in self.buffers.values_mut() {
            buffer.truncate(len);
        }
    }

    /// Rows buffered under `key`
    pub fn key_count(&self, key: &str) -> usize {
        self.seen_keys.get(key).copied().unwrap_or(0)
    }

    /// Whether a field left over after columns were taken is still accounted
    /// for: a top-level key field, or a container a sub-table or ignore
    /// address emptied.
    pub(crate) fn consumes(&self, field: &str, leftover: &Value) -> bool {
        let is_head = |address: &Address| address.head() == Some(field);

        self.local_key.iter().any(is_head)
            || (self.ignore.iter().any(|a| a.segments().len() > 1 && is_head(a)) && is_hollow(leftover))
    }

    pub(crate) fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
        self.seen_keys.clear();
    }
}

/// Null, or containers holding nothing but hollow values
fn is_hollow(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(fields) => fields.values().all(is_hollow),
        Value::Array(items) => items.iter().all(is_hollow),
        _ => false,
    }
}

/// Nodes in depth-first pre-order plus the path → node registry
pub(crate) struct NodeTree {
    pub nodes: Vec<CacheNode>,
    pub registry: IndexMap<String, NodeId>,
}

/// Build the node tree for `settings`.
///
/// Settings are only read: each child's key fields are computed as the
/// parent's key fields followed by the child's own composite key, and the
/// sub-table addresses added to a node's ignore list live on the node, not on
/// the settings.
pub(crate) fn build_tree(settings: &TableSettings) -> Result<NodeTree, ConfigError> {
    let mut tree = NodeTree {
        nodes: Vec::new(),
        registry: IndexMap::new(),
    };
    build_node(settings, None, String::new(), &[], 0, &mut tree)?;
    Ok(tree)
}

fn build_node(
    settings: &TableSettings,
    parent: Option<NodeId>,
    path: String,
    inherited_key: &[String],
    depth: usize,
    tree: &mut NodeTree,
) -> Result<NodeId, ConfigError> {
    if depth > MAX_DEPTH {
        return Err(ConfigError::TooDeep { path, max: MAX_DEPTH });
    }

    settings.validate_node(&path)?;

    let key_fields: Vec<String> = inherited_key
        .iter()
        .chain(&settings.composite_key)
        .cloned()
        .collect();
    let key_column = key_fields.join(COMPOSITE_JOIN);

    if is_meta_column(&key_column) {
        return Err(ConfigError::ReservedColumn {
            table: settings.target_table.clone(),
            column: key_column,
        });
    }

    let local_key = settings
        .composite_key
        .iter()
        .map(|field| settings.parse_address(field))
        .collect::<Result<Vec<_>, _>>()?;

    let mut ignore = settings
        .ignore_fields
        .iter()
        .map(|raw| settings.parse_address(raw))
        .collect::<Result<Vec<_>, _>>()?;
    for raw in settings.sub_tables.keys() {
        if !settings.ignore_fields.contains(raw) {
            ignore.push(settings.parse_address(raw)?);
        }
    }

    // A declared column named like the key column is the key column
    let columns: Vec<ColumnSpec> = settings
        .columns
        .iter()
        .filter(|(name, _)| **name != key_column)
        .map(|(name, logical_type)| ColumnSpec {
            name: name.clone(),
            logical_type: *logical_type,
            datetime_format: settings.datetime_formats.get(name).cloned(),
        })
        .collect();

    let mut buffers = IndexMap::with_capacity(columns.len() + META_COLUMNS.len() + 1);
    buffers.insert(key_column.clone(), ColumnBuffer::new(LogicalType::String));
    for column in &columns {
        buffers.insert(column.name.clone(), ColumnBuffer::new(column.logical_type));
    }
    for meta in META_COLUMNS {
        buffers.insert(meta.name.to_string(), ColumnBuffer::new(meta.logical_type));
    }

    if tree.registry.contains_key(&path) {
        return Err(ConfigError::DuplicatePath { path });
    }

    let id = tree.nodes.len();
    tree.registry.insert(path.clone(), id);
    tree.nodes.push(CacheNode {
        path: path.clone(),
        parent,
        target_table: settings.target_table.clone(),
        meta_table: settings.meta_table_name(),
        key_column,
        key_fields: key_fields.clone(),
        local_key,
        columns,
        children: Vec::with_capacity(settings.sub_tables.len()),
        ignore,
        unknown_fields: settings.unknown_fields,
        buffers,
        seen_keys: HashMap::new(),
    });

    for (raw, sub_settings) in &settings.sub_tables {
        let address = settings.parse_address(raw)?;
        let child_path = if path.is_empty() {
            raw.clone()
        } else {
            format!("{}/{}", path, raw)
        };

        let child = build_node(sub_settings, Some(id), child_path, &key_fields, depth + 1, tree)?;
        tree.nodes[id].children.push((address, child));
    }

    Ok(id)
}
