//! Table settings: the declarative tree mapping one payload onto tables
//!
//! A [`TableSettings`] node names a target table, its typed columns and its
//! composite key, and nests further nodes under `sub_tables`, keyed by the
//! address of the repeating structure inside the parent payload:
//!
//! ```json
//! {
//!   "target_table": "customers",
//!   "composite_key": ["id"],
//!   "columns": {"id": "number", "name": "string"},
//!   "sub_tables": {
//!     "orders": {
//!       "target_table": "orders",
//!       "composite_key": ["order_id"],
//!       "columns": {"order_id": "number", "placed_at": "datetime"}
//!     }
//!   }
//! }
//! ```

pub mod infer;

use crate::address::Address;
use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub use infer::infer_settings;

/// Separator between composite key parts, in both key column names and key values
pub const COMPOSITE_JOIN: &str = ":";

/// Deepest sub-table nesting accepted by a cache build
pub const MAX_DEPTH: usize = 32;

/// Logical column type, resolved to a typed buffer when a cache is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    #[serde(alias = "String", alias = "Utf8", alias = "str")]
    String,
    /// Any JSON number, kept exactly as delivered
    #[serde(alias = "Number", alias = "float", alias = "Float32", alias = "Float64")]
    Number,
    /// Whole numbers that fit in an `i64`
    #[serde(alias = "Integer", alias = "int", alias = "Int32", alias = "Int64")]
    Integer,
    #[serde(alias = "Boolean", alias = "bool")]
    Boolean,
    #[serde(alias = "Datetime", alias = "Date", alias = "date")]
    Datetime,
}

impl LogicalType {
    pub fn name(self) -> &'static str {
        match self {
            LogicalType::String => "string",
            LogicalType::Number => "number",
            LogicalType::Integer => "integer",
            LogicalType::Boolean => "boolean",
            LogicalType::Datetime => "datetime",
        }
    }

    fn index(self) -> usize {
        match self {
            LogicalType::String => 0,
            LogicalType::Number => 1,
            LogicalType::Integer => 2,
            LogicalType::Boolean => 3,
            LogicalType::Datetime => 4,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SQL flavour a sink speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Sqlite,
    Postgres,
    #[serde(alias = "sqlserver")]
    MsSql,
}

impl FromStr for SqlDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(SqlDialect::Sqlite),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mssql" | "sqlserver" => Ok(SqlDialect::MsSql),
            _ => Err(format!(
                "Unknown SQL dialect: {}. Use 'sqlite', 'postgres' or 'mssql'.",
                s
            )),
        }
    }
}

/// Native column types, indexed by dialect then by logical type
const NATIVE_TYPES: [[&str; 5]; 3] = [
    // sqlite: NUMERIC affinity stores whole numbers as INTEGER, fractions as REAL
    ["TEXT", "NUMERIC", "INTEGER", "INTEGER", "TEXT"],
    // postgres
    ["TEXT", "NUMERIC", "BIGINT", "BOOLEAN", "TIMESTAMPTZ"],
    // mssql
    ["NVARCHAR(MAX)", "DECIMAL(38, 10)", "BIGINT", "BIT", "DATETIME2"],
];

/// Logical → sink-native type mapping, with per-type overrides from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMapping {
    #[serde(default)]
    pub dialect: SqlDialect,
    #[serde(default)]
    pub overrides: HashMap<LogicalType, String>,
}

impl TypeMapping {
    pub fn new(dialect: SqlDialect) -> Self {
        TypeMapping {
            dialect,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, logical_type: LogicalType, native: impl Into<String>) -> Self {
        self.overrides.insert(logical_type, native.into());
        self
    }

    pub fn native(&self, logical_type: LogicalType) -> &str {
        if let Some(native) = self.overrides.get(&logical_type) {
            return native;
        }

        let dialect = match self.dialect {
            SqlDialect::Sqlite => 0,
            SqlDialect::Postgres => 1,
            SqlDialect::MsSql => 2,
        };
        NATIVE_TYPES[dialect][logical_type.index()]
    }
}

/// A bookkeeping column present in every table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaColumn {
    pub name: &'static str,
    pub logical_type: LogicalType,
}

pub const DELETED_FLAG: &str = "_IS_DELETED";
pub const DT_DELETED: &str = "_DT_DELETED";
pub const DT_LAST_UPDATED: &str = "_DT_LAST_UPDATED";
pub const DT_CREATED: &str = "_DT_CREATED";
pub const SOURCE_TABLE_NAME: &str = "_SOURCE_TABLE_NAME";

/// Metadata columns appended to every table, in buffer order
pub const META_COLUMNS: [MetaColumn; 5] = [
    MetaColumn { name: DELETED_FLAG, logical_type: LogicalType::Boolean },
    MetaColumn { name: DT_DELETED, logical_type: LogicalType::Datetime },
    MetaColumn { name: DT_LAST_UPDATED, logical_type: LogicalType::Datetime },
    MetaColumn { name: DT_CREATED, logical_type: LogicalType::Datetime },
    MetaColumn { name: SOURCE_TABLE_NAME, logical_type: LogicalType::String },
];

pub fn is_meta_column(name: &str) -> bool {
    META_COLUMNS.iter().any(|c| c.name == name)
}

/// What to do with payload fields that are not declared columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    /// Drop the field (logged at debug level)
    #[default]
    Ignore,
    /// Fail the row
    Reject,
}

/// Settings for one table and, recursively, its sub-tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSettings {
    /// Declared columns in table order
    #[serde(default, alias = "polars_schema")]
    pub columns: IndexMap<String, LogicalType>,

    pub target_table: String,

    /// Fields (dotted for nested values) whose values make up this table's
    /// part of the row key
    pub composite_key: Vec<String>,

    /// Address in this table's payload → settings of the table fed from it
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub sub_tables: IndexMap<String, TableSettings>,

    /// Addresses removed from the payload before the row is written
    #[serde(
        default,
        alias = "ignore_data_at_address",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ignore_fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_table: Option<String>,

    /// `chrono` format strings for datetime columns delivered as text
    #[serde(
        default,
        alias = "date_columns_parsing_string",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub datetime_formats: IndexMap<String, String>,

    #[serde(default)]
    pub unknown_fields: UnknownFieldPolicy,
}

impl TableSettings {
    pub fn new<I, S>(target_table: impl Into<String>, composite_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableSettings {
            columns: IndexMap::new(),
            target_table: target_table.into(),
            composite_key: composite_key.into_iter().map(Into::into).collect(),
            sub_tables: IndexMap::new(),
            ignore_fields: Vec::new(),
            meta_table: None,
            datetime_formats: IndexMap::new(),
            unknown_fields: UnknownFieldPolicy::default(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, logical_type: LogicalType) -> Self {
        self.columns.insert(name.into(), logical_type);
        self
    }

    pub fn with_sub_table(mut self, address: impl Into<String>, settings: TableSettings) -> Self {
        self.sub_tables.insert(address.into(), settings);
        self
    }

    pub fn ignoring(mut self, address: impl Into<String>) -> Self {
        self.ignore_fields.push(address.into());
        self
    }

    pub fn with_datetime_format(mut self, column: impl Into<String>, format: impl Into<String>) -> Self {
        self.datetime_formats.insert(column.into(), format.into());
        self
    }

    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// `meta_table`, or `META_<target_table>` when unset
    pub fn meta_table_name(&self) -> String {
        self.meta_table
            .clone()
            .unwrap_or_else(|| format!("META_{}", self.target_table))
    }

    /// Checks that only need this node; key-column and path checks happen
    /// during the cache build, where ancestors are known.
    pub(crate) fn validate_node(&self, path: &str) -> Result<(), ConfigError> {
        if self.target_table.trim().is_empty() {
            return Err(ConfigError::MissingTargetTable {
                path: path.to_string(),
            });
        }

        if self.composite_key.is_empty() || self.composite_key.iter().any(|k| k.is_empty()) {
            return Err(ConfigError::EmptyCompositeKey {
                table: self.target_table.clone(),
            });
        }

        if let Some(column) = self.columns.keys().find(|c| is_meta_column(c)) {
            return Err(ConfigError::ReservedColumn {
                table: self.target_table.clone(),
                column: column.clone(),
            });
        }

        if let Some(address) = self.sub_tables.keys().find(|a| self.columns.contains_key(*a)) {
            return Err(ConfigError::SubTableColumnCollision {
                table: self.target_table.clone(),
                address: address.clone(),
            });
        }

        Ok(())
    }

    pub(crate) fn parse_address(&self, raw: &str) -> Result<Address, ConfigError> {
        Address::parse(raw).map_err(|source| ConfigError::InvalidAddress {
            table: self.target_table.clone(),
            source,
        })
    }
}
