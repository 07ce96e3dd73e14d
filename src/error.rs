//! Error types shared across the crate

use thiserror::Error;

/// Failure to parse or evaluate an address string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("malformed segment {segment:?} in address {address:?}")]
    MalformedSegment { address: String, segment: String },

    /// A key was missing, or the data had the wrong shape, while walking an address
    #[error("cannot resolve segment {segment:?} after {consumed:?}: {reason}")]
    Resolution {
        segment: String,
        consumed: String,
        reason: String,
    },
}

/// Invalid table settings, detected while building a cache
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("table settings at {path:?} have an empty target_table")]
    MissingTargetTable { path: String },

    #[error("table {table:?} has an empty composite_key")]
    EmptyCompositeKey { table: String },

    #[error("table {table:?}: {source}")]
    InvalidAddress {
        table: String,
        #[source]
        source: AddressError,
    },

    #[error("table {table:?}: sub-table address {address:?} collides with a declared column")]
    SubTableColumnCollision { table: String, address: String },

    #[error("table {table:?}: column {column:?} collides with a reserved column")]
    ReservedColumn { table: String, column: String },

    #[error("sub-table path {path:?} is registered twice")]
    DuplicatePath { path: String },

    #[error("table settings nest deeper than {max} levels at {path:?}")]
    TooDeep { path: String, max: usize },
}

/// Row-level failure while ingesting one payload item
#[derive(Debug, Error)]
pub enum Error {
    #[error("table {table:?}: cannot derive key, field {field:?} is missing or null")]
    KeyDerivation { table: String, field: String },

    #[error("table {table:?}: column {column:?} expects {expected}, got {value}")]
    ValueConversion {
        table: String,
        column: String,
        expected: &'static str,
        value: String,
    },

    #[error("table {table:?}: field {field:?} is not a declared column")]
    UnknownField { table: String, field: String },

    #[error("table {table:?}: expected an object row, got {found}")]
    NotAnObject { table: String, found: &'static str },
}

/// The relational sink rejected a write
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("write to {table:?} rejected: {message}")]
    Rejected { table: String, message: String },

    #[error("sqlite error on {table:?}: {source}")]
    Sqlite {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("io error on {table:?}: {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error on {table:?}: {source}")]
    Serialize {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SinkError {
    pub fn table(&self) -> &str {
        match self {
            SinkError::Rejected { table, .. }
            | SinkError::Sqlite { table, .. }
            | SinkError::Io { table, .. }
            | SinkError::Serialize { table, .. } => table,
        }
    }
}

/// A dependent request could not be derived from a response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("dependent endpoint {endpoint:?}: {source}")]
    Address {
        endpoint: String,
        #[source]
        source: AddressError,
    },

    #[error("endpoint {endpoint:?} has no value for placeholder {{{parameter}}}")]
    MissingParameter { endpoint: String, parameter: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
