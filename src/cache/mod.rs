//! Table cache engine
//!
//! A [`TableCache`] is built once per endpoint from its [`TableSettings`]
//! tree. Each (sub)table becomes a [`CacheNode`] holding typed column
//! buffers; nodes live in one arena in depth-first pre-order, so walking the
//! arena front to back visits every parent before its children.
//!
//! [`TableSettings`]: crate::settings::TableSettings

mod buffer;
mod engine;
mod node;

pub use buffer::{Cell, ColumnBuffer};
pub use engine::{BufferPolicy, FlushError, FlushSummary, IngestSummary, RowMetadata, TableCache};
pub use node::{CacheNode, NodeId};
