//! # Restable - REST responses to relational tables
//!
//! Flattens nested JSON responses into a forest of flat tables linked by
//! synthetic composite keys, buffers the rows per table, and flushes them to a
//! relational sink in batches.
//!
//! ## Modules
//!
//! - **address**: the dotted addressing language (`data.{id}>{customerId}`)
//! - **merge**: deep merge of configuration trees
//! - **settings**: table settings, logical types, metadata columns, inference
//! - **cache**: the table cache engine (`build`, `ingest`, `flush`)
//! - **sink**: where flushed batches go (memory, JSON Lines, SQLite)
//! - **dependent**: follow-up requests discovered in a response
//!
//! ## Quick Start
//!
//! ```rust
//! use restable::{MemorySink, TableCache, TableSettings};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings: TableSettings = serde_json::from_value(json!({
//!     "target_table": "customers",
//!     "composite_key": ["id"],
//!     "columns": {"name": "string"},
//!     "sub_tables": {
//!         "orders": {
//!             "target_table": "orders",
//!             "composite_key": ["order_id"],
//!             "columns": {"order_id": "number"}
//!         }
//!     }
//! }))?;
//!
//! let mut cache = TableCache::build(&settings)?;
//! cache.ingest(json!({"id": 1, "name": "Alice", "orders": [{"order_id": 10}]}))?;
//!
//! let mut sink = MemorySink::new();
//! cache.flush(&mut sink)?;
//!
//! // orders rows are keyed "1:10" in column "id:order_id"
//! assert_eq!(sink.rows("orders")[0]["id:order_id"], "1:10");
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::BufRead;
use tracing::info;

pub mod address;
pub mod cache;
pub mod dependent;
pub mod error;
pub mod merge;
pub mod settings;
pub mod sink;

// Re-export commonly used types for convenience
pub use address::{Address, ParameterRecord};
pub use cache::{BufferPolicy, FlushError, FlushSummary, IngestSummary, RowMetadata, TableCache};
pub use dependent::{discover, EndpointConfig, EndpointRequest};
pub use error::{AddressError, ConfigError, Error, RequestError, SinkError};
pub use merge::merge;
pub use settings::{infer_settings, LogicalType, TableSettings, TypeMapping};
pub use sink::{JsonLinesSink, MemorySink, RelationalSink, SqliteSink, TableBatch};

/// Totals over a stream of responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub responses: usize,
    pub items_ingested: usize,
    pub items_skipped: usize,
    pub flushes: usize,
    pub rows_written: usize,
}

impl StreamSummary {
    fn add_flush(&mut self, flush: FlushSummary) {
        self.flushes += 1;
        self.rows_written += flush.rows_written;
    }
}

/// Ingest a sequence of responses, flushing whenever the cache's buffer
/// policy asks for it and once more at the end.
///
/// Items that fail to ingest are logged and skipped; a failed flush stops the
/// stream with the failed tables' rows still buffered in `cache`.
pub fn ingest_responses<I>(
    responses: I,
    cache: &mut TableCache,
    sink: &mut dyn RelationalSink,
    metadata: &RowMetadata,
) -> Result<StreamSummary>
where
    I: IntoIterator<Item = Value>,
{
    let mut summary = StreamSummary::default();

    for response in responses {
        ingest_response(response, cache, sink, metadata, &mut summary)?;
    }

    finish(cache, sink, summary)
}

/// Main entry point: ingest newline-delimited JSON responses from `reader`
pub fn ingest_reader<R: BufRead>(
    reader: R,
    cache: &mut TableCache,
    sink: &mut dyn RelationalSink,
    metadata: &RowMetadata,
) -> Result<StreamSummary> {
    ingest_reader_with(reader, cache, sink, metadata, |_| Ok(()))
}

/// [`ingest_reader`], handing each response to `inspect` before it is
/// ingested. Only one response is held in memory at a time.
pub fn ingest_reader_with<R, F>(
    reader: R,
    cache: &mut TableCache,
    sink: &mut dyn RelationalSink,
    metadata: &RowMetadata,
    mut inspect: F,
) -> Result<StreamSummary>
where
    R: BufRead,
    F: FnMut(&Value) -> Result<()>,
{
    let mut summary = StreamSummary::default();

    for (number, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read line")?;
        if line.trim().is_empty() {
            continue;
        }

        let response: Value = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse JSON on line {}", number + 1))?;
        inspect(&response)?;
        ingest_response(response, cache, sink, metadata, &mut summary)?;
    }

    finish(cache, sink, summary)
}

fn ingest_response(
    response: Value,
    cache: &mut TableCache,
    sink: &mut dyn RelationalSink,
    metadata: &RowMetadata,
    summary: &mut StreamSummary,
) -> Result<()> {
    let ingest = cache.ingest_all(response, metadata);
    summary.responses += 1;
    summary.items_ingested += ingest.ingested;
    summary.items_skipped += ingest.skipped.len();

    if cache.should_flush() {
        let flush = cache.flush(sink).context("Failed to flush table cache")?;
        summary.add_flush(flush);
    }

    Ok(())
}

fn finish(
    cache: &mut TableCache,
    sink: &mut dyn RelationalSink,
    mut summary: StreamSummary,
) -> Result<StreamSummary> {
    if cache.buffered_rows() > 0 {
        let flush = cache.flush(sink).context("Failed to flush table cache")?;
        summary.add_flush(flush);
    }

    info!(
        responses = summary.responses,
        ingested = summary.items_ingested,
        skipped = summary.items_skipped,
        rows = summary.rows_written,
        "stream complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn settings() -> TableSettings {
        TableSettings::new("posts", ["id"])
            .with_column("title", LogicalType::String)
            .with_sub_table(
                "comments",
                TableSettings::new("comments", ["cid"]).with_column("cid", LogicalType::Number),
            )
    }

    #[test]
    fn test_ingest_reader_flushes_by_policy() {
        let input = [
            json!([{"id": 1, "title": "a", "comments": [{"cid": 1}]}, {"title": "no key"}]),
            json!({"id": 2, "title": "b", "comments": [{"cid": 2}, {"cid": 3}]}),
            json!({"id": 3, "title": "c"}),
        ]
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n\n");

        let mut cache = TableCache::build(&settings())
            .unwrap()
            .with_policy(BufferPolicy { max_rows: None, max_payloads: Some(2) });
        let mut sink = MemorySink::new();

        let summary =
            ingest_reader(Cursor::new(input), &mut cache, &mut sink, &RowMetadata::now()).unwrap();

        assert_eq!(summary.responses, 3);
        assert_eq!(summary.items_ingested, 3);
        assert_eq!(summary.items_skipped, 1);
        assert_eq!(summary.flushes, 2);
        assert_eq!(summary.rows_written, 3 + 3);
        assert_eq!(sink.rows("posts").len(), 3);
        assert_eq!(sink.rows("comments")[2]["id:cid"], json!("2:3"));
        assert_eq!(cache.buffered_rows(), 0);
    }

    #[test]
    fn test_ingest_reader_reports_bad_json() {
        let mut cache = TableCache::build(&settings()).unwrap();
        let mut sink = MemorySink::new();

        let err = ingest_reader(
            Cursor::new("{\"id\": 1}\n{not json"),
            &mut cache,
            &mut sink,
            &RowMetadata::now(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_ingest_reader_with_inspects_each_response() {
        let input = "{\"id\": 1, \"comments\": [{\"cid\": 7}]}\n{\"id\": 2}\n{\"id\": 3}";
        let mut cache = TableCache::build(&settings()).unwrap();
        let mut sink = MemorySink::new();
        let mut seen = Vec::new();

        let err = ingest_reader_with(
            Cursor::new(input),
            &mut cache,
            &mut sink,
            &RowMetadata::now(),
            |response| {
                if response["id"] == 3 {
                    anyhow::bail!("stop at 3");
                }
                seen.push(response["id"].clone());
                Ok(())
            },
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "stop at 3");
        assert_eq!(seen, vec![json!(1), json!(2)]);
        assert_eq!(cache.root().row_count(), 2);
        assert_eq!(cache.node("comments").unwrap().row_count(), 1);
    }

    #[test]
    fn test_failed_flush_stops_stream() {
        let mut cache = TableCache::build(&settings()).unwrap();
        let mut sink = MemorySink::new();
        sink.fail_table("comments");

        let responses = vec![json!({"id": 1, "comments": [{"cid": 1}]})];
        let err = ingest_responses(responses, &mut cache, &mut sink, &RowMetadata::now()).unwrap_err();

        assert!(err.downcast_ref::<FlushError>().is_some());
        assert_eq!(cache.node("comments").unwrap().row_count(), 1);
        assert_eq!(sink.rows("posts").len(), 1);
    }
}
