//! SQLite sink: one table per target table, upserted on the key column

use crate::cache::{Cell, ColumnBuffer};
use crate::error::SinkError;
use crate::settings::{SqlDialect, TypeMapping};
use crate::sink::{RelationalSink, TableBatch};
use chrono::SecondsFormat;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

pub struct SqliteSink {
    conn: Connection,
    mapping: TypeMapping,
    created: HashSet<String>,
}

impl SqliteSink {
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        SqliteSink {
            conn,
            mapping: TypeMapping::new(SqlDialect::Sqlite),
            created: HashSet::new(),
        }
    }

    pub fn with_mapping(mut self, mapping: TypeMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn ensure_table(&mut self, batch: &TableBatch<'_>) -> rusqlite::Result<()> {
        if self.created.contains(batch.table) {
            return Ok(());
        }

        let columns: Vec<String> = batch
            .columns
            .iter()
            .map(|(name, buffer)| {
                let native = self.mapping.native(buffer.logical_type());
                if name == batch.key_column {
                    format!("{} {} PRIMARY KEY", quote(name), native)
                } else {
                    format!("{} {}", quote(name), native)
                }
            })
            .collect();

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(batch.table),
            columns.join(", ")
        );
        debug!(table = batch.table, %ddl, "creating table");
        self.conn.execute(&ddl, [])?;

        self.created.insert(batch.table.to_string());
        Ok(())
    }

    fn upsert(&mut self, batch: &TableBatch<'_>) -> rusqlite::Result<usize> {
        let sql = upsert_statement(batch);
        let rows = batch.row_count();

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in 0..rows {
                let values = batch.columns.values().map(|buffer| sql_value(buffer, row));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        Ok(rows)
    }
}

impl RelationalSink for SqliteSink {
    fn write_rows(&mut self, batch: &TableBatch<'_>) -> Result<usize, SinkError> {
        let sqlite_error = |source| SinkError::Sqlite {
            table: batch.table.to_string(),
            source,
        };

        self.ensure_table(batch).map_err(sqlite_error)?;
        self.upsert(batch).map_err(sqlite_error)
    }
}

fn upsert_statement(batch: &TableBatch<'_>) -> String {
    let names: Vec<String> = batch.columns.keys().map(|name| quote(name)).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = batch
        .columns
        .keys()
        .filter(|name| name.as_str() != batch.key_column)
        .map(|name| format!("{0} = excluded.{0}", quote(name)))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote(batch.table),
        names.join(", "),
        placeholders.join(", "),
        quote(batch.key_column),
        conflict
    )
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn sql_value(buffer: &ColumnBuffer, row: usize) -> SqlValue {
    match buffer.cell(row).unwrap_or(Cell::Null) {
        Cell::Null => SqlValue::Null,
        Cell::String(s) => SqlValue::Text(s),
        Cell::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            // Beyond i64: text keeps every digit
            _ if n.is_u64() => SqlValue::Text(n.to_string()),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Null,
        },
        Cell::Integer(i) => SqlValue::Integer(i),
        Cell::Boolean(b) => SqlValue::Integer(i64::from(b)),
        Cell::Datetime(dt) => SqlValue::Text(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableCache;
    use crate::settings::{LogicalType, TableSettings, DELETED_FLAG};
    use serde_json::json;

    fn settings() -> TableSettings {
        TableSettings::new("customers", ["id"])
            .with_column("name", LogicalType::String)
            .with_column("vip", LogicalType::Boolean)
            .with_sub_table(
                "orders",
                TableSettings::new("orders", ["order_id"])
                    .with_column("order_id", LogicalType::Number)
                    .with_column("placed_at", LogicalType::Datetime),
            )
    }

    fn payload(name: &str) -> serde_json::Value {
        json!({
            "id": 1,
            "name": name,
            "vip": true,
            "orders": [
                {"order_id": 10, "placed_at": "2024-05-06T07:08:09Z"},
                {"order_id": 11}
            ]
        })
    }

    fn count(sink: &SqliteSink, table: &str) -> i64 {
        sink.connection()
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_flush_creates_and_fills_tables() {
        let mut cache = TableCache::build(&settings()).unwrap();
        let mut sink = SqliteSink::in_memory().unwrap();

        cache.ingest(payload("Ada")).unwrap();
        cache.flush(&mut sink).unwrap();

        assert_eq!(count(&sink, "customers"), 1);
        assert_eq!(count(&sink, "orders"), 2);

        let (name, vip, deleted): (String, i64, i64) = sink
            .connection()
            .query_row(
                &format!("SELECT name, vip, {} FROM customers WHERE id = '1'", DELETED_FLAG),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((name.as_str(), vip, deleted), ("Ada", 1, 0));

        let placed_at: Option<String> = sink
            .connection()
            .query_row(
                "SELECT placed_at FROM orders WHERE \"id:order_id\" = '1:10'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(placed_at.as_deref(), Some("2024-05-06T07:08:09Z"));
    }

    #[test]
    fn test_resent_batch_is_idempotent() {
        let mut sink = SqliteSink::in_memory().unwrap();

        for name in ["Ada", "Ada", "Grace"] {
            let mut cache = TableCache::build(&settings()).unwrap();
            cache.ingest(payload(name)).unwrap();
            cache.flush(&mut sink).unwrap();
        }

        assert_eq!(count(&sink, "customers"), 1);
        assert_eq!(count(&sink, "orders"), 2);

        let name: String = sink
            .connection()
            .query_row("SELECT name FROM customers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Grace");
    }

    #[test]
    fn test_large_integers_stay_exact() {
        let settings = TableSettings::new("accounts", ["k"])
            .with_column("big", LogicalType::Number)
            .with_column("snowflake", LogicalType::Integer)
            .with_column("ratio", LogicalType::Number);
        let mut cache = TableCache::build(&settings).unwrap();
        let mut sink = SqliteSink::in_memory().unwrap();

        cache
            .ingest(json!({"k": 1, "big": 9007199254740993i64, "snowflake": 1234567890123456789i64, "ratio": 0.25}))
            .unwrap();
        cache.flush(&mut sink).unwrap();

        let (big, snowflake, ratio, kind): (i64, i64, f64, String) = sink
            .connection()
            .query_row(
                "SELECT big, snowflake, ratio, typeof(big) FROM accounts",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(big, 9007199254740993);
        assert_eq!(snowflake, 1234567890123456789);
        assert_eq!(ratio, 0.25);
        assert_eq!(kind, "integer");
    }

    #[test]
    fn test_upsert_statement_quotes_identifiers() {
        let settings = TableSettings::new("t", ["a", "b"]);
        let cache = TableCache::build(&settings).unwrap();
        let batch = TableBatch::from_node(cache.root());

        let sql = upsert_statement(&batch);
        assert!(sql.starts_with("INSERT INTO \"t\" (\"a:b\", \"_IS_DELETED\""));
        assert!(sql.contains("ON CONFLICT(\"a:b\") DO UPDATE SET \"_IS_DELETED\" = excluded.\"_IS_DELETED\""));
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
