//! Typed, column-oriented row buffers

use crate::settings::LogicalType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// One converted value, ready to append to a buffer of the same type
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    String(String),
    Number(Number),
    Integer(i64),
    Boolean(bool),
    Datetime(DateTime<Utc>),
}

impl Cell {
    /// Convert a payload value to the given logical type.
    ///
    /// Returns the offending value, rendered as text, when it does not fit.
    pub fn convert(
        logical_type: LogicalType,
        value: Value,
        datetime_format: Option<&str>,
    ) -> Result<Cell, String> {
        if value.is_null() {
            return Ok(Cell::Null);
        }

        let converted = match (logical_type, &value) {
            (LogicalType::String, Value::String(s)) => Some(Cell::String(s.clone())),
            (LogicalType::String, other) => Some(Cell::String(other.to_string())),

            (LogicalType::Number, Value::Number(n)) => Some(Cell::Number(n.clone())),
            (LogicalType::Number, Value::String(s)) => s.trim().parse::<Number>().ok().map(Cell::Number),

            (LogicalType::Integer, Value::Number(n)) => whole_number(n).map(Cell::Integer),
            (LogicalType::Integer, Value::String(s)) => s.trim().parse().ok().map(Cell::Integer),

            (LogicalType::Boolean, Value::Bool(b)) => Some(Cell::Boolean(*b)),
            (LogicalType::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(Cell::Boolean(false)),
                Some(1) => Some(Cell::Boolean(true)),
                _ => None,
            },
            (LogicalType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Some(Cell::Boolean(true)),
                "false" | "0" => Some(Cell::Boolean(false)),
                _ => None,
            },

            (LogicalType::Datetime, Value::String(s)) => {
                parse_datetime(s, datetime_format).map(Cell::Datetime)
            }
            (LogicalType::Datetime, Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(Cell::Datetime),

            _ => None,
        };

        converted.ok_or_else(|| value.to_string())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::String(s) => Value::String(s.clone()),
            Cell::Number(n) => Value::Number(n.clone()),
            Cell::Integer(i) => Value::from(*i),
            Cell::Boolean(b) => Value::Bool(*b),
            Cell::Datetime(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

/// `n` as an `i64`, accepting floats with no fractional part (`3.0`)
fn whole_number(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }

    n.as_f64()
        .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
        .map(|f| f as i64)
}

fn parse_datetime(s: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Some(format) = format {
        return NaiveDateTime::parse_from_str(s, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|naive| naive.and_utc());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// All values of one column, in row order
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnBuffer {
    String(Vec<Option<String>>),
    Number(Vec<Option<Number>>),
    Integer(Vec<Option<i64>>),
    Boolean(Vec<Option<bool>>),
    Datetime(Vec<Option<DateTime<Utc>>>),
}

impl ColumnBuffer {
    pub fn new(logical_type: LogicalType) -> Self {
        match logical_type {
            LogicalType::String => ColumnBuffer::String(Vec::new()),
            LogicalType::Number => ColumnBuffer::Number(Vec::new()),
            LogicalType::Integer => ColumnBuffer::Integer(Vec::new()),
            LogicalType::Boolean => ColumnBuffer::Boolean(Vec::new()),
            LogicalType::Datetime => ColumnBuffer::Datetime(Vec::new()),
        }
    }

    pub fn logical_type(&self) -> LogicalType {
        match self {
            ColumnBuffer::String(_) => LogicalType::String,
            ColumnBuffer::Number(_) => LogicalType::Number,
            ColumnBuffer::Integer(_) => LogicalType::Integer,
            ColumnBuffer::Boolean(_) => LogicalType::Boolean,
            ColumnBuffer::Datetime(_) => LogicalType::Datetime,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuffer::String(v) => v.len(),
            ColumnBuffer::Number(v) => v.len(),
            ColumnBuffer::Integer(v) => v.len(),
            ColumnBuffer::Boolean(v) => v.len(),
            ColumnBuffer::Datetime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a cell. A cell of another type is stored as null; `Cell::convert`
    /// for this buffer's type never produces one.
    pub fn push(&mut self, cell: Cell) {
        match (self, cell) {
            (ColumnBuffer::String(v), Cell::String(s)) => v.push(Some(s)),
            (ColumnBuffer::Number(v), Cell::Number(n)) => v.push(Some(n)),
            (ColumnBuffer::Integer(v), Cell::Integer(i)) => v.push(Some(i)),
            (ColumnBuffer::Boolean(v), Cell::Boolean(b)) => v.push(Some(b)),
            (ColumnBuffer::Datetime(v), Cell::Datetime(dt)) => v.push(Some(dt)),
            (buffer, cell) => {
                debug_assert!(matches!(cell, Cell::Null), "cell {:?} pushed to {:?} buffer", cell, buffer.logical_type());
                buffer.push_null();
            }
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnBuffer::String(v) => v.push(None),
            ColumnBuffer::Number(v) => v.push(None),
            ColumnBuffer::Integer(v) => v.push(None),
            ColumnBuffer::Boolean(v) => v.push(None),
            ColumnBuffer::Datetime(v) => v.push(None),
        }
    }

    pub fn truncate(&mut self, len: usize) {
        match self {
            ColumnBuffer::String(v) => v.truncate(len),
            ColumnBuffer::Number(v) => v.truncate(len),
            ColumnBuffer::Integer(v) => v.truncate(len),
            ColumnBuffer::Boolean(v) => v.truncate(len),
            ColumnBuffer::Datetime(v) => v.truncate(len),
        }
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn cell(&self, row: usize) -> Option<Cell> {
        let cell = match self {
            ColumnBuffer::String(v) => v.get(row)?.clone().map(Cell::String),
            ColumnBuffer::Number(v) => v.get(row)?.clone().map(Cell::Number),
            ColumnBuffer::Integer(v) => v.get(row)?.map(Cell::Integer),
            ColumnBuffer::Boolean(v) => v.get(row)?.map(Cell::Boolean),
            ColumnBuffer::Datetime(v) => v.get(row)?.map(Cell::Datetime),
        };
        Some(cell.unwrap_or(Cell::Null))
    }

    pub fn as_strings(&self) -> Option<&[Option<String>]> {
        match self {
            ColumnBuffer::String(v) => Some(v),
            _ => None,
        }
    }
}
