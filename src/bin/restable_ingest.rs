//! restable-ingest: Flatten JSON responses into relational tables
//!
//! Usage:
//!   # One response (object or array of items) from a file into SQLite
//!   restable-ingest --settings customers.json response.json --sqlite out.db
//!
//!   # A stream of responses, one per line, into JSON Lines files
//!   cat pages.jsonl | restable-ingest --settings customers.json --ndjson --output-dir ./tables
//!
//!   # Print the follow-up requests each response implies
//!   restable-ingest --settings customers.json page.json --output-dir ./tables \
//!       --dependent '/customers/{customerId}/orders={id}>{customerId}'

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use restable::settings::{SqlDialect, TypeMapping};
use restable::{
    merge, BufferPolicy, EndpointConfig, JsonLinesSink, LogicalType, RelationalSink, RowMetadata,
    SqliteSink, TableCache, TableSettings,
};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "restable-ingest")]
#[command(about = "Flatten nested JSON responses into relational tables", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Table settings, or an endpoint configuration with `table_settings`
    #[arg(long, short = 's', value_name = "FILE")]
    settings: String,

    /// Defaults deep-merged underneath the settings file
    #[arg(long, value_name = "FILE")]
    defaults: Option<String>,

    /// Process newline-delimited JSON (one response per line)
    #[arg(long)]
    ndjson: bool,

    /// Write tables into this SQLite database
    #[arg(long, value_name = "DB", conflicts_with = "output_dir", required_unless_present = "output_dir")]
    sqlite: Option<String>,

    /// Write one .jsonl file per table into this directory
    #[arg(long, short = 'o', value_name = "DIR")]
    output_dir: Option<String>,

    /// Flush once this many rows are buffered across all tables
    #[arg(long)]
    batch_rows: Option<usize>,

    /// Flush once this many top-level items have been ingested
    #[arg(long)]
    batch_items: Option<usize>,

    /// Value of _SOURCE_TABLE_NAME (default: each row's target table)
    #[arg(long)]
    source_table: Option<String>,

    /// Native SQL type for a logical type, as LOGICAL=NATIVE (repeatable)
    #[arg(long = "column-type", value_name = "LOGICAL=NATIVE", requires = "sqlite")]
    column_types: Vec<String>,

    /// Extra dependent request, as ENDPOINT=ADDRESS (repeatable)
    #[arg(long = "dependent", value_name = "ENDPOINT=ADDRESS")]
    dependents: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let (settings, mut dependents) = load_settings(&args.settings, args.defaults.as_deref())?;
    for raw in &args.dependents {
        let Some((endpoint, address)) = raw.split_once('=') else {
            bail!("--dependent expects ENDPOINT=ADDRESS, got {:?}", raw);
        };
        dependents.insert(endpoint.to_string(), address.to_string());
    }

    let mut cache = TableCache::build(&settings)
        .context("Invalid table settings")?
        .with_policy(BufferPolicy {
            max_rows: args.batch_rows,
            max_payloads: args.batch_items,
        });

    let mut sink: Box<dyn RelationalSink> = match (&args.sqlite, &args.output_dir) {
        (Some(db), _) => Box::new(
            SqliteSink::open(db)
                .with_context(|| format!("Failed to open SQLite database: {}", db))?
                .with_mapping(type_mapping(&args.column_types)?),
        ),
        (None, Some(dir)) => Box::new(
            JsonLinesSink::new(dir).with_context(|| format!("Failed to create output directory: {}", dir))?,
        ),
        (None, None) => bail!("one of --sqlite or --output-dir is required"),
    };

    let mut metadata = RowMetadata::now();
    if let Some(source_table) = args.source_table {
        metadata = metadata.with_source_table(source_table);
    }

    let reader = open_input(args.input.as_deref())?;
    let mut stdout = std::io::stdout().lock();
    let mut print_dependents = |response: &Value| -> Result<()> {
        match restable::discover(response, &dependents) {
            Ok(requests) => {
                for request in requests {
                    writeln!(stdout, "{}", serde_json::to_string(&request)?)?;
                }
            }
            Err(err) => warn!(error = %err, "skipping dependent requests for response"),
        }
        Ok(())
    };

    let summary = if args.ndjson {
        restable::ingest_reader_with(reader, &mut cache, sink.as_mut(), &metadata, print_dependents)?
    } else {
        let content = read_all(reader)?;
        // simd-json parses in place, so keep the original bytes for the fallback
        let mut scratch = content.clone();
        match simd_json::serde::from_slice::<Value>(&mut scratch) {
            Ok(response) => {
                print_dependents(&response)?;
                restable::ingest_responses([response], &mut cache, sink.as_mut(), &metadata)?
            }
            // Fallback to serde_json for NDJSON
            Err(_) => restable::ingest_reader_with(
                content.as_slice(),
                &mut cache,
                sink.as_mut(),
                &metadata,
                print_dependents,
            )?,
        }
    };

    eprintln!(
        "✓ {} item(s) from {} response(s), {} skipped, {} row(s) written",
        summary.items_ingested, summary.responses, summary.items_skipped, summary.rows_written
    );

    Ok(())
}

fn type_mapping(overrides: &[String]) -> Result<TypeMapping> {
    let mut mapping = TypeMapping::new(SqlDialect::Sqlite);
    for raw in overrides {
        let Some((logical, native)) = raw.split_once('=') else {
            bail!("--column-type expects LOGICAL=NATIVE, got {:?}", raw);
        };
        let logical: LogicalType = serde_json::from_value(Value::String(logical.to_string()))
            .with_context(|| format!("Unknown logical type: {}", logical))?;
        mapping = mapping.with_override(logical, native);
    }
    Ok(mapping)
}

/// Load the settings file, layered over `defaults` when given
fn load_settings(path: &str, defaults: Option<&str>) -> Result<(TableSettings, IndexMap<String, String>)> {
    let overrides = read_json_file(path)?;
    let layered = match defaults {
        Some(defaults) => merge(&read_json_file(defaults)?, &overrides),
        None => overrides,
    };

    if layered.get("table_settings").is_some() {
        let config: EndpointConfig =
            serde_json::from_value(layered).context("Invalid endpoint configuration")?;
        let settings = config
            .table_settings
            .context("Endpoint configuration has no table_settings")?;
        return Ok((settings, config.dependent_requests));
    }

    let settings = serde_json::from_value(layered).context("Invalid table settings")?;
    Ok((settings, IndexMap::new()))
}

fn read_json_file(path: &str) -> Result<Value> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {}", path))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("Failed to parse JSON: {}", path))
}

fn open_input(input: Option<&str>) -> Result<Box<dyn BufRead>> {
    Ok(match input {
        Some(file_path) => Box::new(BufReader::new(
            File::open(file_path).with_context(|| format!("Failed to open file: {}", file_path))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    })
}

fn read_all(mut reader: Box<dyn BufRead>) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    reader.read_to_end(&mut content).context("Failed to read input")?;
    Ok(content)
}
