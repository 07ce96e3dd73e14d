//! restable-infer: Propose table settings from sample responses
//!
//! Nested arrays become sub-tables, strings that are all ISO dates or
//! date-times become datetime columns.
//!
//! Usage:
//!   # Read from file, output to stdout
//!   restable-infer --target-table customers --composite-key id customers.json
//!
//!   # Process NDJSON with compact output, guessing the key
//!   restable-infer --target-table events --ndjson events.jsonl --compact

use anyhow::Result;
use clap::Parser;
use restable::infer_settings;
use serde_json::Value;
use std::fs::File;
use std::io::{stdin, BufRead, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "restable-infer")]
#[command(about = "Infer table settings from sample JSON responses", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Name of the root table
    #[arg(long)]
    target_table: String,

    /// Comma-separated key fields of the root table (guessed if omitted)
    #[arg(long, value_delimiter = ',')]
    composite_key: Vec<String>,

    /// Process newline-delimited JSON (one response per line)
    #[arg(long)]
    ndjson: bool,

    /// Compact output (no pretty-printing)
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Create reader based on input source
    let reader: Box<dyn BufRead> = if let Some(file_path) = &args.input {
        Box::new(BufReader::new(File::open(file_path)?))
    } else {
        Box::new(BufReader::new(stdin()))
    };

    let samples: Vec<Value> = if args.ndjson {
        let mut samples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            samples.push(serde_json::from_str(line)?);
        }
        samples
    } else {
        vec![serde_json::from_reader(reader)?]
    };

    if samples.is_empty() {
        eprintln!("Warning: No JSON objects found in input");
    }

    let composite_key: Vec<String> = args
        .composite_key
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    let settings = infer_settings(&samples, &args.target_table, composite_key);

    let output = if args.compact {
        serde_json::to_string(&settings)?
    } else {
        serde_json::to_string_pretty(&settings)?
    };

    println!("{}", output);

    Ok(())
}
