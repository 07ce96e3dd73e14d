use crate::error::SinkError;
use crate::sink::{RelationalSink, TableBatch};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Appends rows to one `<table>.jsonl` file per table in a directory
pub struct JsonLinesSink {
    output_dir: PathBuf,
    files: HashMap<String, File>,
}

impl JsonLinesSink {
    /// Create the sink, creating `output_dir` if needed
    pub fn new<P: AsRef<Path>>(output_dir: P) -> io::Result<Self> {
        std::fs::create_dir_all(&output_dir)?;

        Ok(JsonLinesSink {
            output_dir: output_dir.as_ref().to_path_buf(),
            files: HashMap::new(),
        })
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", table))
    }

    fn file(&mut self, table: &str) -> io::Result<&mut File> {
        let path = self.path_for(table);
        match self.files.entry(table.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(entry.insert(file))
            }
        }
    }

    /// Append `lines` in one write; on failure cut the file back to where it was
    fn append(&mut self, table: &str, lines: &[u8]) -> io::Result<()> {
        let file = self.file(table)?;
        let before = file.metadata()?.len();

        let result = file.write_all(lines).and_then(|()| file.flush());
        if result.is_err() {
            // Best effort: a handle that cannot write cannot truncate either
            let _ = file.set_len(before);
            self.files.remove(table);
        }
        result
    }
}

impl RelationalSink for JsonLinesSink {
    /// The batch is serialized in full before anything reaches the file, so a
    /// failed write leaves no partial batch behind for the retry to duplicate.
    fn write_rows(&mut self, batch: &TableBatch<'_>) -> Result<usize, SinkError> {
        let mut lines = Vec::new();
        let mut written = 0;
        for row in batch.rows() {
            serde_json::to_writer(&mut lines, &row).map_err(|source| SinkError::Serialize {
                table: batch.table.to_string(),
                source,
            })?;
            lines.push(b'\n');
            written += 1;
        }

        self.append(batch.table, &lines).map_err(|source| SinkError::Io {
            table: batch.table.to_string(),
            source,
        })?;
        Ok(written)
    }
}
