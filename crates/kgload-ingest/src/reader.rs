//! Streaming record source over delimited, optionally gzip-compressed files

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::record::Record;
use crate::sanitize::{is_blank_row, RowOutcome, SanitizeOptions};
use crate::schema::TableSchema;

/// Physical layout of the input files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFormat {
    pub delimiter: u8,
    pub has_headers: bool,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_headers: false,
        }
    }
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Open a file for reading, decompressing `.gz` transparently
pub fn open_source(path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
    let file = BufReader::new(File::open(path)?);
    if is_gzip(path) {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// CSV reader over `path` that tolerates rows of any width
pub fn csv_reader(path: &Path, format: &SourceFormat) -> Result<csv::Reader<Box<dyn Read + Send>>> {
    let source = open_source(path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(format.has_headers)
        .flexible(true)
        .from_reader(source))
}

/// Decode a raw byte row, replacing invalid UTF-8
pub fn decode_row(record: &csv::ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

/// Pull the next raw row, skipping lines the CSV parser rejects.
///
/// I/O errors are returned; anything else is logged and counted in `malformed`.
pub fn next_raw_row(
    reader: &mut csv::Reader<Box<dyn Read + Send>>,
    buf: &mut csv::ByteRecord,
    malformed: &mut u64,
) -> Result<bool> {
    loop {
        match reader.read_byte_record(buf) {
            Ok(more) => return Ok(more),
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                *malformed += 1;
                warn!(error = %e, "Skipping unparseable line");
            },
        }
    }
}

/// Per-file reading counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub rows_read: u64,
    pub rows_skipped_blank: u64,
    pub rows_repaired: u64,
    pub rows_malformed: u64,
    pub rows_missing_key: u64,
}

impl ReadStats {
    /// Rows that never became part of a batch
    pub fn rows_skipped(&self) -> u64 {
        self.rows_skipped_blank + self.rows_missing_key
    }
}

/// Reads sanitized [`Record`]s from one source file in file order
pub struct RecordReader {
    path: PathBuf,
    schema: &'static TableSchema,
    options: SanitizeOptions,
    reader: csv::Reader<Box<dyn Read + Send>>,
    buf: csv::ByteRecord,
    stats: ReadStats,
}

impl RecordReader {
    pub fn open(
        path: impl Into<PathBuf>,
        schema: &'static TableSchema,
        format: &SourceFormat,
        options: SanitizeOptions,
    ) -> Result<Self> {
        let path = path.into();
        let reader = csv_reader(&path, format)?;
        Ok(Self {
            path,
            schema,
            options,
            reader,
            buf: csv::ByteRecord::new(),
            stats: ReadStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    /// Next loadable record, or `None` at end of file
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        while next_raw_row(&mut self.reader, &mut self.buf, &mut self.stats.rows_malformed)? {
            self.stats.rows_read += 1;
            let line = self
                .buf
                .position()
                .map(|p| p.line())
                .unwrap_or(self.stats.rows_read);

            let raw = decode_row(&self.buf);
            if is_blank_row(&raw) {
                self.stats.rows_skipped_blank += 1;
                continue;
            }

            let (record, outcome) = Record::from_raw(self.schema, line, &raw, &self.options);
            match outcome {
                RowOutcome::Clean => {},
                RowOutcome::Repaired => self.stats.rows_repaired += 1,
                RowOutcome::Malformed => self.stats.rows_malformed += 1,
            }

            if record.key().is_empty() {
                self.stats.rows_missing_key += 1;
                debug!(path = %self.path.display(), line, "Skipping row without a key");
                continue;
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Next batch of at most `max` records; `None` once the file is exhausted
    pub fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Record>>> {
        let mut batch = Vec::with_capacity(max.min(4096));
        while batch.len() < max {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}
