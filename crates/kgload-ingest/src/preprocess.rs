//! Streaming file sanitizer
//!
//! Rewrites a whole source file through the field sanitizer, chunk by chunk,
//! into a temporary sibling of the output and renames it into place once every
//! row has been written. Peak memory is bounded by the chunk size.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::error::{LoadError, Result};
use crate::progress::row_spinner_if;
use crate::reader::{csv_reader, decode_row, is_gzip, next_raw_row, SourceFormat};
use crate::sanitize::{is_blank_row, sanitize_row, RowOutcome, SanitizeOptions};
use crate::schema::TableSchema;

pub const DEFAULT_CHUNK_SIZE: usize = 5_000;

/// Options for [`preprocess_file`]
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    /// Layout the output must match; when absent the first row decides the width
    pub schema: Option<&'static TableSchema>,
    pub format: SourceFormat,
    pub sanitize: SanitizeOptions,
    /// Rows buffered between writes
    pub chunk_size: usize,
    pub show_progress: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            schema: None,
            format: SourceFormat::default(),
            sanitize: SanitizeOptions::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            show_progress: false,
        }
    }
}

/// Counters of one preprocessing pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessSummary {
    pub rows_read: u64,
    pub rows_written: u64,
    /// Blank rows
    pub rows_skipped: u64,
    /// Rows padded or truncated to the expected width
    pub rows_repaired: u64,
    /// Unparseable lines and rows replaced by an empty row
    pub rows_malformed: u64,
    pub columns: usize,
}

fn temp_sibling(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    output.with_file_name(name)
}

/// Sanitize `input` into `output` (which may be the same path).
///
/// Fails when no row survives sanitization; the temporary file is removed on
/// every failure path and `output` is left untouched.
#[instrument(skip(options), fields(input = %input.display(), output = %output.display()))]
pub fn preprocess_file(
    input: &Path,
    output: &Path,
    options: &PreprocessOptions,
) -> Result<PreprocessSummary> {
    if options.chunk_size == 0 {
        return Err(LoadError::config("chunk size must be greater than 0"));
    }

    let tmp = temp_sibling(output);
    match write_sanitized(input, &tmp, is_gzip(output), options) {
        Ok(summary) if summary.rows_written > 0 => {
            fs::rename(&tmp, output).inspect_err(|_| {
                let _ = fs::remove_file(&tmp);
            })?;
            info!(
                rows_read = summary.rows_read,
                rows_written = summary.rows_written,
                rows_skipped = summary.rows_skipped,
                rows_repaired = summary.rows_repaired,
                rows_malformed = summary.rows_malformed,
                "Preprocessing complete"
            );
            Ok(summary)
        },
        Ok(_) => {
            let _ = fs::remove_file(&tmp);
            warn!("No rows survived sanitization");
            Err(LoadError::EmptySource(input.to_path_buf()))
        },
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        },
    }
}

/// Output file, compressed when the target name ends in `.gz`
enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn create(path: &Path, gzip: bool) -> std::io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if gzip {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        })
    }

    fn finish(self) -> std::io::Result<()> {
        let mut file = match self {
            Sink::Plain(file) => file,
            Sink::Gzip(encoder) => encoder.finish()?,
        };
        file.flush()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

fn write_sanitized(
    input: &Path,
    tmp: &Path,
    gzip: bool,
    options: &PreprocessOptions,
) -> Result<PreprocessSummary> {
    let mut reader = csv_reader(input, &options.format)?;
    let sink = Sink::create(tmp, gzip)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(options.format.delimiter)
        .flexible(false)
        .from_writer(sink);

    let pb = row_spinner_if(options.show_progress, "Sanitizing");
    let mut summary = PreprocessSummary::default();
    let mut expected = options.schema.map(|s| s.width());
    let mut buf = csv::ByteRecord::new();
    let mut chunk: Vec<Vec<String>> = Vec::with_capacity(options.chunk_size);

    if options.format.has_headers {
        let headers: Vec<String> = match options.schema {
            Some(schema) => schema.column_names().map(str::to_string).collect(),
            None => decode_row(reader.byte_headers()?),
        };
        expected.get_or_insert(headers.len());
        writer.write_record(&headers)?;
    }

    while next_raw_row(&mut reader, &mut buf, &mut summary.rows_malformed)? {
        summary.rows_read += 1;
        let raw = decode_row(&buf);
        if is_blank_row(&raw) {
            summary.rows_skipped += 1;
            continue;
        }

        let width = *expected.get_or_insert(raw.len());
        let (fields, outcome) = sanitize_row(&raw, width, &options.sanitize);
        match outcome {
            RowOutcome::Clean => {},
            RowOutcome::Repaired => summary.rows_repaired += 1,
            RowOutcome::Malformed => summary.rows_malformed += 1,
        }
        chunk.push(fields);

        if chunk.len() >= options.chunk_size {
            summary.rows_written += flush_chunk(&mut writer, &mut chunk)?;
            pb.set_position(summary.rows_read);
        }
    }
    summary.rows_written += flush_chunk(&mut writer, &mut chunk)?;
    summary.columns = expected.unwrap_or(0);
    pb.finish_and_clear();

    writer
        .into_inner()
        .map_err(|e| LoadError::Io(std::io::Error::other(e.to_string())))?
        .finish()?;
    Ok(summary)
}

fn flush_chunk(writer: &mut csv::Writer<Sink>, chunk: &mut Vec<Vec<String>>) -> Result<u64> {
    let written = chunk.len() as u64;
    for fields in chunk.drain(..) {
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    debug!(rows = written, "Wrote sanitized chunk");
    Ok(written)
}
