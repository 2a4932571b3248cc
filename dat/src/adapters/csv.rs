//! CSV/TSV adapter with delimiter auto-detection.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ::csv::{Reader, ReaderBuilder, StringRecord};
use serde_json::Value;

use super::{ChunkIter, FileAdapter, FileValidation, ProbeResult, ReadOptions, ReadResult};
use crate::errors::{DatError, Result};
use crate::frame::{unique_columns, value, DataFrame};

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];
const SNIFF_LINES: usize = 20;
const PROBE_SAMPLE_ROWS: usize = 1000;

/// Adapter for delimited text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvAdapter;

impl CsvAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn delimiter_for(path: &Path, options: &ReadOptions) -> Result<u8> {
        if let Some(delimiter) = options.delimiter {
            return Ok(delimiter);
        }
        let file = File::open(path).map_err(|e| DatError::io(path, e))?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .take(SNIFF_LINES)
            .map_while(std::result::Result::ok)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let fallback = if super::extension_of(path) == "tsv" { b'\t' } else { b',' };
        Ok(detect_delimiter(&lines).unwrap_or(fallback))
    }

    fn open(path: &Path, options: &ReadOptions) -> Result<Reader<File>> {
        let delimiter = Self::delimiter_for(path, options)?;
        ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_path(path)
            .map_err(|e| input_error(path, &e))
    }
}

fn input_error(path: &Path, err: &::csv::Error) -> DatError {
    DatError::input(path.display().to_string(), err.to_string())
}

/// Counts delimiter occurrences outside double quotes.
fn count_outside_quotes(line: &str, delimiter: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for byte in line.bytes() {
        if byte == b'"' {
            in_quotes = !in_quotes;
        } else if byte == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

/// Picks the candidate delimiter with a consistent, maximal per-line count.
fn detect_delimiter(lines: &[String]) -> Option<u8> {
    let first = lines.first()?;
    let mut best: Option<(u8, usize, bool)> = None;
    for delimiter in CANDIDATE_DELIMITERS {
        let count = count_outside_quotes(first, delimiter);
        if count == 0 {
            continue;
        }
        let consistent = lines
            .iter()
            .all(|l| count_outside_quotes(l, delimiter) == count);
        let better = match best {
            None => true,
            Some((_, best_count, best_consistent)) => {
                (consistent && !best_consistent) || (consistent == best_consistent && count > best_count)
            }
        };
        if better {
            best = Some((delimiter, count, consistent));
        }
    }
    best.map(|(d, _, _)| d)
}

fn header_names(record: &StringRecord) -> Vec<String> {
    let names = record
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.trim().trim_start_matches('\u{feff}');
            if h.is_empty() {
                format!("column_{}", i + 1)
            } else {
                h.to_string()
            }
        })
        .collect();
    unique_columns(names)
}

fn record_cells(record: &StringRecord) -> Vec<Value> {
    record.iter().map(value::infer_text).collect()
}

struct CsvChunks {
    reader: Reader<File>,
    columns: Vec<String>,
    chunk_size: usize,
    remaining: Option<usize>,
    done: bool,
    path: String,
}

impl Iterator for CsvChunks {
    type Item = Result<DataFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut limit = self.chunk_size;
        if let Some(remaining) = self.remaining {
            limit = limit.min(remaining);
        }
        let mut df = DataFrame::new(self.columns.clone());
        let mut record = StringRecord::new();
        while df.row_count() < limit {
            match self.reader.read_record(&mut record) {
                Ok(true) => df.push_row(record_cells(&record)),
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(DatError::input(self.path.clone(), e.to_string())));
                }
            }
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= df.row_count();
            if *remaining == 0 {
                self.done = true;
            }
        }
        if df.is_empty() && self.done {
            return None;
        }
        Some(Ok(df))
    }
}

impl FileAdapter for CsvAdapter {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["csv", "tsv", "txt"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["text/csv", "text/tab-separated-values"]
    }

    fn supports_streaming(&self, _path: &Path) -> bool {
        true
    }

    fn probe_schema(&self, path: &Path) -> ProbeResult {
        if !path.exists() {
            return ProbeResult::missing(path);
        }
        let mut reader = match Self::open(path, &ReadOptions::default()) {
            Ok(reader) => reader,
            Err(e) => return ProbeResult::error(e.to_string()),
        };
        let columns = match reader.headers() {
            Ok(headers) => header_names(headers),
            Err(e) => return ProbeResult::error(e.to_string()),
        };
        if columns.is_empty() {
            return ProbeResult::single(columns, 0);
        }

        let mut record = StringRecord::new();
        let mut rows = 0usize;
        let mut exhausted = false;
        while rows < PROBE_SAMPLE_ROWS {
            match reader.read_record(&mut record) {
                Ok(true) => rows += 1,
                Ok(false) => {
                    exhausted = true;
                    break;
                }
                Err(e) => return ProbeResult::error(e.to_string()),
            }
        }
        if exhausted {
            return ProbeResult::single(columns, rows);
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimate = {
            let consumed = reader.position().byte().max(1) as f64;
            let total = path.metadata().map(|m| m.len()).unwrap_or(0) as f64;
            ((rows as f64) * (total / consumed)).round() as usize
        };
        ProbeResult::single(columns, estimate.max(rows))
    }

    fn read_dataframe(&self, path: &Path, options: &ReadOptions) -> Result<(DataFrame, ReadResult)> {
        let mut reader = Self::open(path, options)?;
        let columns = header_names(reader.headers().map_err(|e| input_error(path, &e))?);
        let width = columns.len();
        let mut df = DataFrame::new(columns);
        let mut result = ReadResult::default();
        let mut record = StringRecord::new();
        loop {
            if options.max_rows.is_some_and(|max| df.row_count() >= max) {
                result.truncated = reader
                    .read_record(&mut record)
                    .map_err(|e| input_error(path, &e))?;
                break;
            }
            if !reader
                .read_record(&mut record)
                .map_err(|e| input_error(path, &e))?
            {
                break;
            }
            if record.len() != width {
                result.warnings.push(format!(
                    "line {}: expected {width} fields, found {}",
                    record.position().map_or(0, ::csv::Position::line),
                    record.len()
                ));
            }
            df.push_row(record_cells(&record));
        }
        result.rows_read = df.row_count();
        Ok((df, result))
    }

    fn stream_dataframe<'a>(
        &'a self,
        path: &'a Path,
        options: &ReadOptions,
        chunk_size: usize,
    ) -> Result<ChunkIter<'a>> {
        let mut reader = Self::open(path, options)?;
        let columns = header_names(reader.headers().map_err(|e| input_error(path, &e))?);
        Ok(Box::new(CsvChunks {
            reader,
            columns,
            chunk_size: chunk_size.max(1),
            remaining: options.max_rows,
            done: false,
            path: path.display().to_string(),
        }))
    }

    fn validate_file(&self, path: &Path) -> FileValidation {
        if !path.exists() {
            return FileValidation::failed(format!("file not found: {}", path.display()));
        }
        let mut reader = match Self::open(path, &ReadOptions::default()) {
            Ok(reader) => reader,
            Err(e) => return FileValidation::failed(e.to_string()),
        };
        let columns = match reader.headers() {
            Ok(headers) => header_names(headers),
            Err(e) => return FileValidation::failed(e.to_string()),
        };
        if columns.is_empty() {
            return FileValidation::failed("file has no header row");
        }

        let mut validation = FileValidation::ok();
        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column) {
                validation.warnings.push(format!("duplicate column '{column}'"));
            }
        }
        for (i, record) in reader.records().take(PROBE_SAMPLE_ROWS).enumerate() {
            match record {
                Ok(record) if record.len() != columns.len() => validation.warnings.push(format!(
                    "row {}: expected {} fields, found {}",
                    i + 1,
                    columns.len(),
                    record.len()
                )),
                Ok(_) => {}
                Err(e) => {
                    validation.valid = false;
                    validation.errors.push(e.to_string());
                    break;
                }
            }
        }
        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_detect_delimiter() {
        let lines = vec!["a;b;c".to_string(), "1;2;3".to_string()];
        assert_eq!(detect_delimiter(&lines), Some(b';'));

        let quoted = vec!["\"x,y\"\tb".to_string(), "1\t2".to_string()];
        assert_eq!(detect_delimiter(&quoted), Some(b'\t'));

        assert_eq!(detect_delimiter(&["single".to_string()]), None);
    }

    #[test]
    fn test_read_semicolon_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "m.csv", "wafer;thickness\nW1;10.5\nW2;\n");
        let (df, result) = CsvAdapter::new()
            .read_dataframe(&path, &ReadOptions::default())
            .unwrap();
        assert_eq!(df.columns(), &["wafer".to_string(), "thickness".to_string()]);
        assert_eq!(df.get(0, "thickness"), Some(&json!(10.5)));
        assert_eq!(df.get(1, "thickness"), Some(&Value::Null));
        assert_eq!(result.rows_read, 2);
        assert!(!result.truncated);
    }

    #[test]
    fn test_read_names_blank_and_repeated_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "m.csv", "site,value,,value\n1,2,3,4\n");
        let (df, _) = CsvAdapter::new()
            .read_dataframe(&path, &ReadOptions::default())
            .unwrap();
        assert_eq!(df.columns(), &["site", "value", "column_3", "value_2"]);
        assert_eq!(df.get(0, "value_2"), Some(&json!(4)));
    }

    #[test]
    fn test_read_max_rows_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "m.csv", "a\n1\n2\n3\n");
        let (df, result) = CsvAdapter::new()
            .read_dataframe(&path, &ReadOptions::default().with_max_rows(2))
            .unwrap();
        assert_eq!(df.row_count(), 2);
        assert!(result.truncated);
    }

    #[test]
    fn test_probe_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CsvAdapter::new();

        let full = write(&dir, "a.tsv", "x\ty\n1\t2\n3\t4\n");
        let probe = adapter.probe_schema(&full);
        assert_eq!(probe.status, crate::core::TableStatus::Available);
        assert_eq!(probe.columns.len(), 2);
        assert_eq!(probe.row_estimate, Some(2));

        let empty = write(&dir, "b.csv", "x,y\n");
        assert_eq!(adapter.probe_schema(&empty).status, crate::core::TableStatus::Empty);

        let missing = dir.path().join("nope.csv");
        assert_eq!(adapter.probe_schema(&missing).status, crate::core::TableStatus::Missing);
    }

    #[test]
    fn test_stream_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "s.csv", "n\n1\n2\n3\n4\n5\n");
        let adapter = CsvAdapter::new();
        let chunks: Vec<DataFrame> = adapter
            .stream_dataframe(&path, &ReadOptions::default(), 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.iter().map(DataFrame::row_count).collect::<Vec<_>>(), vec![2, 2, 1]);
    }

    #[test]
    fn test_validate_reports_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "r.csv", "a,b\n1,2\n3\n");
        let validation = CsvAdapter::new().validate_file(&path);
        assert!(validation.valid);
        assert_eq!(validation.warnings.len(), 1);
    }
}
