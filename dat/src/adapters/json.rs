//! JSON, JSON Lines and NDJSON adapter.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use indexmap::IndexSet;
use serde_json::Value;

use super::{ChunkIter, FileAdapter, FileValidation, ProbeResult, ReadOptions, ReadResult};
use crate::errors::{DatError, Result};
use crate::frame::DataFrame;

const PROBE_SAMPLE_LINES: usize = 1000;

/// Adapter for JSON documents and line-delimited JSON.
///
/// `.jsonl`/`.ndjson` files are always line-delimited; a `.json` file is
/// line-delimited when its first two non-blank lines are each a complete
/// JSON value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

impl JsonAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns true if the file holds one JSON value per line.
    #[must_use]
    pub fn is_line_delimited(path: &Path) -> bool {
        match super::extension_of(path).as_str() {
            "jsonl" | "ndjson" => return true,
            _ => {}
        }
        let Ok(file) = File::open(path) else {
            return false;
        };
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(std::result::Result::ok)
            .filter(|l| !l.trim().is_empty())
            .take(2)
            .collect();
        lines.len() == 2
            && lines
                .iter()
                .all(|l| serde_json::from_str::<Value>(l).is_ok())
    }

    fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>> {
        let file = File::open(path).map_err(|e| DatError::io(path, e))?;
        Ok(BufReader::new(file).lines())
    }

    fn parse_line(path: &Path, number: usize, line: &str) -> Result<Value> {
        serde_json::from_str(line).map_err(|e| {
            DatError::input(path.display().to_string(), format!("line {number}: {e}"))
        })
    }

    fn read_lines(path: &Path, max: Option<usize>) -> Result<(Vec<Value>, bool)> {
        let mut records = Vec::new();
        for (i, line) in Self::open_lines(path)?.enumerate() {
            let line = line.map_err(|e| DatError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            if max.is_some_and(|max| records.len() >= max) {
                return Ok((records, true));
            }
            records.push(Self::parse_line(path, i + 1, &line)?);
        }
        Ok((records, false))
    }

    fn read_single(path: &Path) -> Result<Value> {
        let file = File::open(path).map_err(|e| DatError::io(path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| DatError::input(path.display().to_string(), e.to_string()))
    }
}

/// Converts a parsed document to rows: arrays become one row per element,
/// anything else a single row.
fn document_records(document: Value) -> Vec<Value> {
    match document {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn record_columns(records: &[Value]) -> Vec<String> {
    let mut columns: IndexSet<String> = IndexSet::new();
    for record in records {
        match record {
            Value::Object(map) => columns.extend(map.keys().cloned()),
            _ => {
                columns.insert("value".to_string());
            }
        }
    }
    columns.into_iter().collect()
}

struct LineChunks<'a> {
    lines: Lines<BufReader<File>>,
    path: &'a Path,
    line_no: usize,
    chunk_size: usize,
    remaining: Option<usize>,
    done: bool,
}

impl Iterator for LineChunks<'_> {
    type Item = Result<DataFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let limit = self
            .remaining
            .map_or(self.chunk_size, |r| r.min(self.chunk_size));
        let mut records = Vec::with_capacity(limit);
        while records.len() < limit {
            let Some(line) = self.lines.next() else {
                self.done = true;
                break;
            };
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(DatError::io(self.path, e)));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match JsonAdapter::parse_line(self.path, self.line_no, &line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= records.len();
            if *remaining == 0 {
                self.done = true;
            }
        }
        if records.is_empty() && self.done {
            return None;
        }
        Some(Ok(DataFrame::from_records(&records, None)))
    }
}

impl FileAdapter for JsonAdapter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json", "jsonl", "ndjson"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/json", "application/x-ndjson", "application/jsonl"]
    }

    fn supports_streaming(&self, path: &Path) -> bool {
        Self::is_line_delimited(path)
    }

    fn probe_schema(&self, path: &Path) -> ProbeResult {
        if !path.exists() {
            return ProbeResult::missing(path);
        }
        if Self::is_line_delimited(path) {
            let lines = match Self::open_lines(path) {
                Ok(lines) => lines,
                Err(e) => return ProbeResult::error(e.to_string()),
            };
            let mut records = Vec::new();
            let mut bytes = 0usize;
            let mut exhausted = true;
            for (i, line) in lines.enumerate() {
                if records.len() >= PROBE_SAMPLE_LINES {
                    exhausted = false;
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(e) => return ProbeResult::error(e.to_string()),
                };
                bytes += line.len() + 1;
                if line.trim().is_empty() {
                    continue;
                }
                match Self::parse_line(path, i + 1, &line) {
                    Ok(record) => records.push(record),
                    Err(e) => return ProbeResult::error(e.to_string()),
                }
            }
            let columns = record_columns(&records);
            if exhausted {
                return ProbeResult::single(columns, records.len());
            }
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let estimate = {
                let total = path.metadata().map(|m| m.len()).unwrap_or(0) as f64;
                ((records.len() as f64) * total / (bytes.max(1) as f64)).round() as usize
            };
            return ProbeResult::single(columns, estimate.max(records.len()));
        }

        match Self::read_single(path) {
            Ok(document) => {
                let records = document_records(document);
                ProbeResult::single(record_columns(&records), records.len())
            }
            Err(e) => ProbeResult::error(e.to_string()),
        }
    }

    fn read_dataframe(&self, path: &Path, options: &ReadOptions) -> Result<(DataFrame, ReadResult)> {
        let (mut records, mut truncated) = if Self::is_line_delimited(path) {
            Self::read_lines(path, options.max_rows)?
        } else {
            (document_records(Self::read_single(path)?), false)
        };
        if let Some(max) = options.max_rows {
            if records.len() > max {
                records.truncate(max);
                truncated = true;
            }
        }
        let df = DataFrame::from_records(&records, None);
        let result = ReadResult {
            rows_read: df.row_count(),
            truncated,
            warnings: Vec::new(),
        };
        Ok((df, result))
    }

    fn stream_dataframe<'a>(
        &'a self,
        path: &'a Path,
        options: &ReadOptions,
        chunk_size: usize,
    ) -> Result<ChunkIter<'a>> {
        if !Self::is_line_delimited(path) {
            return Err(super::streaming_unsupported(self.name(), path));
        }
        Ok(Box::new(LineChunks {
            lines: Self::open_lines(path)?,
            path,
            line_no: 0,
            chunk_size: chunk_size.max(1),
            remaining: options.max_rows,
            done: false,
        }))
    }

    fn validate_file(&self, path: &Path) -> FileValidation {
        if !path.exists() {
            return FileValidation::failed(format!("file not found: {}", path.display()));
        }
        let parsed = if Self::is_line_delimited(path) {
            Self::read_lines(path, None).map(|_| ())
        } else {
            Self::read_single(path).map(|_| ())
        };
        match parsed {
            Ok(()) => FileValidation::ok(),
            Err(e) => FileValidation::failed(e.to_string()),
        }
    }

    fn read_document(&self, path: &Path) -> Result<Value> {
        if Self::is_line_delimited(path) {
            Ok(Value::Array(Self::read_lines(path, None)?.0))
        } else {
            Self::read_single(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TableStatus;
    use serde_json::json;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn test_detects_line_delimited_json() {
        let dir = tempfile::tempdir().unwrap();
        let lines = write(&dir, "a.json", "{\"x\":1}\n{\"x\":2}\n");
        let doc = write(&dir, "b.json", "{\n  \"x\": 1\n}\n");
        assert!(JsonAdapter::is_line_delimited(&lines));
        assert!(!JsonAdapter::is_line_delimited(&doc));
    }

    #[test]
    fn test_read_array_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.json", r#"[{"a": 1, "b": {"c": 2}}, {"a": 3}]"#);
        let (df, _) = JsonAdapter::new()
            .read_dataframe(&path, &ReadOptions::default())
            .unwrap();
        assert_eq!(df.row_count(), 2);
        assert_eq!(df.get(0, "b"), Some(&json!({"c": 2})));
        assert_eq!(df.get(1, "b"), Some(&Value::Null));
    }

    #[test]
    fn test_stream_only_for_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonAdapter::new();
        let nd = write(&dir, "a.ndjson", "{\"x\":1}\n\n{\"x\":2}\n{\"x\":3}\n");
        let chunks: Vec<DataFrame> = adapter
            .stream_dataframe(&nd, &ReadOptions::default(), 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].row_count(), 1);

        let doc = write(&dir, "b.json", "[1, 2]");
        assert!(adapter
            .stream_dataframe(&doc, &ReadOptions::default(), 2)
            .is_err());
    }

    #[test]
    fn test_probe_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonAdapter::new();
        let good = write(&dir, "g.jsonl", "{\"x\":1,\"y\":2}\n");
        let probe = adapter.probe_schema(&good);
        assert_eq!(probe.status, TableStatus::Available);
        assert_eq!(probe.columns, vec!["x".to_string(), "y".to_string()]);

        let empty = write(&dir, "e.json", "[]");
        assert_eq!(adapter.probe_schema(&empty).status, TableStatus::Empty);

        let bad = write(&dir, "bad.json", "{not json");
        assert_eq!(adapter.probe_schema(&bad).status, TableStatus::Error);
        assert!(!adapter.validate_file(&bad).valid);
    }
}
