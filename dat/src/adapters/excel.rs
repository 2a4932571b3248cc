//! Excel workbook adapter (multi-sheet, eager only).

use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use serde_json::{Map, Value};

use super::{ChunkIter, FileAdapter, FileValidation, ProbeResult, ReadOptions, ReadResult, TableProbe};
use crate::core::TableStatus;
use crate::errors::{DatError, Result};
use crate::frame::{value, DataFrame};

/// Adapter for `.xlsx`, `.xlsm`, `.xls` and `.ods` workbooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExcelAdapter;

impl ExcelAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => value::number(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

/// Converts a sheet range into a table, using the first row as headers.
fn range_to_frame(range: &Range<Data>, max_rows: Option<usize>) -> (DataFrame, bool) {
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return (DataFrame::default(), false);
    };
    let columns: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let text = value::to_text(&cell_value(cell));
            if text.trim().is_empty() {
                format!("column_{}", i + 1)
            } else {
                text.trim().to_string()
            }
        })
        .collect();
    let mut df = DataFrame::new(columns);
    let mut truncated = false;
    for row in rows {
        if max_rows.is_some_and(|max| df.row_count() >= max) {
            truncated = true;
            break;
        }
        df.push_row(row.iter().map(cell_value).collect());
    }
    (df, truncated)
}

fn excel_error(path: &Path, err: &calamine::Error) -> DatError {
    DatError::input(path.display().to_string(), err.to_string())
}

impl FileAdapter for ExcelAdapter {
    fn name(&self) -> &'static str {
        "excel"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["xlsx", "xlsm", "xls", "xlsb", "ods"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &[
            "application/vnd.ms-excel",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "application/vnd.oasis.opendocument.spreadsheet",
        ]
    }

    fn supports_streaming(&self, _path: &Path) -> bool {
        false
    }

    fn probe_schema(&self, path: &Path) -> ProbeResult {
        if !path.exists() {
            return ProbeResult::missing(path);
        }
        let mut workbook = match open_workbook_auto(path) {
            Ok(workbook) => workbook,
            Err(e) => return ProbeResult::error(e.to_string()),
        };
        let tables: Vec<TableProbe> = workbook
            .sheet_names()
            .into_iter()
            .map(|name| match workbook.worksheet_range(&name) {
                Ok(range) => {
                    let (height, _) = range.get_size();
                    let columns = range
                        .rows()
                        .next()
                        .map(|header| header.iter().map(|c| value::to_text(&cell_value(c))).collect())
                        .unwrap_or_default();
                    let rows = height.saturating_sub(1);
                    TableProbe {
                        name,
                        status: if rows == 0 {
                            TableStatus::Empty
                        } else {
                            TableStatus::Available
                        },
                        columns,
                        row_estimate: Some(rows),
                        error: None,
                    }
                }
                Err(e) => TableProbe {
                    name,
                    status: TableStatus::Error,
                    columns: Vec::new(),
                    row_estimate: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();
        if tables.is_empty() {
            return ProbeResult::single(Vec::new(), 0);
        }
        ProbeResult::from_tables(tables)
    }

    fn read_dataframe(&self, path: &Path, options: &ReadOptions) -> Result<(DataFrame, ReadResult)> {
        let mut workbook = open_workbook_auto(path).map_err(|e| excel_error(path, &e))?;
        let sheet = match &options.sheet {
            Some(sheet) => sheet.clone(),
            None => workbook
                .sheet_names()
                .into_iter()
                .next()
                .ok_or_else(|| DatError::input(path.display().to_string(), "workbook has no sheets"))?,
        };
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| excel_error(path, &e))?;
        let (df, truncated) = range_to_frame(&range, options.max_rows);
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
        _options: &ReadOptions,
        _chunk_size: usize,
    ) -> Result<ChunkIter<'a>> {
        Err(super::streaming_unsupported(self.name(), path))
    }

    fn validate_file(&self, path: &Path) -> FileValidation {
        if !path.exists() {
            return FileValidation::failed(format!("file not found: {}", path.display()));
        }
        match open_workbook_auto(path) {
            Ok(mut workbook) => {
                let names = workbook.sheet_names();
                if names.is_empty() {
                    return FileValidation::failed("workbook has no sheets");
                }
                let mut validation = FileValidation::ok();
                for name in names {
                    if let Err(e) = workbook.worksheet_range(&name) {
                        validation.warnings.push(format!("sheet '{name}' unreadable: {e}"));
                    }
                }
                validation
            }
            Err(e) => FileValidation::failed(e.to_string()),
        }
    }

    fn read_document(&self, path: &Path) -> Result<Value> {
        let mut workbook = open_workbook_auto(path).map_err(|e| excel_error(path, &e))?;
        let mut sheets = Map::new();
        for name in workbook.sheet_names() {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| excel_error(path, &e))?;
            let (df, _) = range_to_frame(&range, None);
            sheets.insert(name, Value::Array(df.to_records()));
        }
        Ok(Value::Object(sheets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_values() {
        assert_eq!(cell_value(&Data::Empty), Value::Null);
        assert_eq!(cell_value(&Data::Float(2.0)), Value::from(2));
        assert_eq!(cell_value(&Data::String("  ".into())), Value::Null);
        assert_eq!(cell_value(&Data::Bool(true)), Value::Bool(true));
    }

    #[test]
    fn test_range_to_frame_uses_header_row() {
        let mut range = Range::new((0, 0), (2, 1));
        range.set_value((0, 0), Data::String("wafer".into()));
        range.set_value((0, 1), Data::Empty);
        range.set_value((1, 0), Data::String("W1".into()));
        range.set_value((1, 1), Data::Float(1.5));
        range.set_value((2, 0), Data::String("W2".into()));
        range.set_value((2, 1), Data::Int(3));

        let (df, truncated) = range_to_frame(&range, Some(1));
        assert_eq!(df.columns(), &["wafer".to_string(), "column_2".to_string()]);
        assert_eq!(df.row_count(), 1);
        assert!(truncated);
    }

    #[test]
    fn test_missing_and_stream_unsupported() {
        let adapter = ExcelAdapter::new();
        let path = Path::new("does/not/exist.xlsx");
        assert_eq!(adapter.probe_schema(path).status, TableStatus::Missing);
        assert!(adapter
            .stream_dataframe(path, &ReadOptions::default(), 10)
            .is_err());
        assert!(!adapter.supports_streaming(path));
    }
}
