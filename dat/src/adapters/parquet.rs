//! Parquet adapter (columnar, eager and streaming).

use std::fs::File;
use std::path::Path;

use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::{ChunkIter, FileAdapter, FileValidation, ProbeResult, ReadOptions, ReadResult};
use crate::errors::{DatError, Result};
use crate::frame::arrow::{from_record_batch, parquet_reader};
use crate::frame::DataFrame;

/// Adapter for Apache Parquet files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetAdapter;

impl ParquetAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn input_error(path: &Path, err: &DatError) -> DatError {
    DatError::input(path.display().to_string(), err.to_string())
}

impl FileAdapter for ParquetAdapter {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["parquet", "pq"]
    }

    fn mime_types(&self) -> &'static [&'static str] {
        &["application/vnd.apache.parquet", "application/x-parquet"]
    }

    fn supports_streaming(&self, _path: &Path) -> bool {
        true
    }

    fn probe_schema(&self, path: &Path) -> ProbeResult {
        if !path.exists() {
            return ProbeResult::missing(path);
        }
        let builder = match File::open(path)
            .map_err(|e| DatError::io(path, e))
            .and_then(|file| ParquetRecordBatchReaderBuilder::try_new(file).map_err(DatError::from))
        {
            Ok(builder) => builder,
            Err(e) => return ProbeResult::error(e.to_string()),
        };
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let rows = usize::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
        ProbeResult::single(columns, rows)
    }

    fn read_dataframe(&self, path: &Path, options: &ReadOptions) -> Result<(DataFrame, ReadResult)> {
        let chunks: Vec<DataFrame> = self
            .stream_dataframe(path, options, 8192)?
            .collect::<Result<_>>()?;
        let probe = self.probe_schema(path);
        let df = if chunks.is_empty() {
            DataFrame::new(probe.columns)
        } else {
            DataFrame::concat(&chunks)
        };
        let total = probe.row_estimate.unwrap_or(df.row_count());
        let result = ReadResult {
            rows_read: df.row_count(),
            truncated: df.row_count() < total,
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
        let reader = parquet_reader(path, chunk_size).map_err(|e| input_error(path, &e))?;
        let chunks = reader.scan(options.max_rows, |budget, batch| {
            if *budget == Some(0) {
                return None;
            }
            let chunk = batch
                .map_err(DatError::from)
                .and_then(|batch| from_record_batch(&batch))
                .map(|mut df| {
                    if let Some(left) = budget.as_mut() {
                        df.truncate(*left);
                        *left -= df.row_count();
                    }
                    df
                });
            Some(chunk)
        });
        Ok(Box::new(chunks))
    }

    fn validate_file(&self, path: &Path) -> FileValidation {
        if !path.exists() {
            return FileValidation::failed(format!("file not found: {}", path.display()));
        }
        match parquet_reader(path, 1) {
            Ok(_) => FileValidation::ok(),
            Err(e) => FileValidation::failed(e.to_string()),
        }
    }
}
