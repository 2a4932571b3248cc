//! Arrow and Parquet bridge for [`DataFrame`].

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions, RecordBatchReader};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use serde_json::Value;

use super::{value, DataFrame};
use crate::errors::{DatError, Result};

/// The Arrow type a column of cells is stored as.
fn infer_type(cells: &[&Value]) -> DataType {
    let non_null: Vec<&&Value> = cells.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return DataType::Utf8;
    }
    if non_null.iter().all(|v| v.as_i64().is_some()) {
        DataType::Int64
    } else if non_null.iter().all(|v| v.is_number()) {
        DataType::Float64
    } else if non_null.iter().all(|v| v.is_boolean()) {
        DataType::Boolean
    } else {
        DataType::Utf8
    }
}

fn build_array(cells: &[&Value], data_type: &DataType) -> ArrayRef {
    match data_type {
        DataType::Int64 => Arc::new(cells.iter().map(|v| v.as_i64()).collect::<Int64Array>()),
        DataType::Float64 => Arc::new(cells.iter().map(|v| v.as_f64()).collect::<Float64Array>()),
        DataType::Boolean => Arc::new(cells.iter().map(|v| v.as_bool()).collect::<BooleanArray>()),
        _ => Arc::new(
            cells
                .iter()
                .map(|v| if v.is_null() { None } else { Some(value::to_text(v)) })
                .collect::<StringArray>(),
        ),
    }
}

/// Converts a table to a record batch, inferring one Arrow type per column.
///
/// # Errors
///
/// Returns an error if Arrow rejects the batch.
pub fn to_record_batch(df: &DataFrame) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(df.column_count());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(df.column_count());
    for (idx, name) in df.columns().iter().enumerate() {
        let cells: Vec<&Value> = df.rows().iter().map(|row| &row[idx]).collect();
        let data_type = infer_type(&cells);
        arrays.push(build_array(&cells, &data_type));
        fields.push(Field::new(name, data_type, true));
    }
    let options = RecordBatchOptions::new().with_row_count(Some(df.row_count()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

fn column_cells(array: &ArrayRef) -> Result<Vec<Value>> {
    let len = array.len();
    let cells = match array.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let casted = cast(array, &DataType::Int64)?;
            let ints = casted.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| if ints.is_null(i) { Value::Null } else { Value::from(ints.value(i)) })
                .collect()
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let casted = cast(array, &DataType::Float64)?;
            let floats = casted.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| if floats.is_null(i) { Value::Null } else { value::number(floats.value(i)) })
                .collect()
        }
        DataType::Boolean => {
            let bools = array.as_boolean();
            (0..len)
                .map(|i| if bools.is_null(i) { Value::Null } else { Value::Bool(bools.value(i)) })
                .collect()
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let casted = cast(array, &DataType::Utf8)?;
            let strings = casted.as_string::<i32>();
            (0..len)
                .map(|i| {
                    if strings.is_null(i) {
                        Value::Null
                    } else {
                        Value::String(strings.value(i).to_string())
                    }
                })
                .collect()
        }
        _ => {
            let options = FormatOptions::default();
            let formatter = ArrayFormatter::try_new(array.as_ref(), &options)?;
            (0..len)
                .map(|i| {
                    if array.is_null(i) {
                        Value::Null
                    } else {
                        Value::String(formatter.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(cells)
}

/// Converts a record batch to a table.
///
/// # Errors
///
/// Returns an error if a column cannot be cast.
pub fn from_record_batch(batch: &RecordBatch) -> Result<DataFrame> {
    let columns: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let mut column_data = Vec::with_capacity(batch.num_columns());
    for array in batch.columns() {
        column_data.push(column_cells(array)?);
    }
    let rows = (0..batch.num_rows())
        .map(|r| column_data.iter().map(|col| col[r].clone()).collect())
        .collect();
    Ok(DataFrame::from_rows(columns, rows))
}

/// Writes a table to a Parquet file.
///
/// Tables without columns have no Parquet representation; nothing is written
/// and `false` is returned.
///
/// # Errors
///
/// Returns an error if the file cannot be created or encoding fails.
pub fn write_parquet(df: &DataFrame, path: &Path) -> Result<bool> {
    if df.column_count() == 0 {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatError::io(parent, e))?;
    }
    let batch = to_record_batch(df)?;
    let file = File::create(path).map_err(|e| DatError::io(path, e))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(true)
}

/// Opens a Parquet file as an iterator of record batches.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or its footer is invalid.
pub fn parquet_reader(path: &Path, batch_size: usize) -> Result<ParquetRecordBatchReader> {
    let file = File::open(path).map_err(|e| DatError::io(path, e))?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(batch_size.max(1))
        .build()?)
}

/// Reads a whole Parquet file into one table.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    let reader = parquet_reader(path, 8192)?;
    let columns: Vec<String> = reader
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let mut frames = Vec::new();
    for batch in reader {
        frames.push(from_record_batch(&batch?)?);
    }
    if frames.is_empty() {
        return Ok(DataFrame::new(columns));
    }
    Ok(DataFrame::concat(&frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> DataFrame {
        DataFrame::from_rows(
            vec!["id".into(), "value".into(), "ok".into(), "label".into()],
            vec![
                vec![json!(1), json!(1.5), json!(true), json!("a")],
                vec![json!(2), json!(2), Value::Null, json!(7)],
            ],
        )
    }

    #[test]
    fn test_infers_column_types() {
        let batch = to_record_batch(&sample()).unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Boolean);
        assert_eq!(schema.field(3).data_type(), &DataType::Utf8);
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_parquet_file_preserves_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t/sample.parquet");
        assert!(write_parquet(&sample(), &path).unwrap());

        let df = read_parquet(&path).unwrap();
        assert_eq!(df.columns(), sample().columns());
        assert_eq!(df.get(0, "value"), Some(&json!(1.5)));
        assert_eq!(df.get(1, "value"), Some(&json!(2)));
        assert_eq!(df.get(1, "ok"), Some(&Value::Null));
        assert_eq!(df.get(1, "label"), Some(&json!("7")));
    }

    #[test]
    fn test_zero_column_table_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        assert!(!write_parquet(&DataFrame::default(), &path).unwrap());
        assert!(!path.exists());
    }
}
