use anyhow::{Context, Result, ensure};
use arrow::array::{Array, ArrayRef, Float64Array, Float64Builder, StringArray, StringBuilder};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Column type of a warehouse table. Everything in the store is either a
/// string or a nullable double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Utf8,
    Float64,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

pub const fn utf8(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnKind::Utf8,
    }
}

pub const fn float64(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnKind::Float64,
    }
}

/// One cell of a dynamic table row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Float(f64),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Value {
        Value::Text(value.into())
    }

    pub fn opt_text(value: Option<String>) -> Value {
        match value {
            Some(v) => Value::Text(v),
            None => Value::Null,
        }
    }

    pub fn opt_float(value: Option<f64>) -> Value {
        match value {
            Some(v) => Value::Float(v),
            None => Value::Null,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Text(v) => v.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Value::Text(v) => Some(v),
            Value::Float(v) => Some(format!("{v}")),
            Value::Null => None,
        }
    }

    /// String rendering used for key comparisons; nulls sort as empty.
    pub fn key_text(&self) -> String {
        match self {
            Value::Text(v) => v.clone(),
            Value::Float(v) => format!("{v}"),
            Value::Null => String::new(),
        }
    }
}

pub type Row = Vec<Value>;

fn arrow_schema(columns: &[ColumnSpec]) -> Arc<Schema> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|col| {
            let data_type = match col.kind {
                ColumnKind::Utf8 => DataType::Utf8,
                ColumnKind::Float64 => DataType::Float64,
            };
            Field::new(col.name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn build_arrays(columns: &[ColumnSpec], rows: &[Row]) -> Result<Vec<ArrayRef>> {
    for row in rows {
        ensure!(
            row.len() == columns.len(),
            "Row has {} cells, table expects {}",
            row.len(),
            columns.len()
        );
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        match col.kind {
            ColumnKind::Utf8 => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match &row[idx] {
                        Value::Text(v) => builder.append_value(v),
                        Value::Float(v) => builder.append_value(format!("{v}")),
                        Value::Null => builder.append_null(),
                    }
                }
                arrays.push(Arc::new(builder.finish()) as ArrayRef);
            }
            ColumnKind::Float64 => {
                let mut builder = Float64Builder::new();
                for row in rows {
                    match row[idx].as_float() {
                        Some(v) => builder.append_value(v),
                        None => builder.append_null(),
                    }
                }
                arrays.push(Arc::new(builder.finish()) as ArrayRef);
            }
        }
    }
    Ok(arrays)
}

/// Write a table to Parquet atomically: build the file under a `.tmp` name in
/// the same directory, then rename over the destination. A crash mid-write
/// never leaves a corrupt table at `output_path`.
pub fn write_table(output_path: &Path, columns: &[ColumnSpec], rows: &[Row]) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }

    let file_name = output_path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("table.parquet");
    let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));

    let schema = arrow_schema(columns);
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
        .context("Failed creating Parquet ArrowWriter")?;

    let arrays = build_arrays(columns, rows)?;
    let batch = RecordBatch::try_new(schema, arrays)
        .context("Failed creating RecordBatch for Parquet write")?;
    writer
        .write(&batch)
        .context("Failed writing Parquet RecordBatch")?;
    writer.close().context("Failed closing Parquet writer")?;

    fs::rename(&tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving temp parquet {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })?;
    Ok(())
}

/// Read a Parquet table into dynamic rows shaped by `columns`. Columns absent
/// from the file are back-filled as nulls so callers can rely on the full
/// shape; present columns are cast to the requested type.
pub fn read_table(path: &Path, columns: &[ColumnSpec]) -> Result<Vec<Row>> {
    let file =
        File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed reading Parquet metadata from {}", path.display()))?
        .build()
        .with_context(|| format!("Failed building Parquet reader for {}", path.display()))?;

    let mut rows: Vec<Row> = Vec::new();
    for batch in reader {
        let batch =
            batch.with_context(|| format!("Failed reading batch from {}", path.display()))?;
        append_batch_rows(&batch, columns, &mut rows)
            .with_context(|| format!("Failed decoding rows from {}", path.display()))?;
    }
    Ok(rows)
}

fn append_batch_rows(batch: &RecordBatch, columns: &[ColumnSpec], rows: &mut Vec<Row>) -> Result<()> {
    let num_rows = batch.num_rows();
    let mut decoded: Vec<Vec<Value>> = Vec::with_capacity(columns.len());

    for col in columns {
        let column = batch
            .schema()
            .index_of(col.name)
            .ok()
            .map(|idx| Arc::clone(batch.column(idx)));
        let cells = match column {
            None => vec![Value::Null; num_rows],
            Some(array) => match col.kind {
                ColumnKind::Utf8 => {
                    let array = cast(&array, &DataType::Utf8)
                        .with_context(|| format!("Failed casting column {} to utf8", col.name))?;
                    let strings = array
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .context("Cast to utf8 did not yield a string array")?;
                    (0..num_rows)
                        .map(|i| {
                            if strings.is_null(i) {
                                Value::Null
                            } else {
                                Value::Text(strings.value(i).to_string())
                            }
                        })
                        .collect()
                }
                ColumnKind::Float64 => {
                    let array = cast(&array, &DataType::Float64)
                        .with_context(|| format!("Failed casting column {} to f64", col.name))?;
                    let floats = array
                        .as_any()
                        .downcast_ref::<Float64Array>()
                        .context("Cast to f64 did not yield a float array")?;
                    (0..num_rows)
                        .map(|i| {
                            if floats.is_null(i) {
                                Value::Null
                            } else {
                                Value::Float(floats.value(i))
                            }
                        })
                        .collect()
                }
            },
        };
        decoded.push(cells);
    }

    for i in 0..num_rows {
        let row: Row = decoded.iter().map(|cells| cells[i].clone()).collect();
        rows.push(row);
    }
    Ok(())
}

/// Parquet files directly under `dir`, sorted by name for deterministic
/// reads. Missing directory reads as empty.
pub fn list_parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed listing {}", dir.display()))?;
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed listing {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|x| x.to_str()) == Some("parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[ColumnSpec] = &[utf8("code"), utf8("label"), float64("rate")];

    #[test]
    fn round_trips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        let rows = vec![
            vec![Value::text("99213"), Value::Null, Value::Float(82.5)],
            vec![Value::text("99214"), Value::text("office visit"), Value::Null],
        ];
        write_table(&path, COLUMNS, &rows).unwrap();
        let back = read_table(&path, COLUMNS).unwrap();
        assert_eq!(back, rows);
        assert!(!path.with_file_name("t.parquet.tmp").exists());
    }

    #[test]
    fn backfills_missing_columns_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        let narrow: &[ColumnSpec] = &[utf8("code")];
        write_table(&path, narrow, &[vec![Value::text("J1100")]]).unwrap();

        let back = read_table(&path, COLUMNS).unwrap();
        assert_eq!(
            back,
            vec![vec![Value::text("J1100"), Value::Null, Value::Null]]
        );
    }

    #[test]
    fn casts_string_rates_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        let stringy: &[ColumnSpec] = &[utf8("code"), utf8("label"), utf8("rate")];
        write_table(
            &path,
            stringy,
            &[vec![Value::text("99213"), Value::Null, Value::text("12.75")]],
        )
        .unwrap();

        let back = read_table(&path, COLUMNS).unwrap();
        assert_eq!(back[0][2], Value::Float(12.75));
    }

    #[test]
    fn lists_only_parquet_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.parquet"), b"x").unwrap();
        fs::write(dir.path().join("a.parquet"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let files = list_parquet_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
        assert!(list_parquet_files(&dir.path().join("missing")).unwrap().is_empty());
    }
}
