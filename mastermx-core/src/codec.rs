//! Encodings of the master object
//!
//! Two formats are supported, both through Arrow record batches:
//! - `csv`: header row + one line per row (`arrow::csv`)
//! - `parquet`: columnar, written with `parquet::arrow::ArrowWriter`
//!
//! Decoding is name-driven. A column whose name belongs to the master schema
//! takes the master type (CSV) or the observed type widened towards it
//! (Parquet); other columns keep their observed type. Encoding is
//! deterministic: the same table always produces the same bytes.

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::{CastOptions, cast, cast_with_options};
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema as ArrowSchema};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use crate::table::{Column, ColumnType, Schema, Table, TableError, Value};

const PARQUET_MAGIC: &[u8] = b"PAR1";

/// Errors raised while encoding or decoding table content
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Invalid table: {0}")]
    Table(#[from] TableError),

    #[error("CSV content has no header row")]
    MissingHeader,

    #[error("Column `{column}` has unsupported type {data_type}")]
    UnsupportedType { column: String, data_type: String },

    #[error("Row {row}, column `{column}`: cannot read {value:?} as {expected}")]
    Cell {
        row: usize,
        column: String,
        value: String,
        expected: ColumnType,
    },

    #[error("Unknown table format: {0}")]
    UnknownFormat(String),
}

/// Storage encoding of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableFormat {
    /// tabular-csv
    #[serde(rename = "csv")]
    Csv,
    /// tabular-columnar
    #[serde(rename = "parquet", alias = "columnar")]
    Parquet,
}

impl TableFormat {
    /// File extension used for keys in this format
    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Parquet => "parquet",
        }
    }

    /// Infer the format from a key's extension; anything but `.parquet` is CSV.
    pub fn from_key(key: &str) -> Self {
        let is_parquet = key
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("parquet"));
        if is_parquet {
            TableFormat::Parquet
        } else {
            TableFormat::Csv
        }
    }

    /// Detect the encoding of raw content by its magic bytes
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(PARQUET_MAGIC) {
            TableFormat::Parquet
        } else {
            TableFormat::Csv
        }
    }
}

impl std::fmt::Display for TableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TableFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "tabular-csv" => Ok(TableFormat::Csv),
            "parquet" | "columnar" | "tabular-columnar" => Ok(TableFormat::Parquet),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

/// A table together with its stored bytes
#[derive(Debug, Clone)]
pub struct EncodedTable {
    pub table: Table,
    pub bytes: Bytes,
    pub format: TableFormat,
}

impl EncodedTable {
    pub fn encode(table: Table, format: TableFormat) -> Result<Self, CodecError> {
        let bytes = encode(&table, format)?;
        Ok(Self {
            table,
            bytes,
            format,
        })
    }

    pub fn decode(bytes: Bytes, format: TableFormat) -> Result<Self, CodecError> {
        let table = decode(&bytes, format)?;
        Ok(Self {
            table,
            bytes,
            format,
        })
    }
}

/// Encode a table in the given format
pub fn encode(table: &Table, format: TableFormat) -> Result<Bytes, CodecError> {
    let batch = to_record_batch(table)?;
    let mut buf = Vec::new();
    match format {
        TableFormat::Csv => {
            let mut writer = WriterBuilder::new().with_header(true).build(&mut buf);
            writer.write(&batch)?;
        }
        TableFormat::Parquet => {
            let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
            writer.write(&batch)?;
            writer.close()?;
        }
    }
    Ok(Bytes::from(buf))
}

/// Decode content stored in the given format
pub fn decode(data: &Bytes, format: TableFormat) -> Result<Table, CodecError> {
    match format {
        TableFormat::Csv => decode_csv(data),
        TableFormat::Parquet => decode_parquet(data),
    }
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Text | ColumnType::Timestamp => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
    }
}

fn to_record_batch(table: &Table) -> Result<RecordBatch, CodecError> {
    let columns = table.schema().columns();
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.kind), true))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .enumerate()
        .map(|(index, c)| build_array(table.rows(), index, c.kind))
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(table.row_count()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        arrays,
        &options,
    )?)
}

/// Cells are already type-checked by `Table`, so anything unexpected is null.
fn build_array(rows: &[Vec<Value>], index: usize, kind: ColumnType) -> ArrayRef {
    match kind {
        ColumnType::Text | ColumnType::Timestamp => Arc::new(
            rows.iter()
                .map(|row| match &row[index] {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        ColumnType::Integer => Arc::new(
            rows.iter()
                .map(|row| match row[index] {
                    Value::Integer(n) => Some(n),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        ColumnType::Float => Arc::new(
            rows.iter()
                .map(|row| match row[index] {
                    Value::Float(x) => Some(x),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        ColumnType::Boolean => Arc::new(
            rows.iter()
                .map(|row| match row[index] {
                    Value::Boolean(b) => Some(b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
    }
}

fn decode_csv(data: &Bytes) -> Result<Table, CodecError> {
    // Only the header is needed; every column is read as text and parsed below.
    let (header, _) = Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(data.as_ref()), Some(0))?;
    if header.fields().is_empty() {
        return Err(CodecError::MissingHeader);
    }

    let schema = Schema::new(
        header
            .fields()
            .iter()
            .map(|f| {
                let kind = Schema::master_type(f.name()).unwrap_or(ColumnType::Text);
                Column::new(f.name().clone(), kind)
            })
            .collect(),
    )?;
    let text_schema = ArrowSchema::new(
        header
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    );

    let reader = ReaderBuilder::new(Arc::new(text_schema))
        .with_header(true)
        .build(Cursor::new(data.as_ref()))?;

    let kinds: Vec<ColumnType> = schema.columns().iter().map(|c| c.kind).collect();
    let mut table = Table::empty(schema);
    for batch in reader {
        append_batch(&mut table, &batch?, &kinds)?;
    }
    Ok(table)
}

fn decode_parquet(data: &Bytes) -> Result<Table, CodecError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data.clone())?;
    let schema = Schema::new(
        builder
            .schema()
            .fields()
            .iter()
            .map(|f| -> Result<Column, CodecError> {
                let kind = resolve_type(f.name(), f.data_type())?;
                Ok(Column::new(f.name().clone(), kind))
            })
            .collect::<Result<Vec<_>, _>>()?,
    )?;

    let kinds: Vec<ColumnType> = schema.columns().iter().map(|c| c.kind).collect();
    let mut table = Table::empty(schema);
    for batch in builder.build()? {
        append_batch(&mut table, &batch?, &kinds)?;
    }
    Ok(table)
}

/// Map an observed Arrow type to a column type, widened towards the master
/// schema where that is lossless.
fn resolve_type(name: &str, data_type: &DataType) -> Result<ColumnType, CodecError> {
    let master = Schema::master_type(name);
    let observed = match data_type {
        DataType::Null => return Ok(master.unwrap_or(ColumnType::Text)),
        DataType::Dictionary(_, values) => return resolve_type(name, values),
        DataType::Boolean => ColumnType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::Integer,
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(..)
        | DataType::Decimal256(..) => ColumnType::Float,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => ColumnType::Text,
        DataType::Timestamp(..) | DataType::Date32 | DataType::Date64 => ColumnType::Timestamp,
        other => {
            return Err(CodecError::UnsupportedType {
                column: name.to_string(),
                data_type: other.to_string(),
            });
        }
    };

    Ok(match (observed, master) {
        (ColumnType::Text, Some(ColumnType::Timestamp)) => ColumnType::Timestamp,
        (ColumnType::Integer, Some(ColumnType::Float)) => ColumnType::Float,
        (observed, _) => observed,
    })
}

fn append_batch(
    table: &mut Table,
    batch: &RecordBatch,
    kinds: &[ColumnType],
) -> Result<(), CodecError> {
    let offset = table.row_count();
    let mut rows: Vec<Vec<Value>> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(kinds.len()))
        .collect();

    for (index, kind) in kinds.iter().enumerate() {
        let column = &table.schema().columns()[index].name;
        let cells = column_values(batch.column(index), *kind, column, offset)?;
        for (row, cell) in rows.iter_mut().zip(cells) {
            row.push(cell);
        }
    }

    for row in rows {
        table.push_row(row)?;
    }
    Ok(())
}

fn column_values(
    array: &ArrayRef,
    kind: ColumnType,
    column: &str,
    offset: usize,
) -> Result<Vec<Value>, CodecError> {
    let textual = matches!(
        array.data_type(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    );

    match kind {
        ColumnType::Text | ColumnType::Timestamp => {
            let strings = cast(array, &DataType::Utf8)?;
            Ok(strings
                .as_string::<i32>()
                .iter()
                .map(|v| v.map_or(Value::Null, |s| Value::Text(s.to_string())))
                .collect())
        }
        _ if textual => {
            let strings = cast(array, &DataType::Utf8)?;
            strings
                .as_string::<i32>()
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    None => Ok(Value::Null),
                    Some(s) => parse_cell(s, kind).ok_or_else(|| CodecError::Cell {
                        row: offset + i,
                        column: column.to_string(),
                        value: s.to_string(),
                        expected: kind,
                    }),
                })
                .collect()
        }
        ColumnType::Integer => {
            let ints = cast_exact(array, &DataType::Int64, ColumnType::Integer, column, offset)?;
            Ok(ints
                .as_primitive::<Int64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Integer))
                .collect())
        }
        ColumnType::Float => {
            let floats = cast_exact(array, &DataType::Float64, ColumnType::Float, column, offset)?;
            Ok(floats
                .as_primitive::<Float64Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Float))
                .collect())
        }
        ColumnType::Boolean => {
            let bools = cast_exact(array, &DataType::Boolean, ColumnType::Boolean, column, offset)?;
            Ok(bools
                .as_boolean()
                .iter()
                .map(|v| v.map_or(Value::Null, Value::Boolean))
                .collect())
        }
    }
}

/// Cast without losing values: a cell the target type cannot hold is an
/// error naming that cell, never a silent null.
fn cast_exact(
    array: &ArrayRef,
    to: &DataType,
    kind: ColumnType,
    column: &str,
    offset: usize,
) -> Result<ArrayRef, CodecError> {
    let strict = CastOptions {
        safe: false,
        ..Default::default()
    };
    match cast_with_options(array, to, &strict) {
        Ok(exact) => Ok(exact),
        Err(err) => {
            let lossy = cast(array, to)?;
            let Some(row) = (0..array.len()).find(|&i| array.is_valid(i) && lossy.is_null(i))
            else {
                return Err(err.into());
            };
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())?;
            Err(CodecError::Cell {
                row: offset + row,
                column: column.to_string(),
                value: formatter.value(row).to_string(),
                expected: kind,
            })
        }
    }
}

/// Parse a non-null text cell. Integers written as `3.0` are accepted.
fn parse_cell(raw: &str, kind: ColumnType) -> Option<Value> {
    let s = raw.trim();
    match kind {
        ColumnType::Text | ColumnType::Timestamp => Some(Value::Text(raw.to_string())),
        ColumnType::Integer => s.parse::<i64>().ok().map(Value::Integer).or_else(|| {
            let x = s.parse::<f64>().ok()?;
            let in_range = x.is_finite() && x.fract() == 0.0 && x.abs() < 9.0e15;
            in_range.then_some(Value::Integer(x as i64))
        }),
        ColumnType::Float => s.parse::<f64>().ok().map(Value::Float),
        ColumnType::Boolean => {
            if s.eq_ignore_ascii_case("true") {
                Some(Value::Boolean(true))
            } else if s.eq_ignore_ascii_case("false") {
                Some(Value::Boolean(false))
            } else {
                None
            }
        }
    }
}
