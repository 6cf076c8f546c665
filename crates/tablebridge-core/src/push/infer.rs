//! Two-pass schema inference for uploads.
//!
//! Pass 1 maps each source column onto a remote column kind from the Arrow
//! type found in the first records. Text widths cannot change once a remote
//! table exists, so pass 2 rescans the whole source before the table is
//! created: it finds the longest value of every text column, and it finds
//! integer and boolean columns with missing values. The remote integer and
//! boolean types cannot store a missing value, so those columns are widened
//! to `Float64` (missing becomes NaN) and to text (missing becomes `""`).

use arrow::{
    array::{Array, AsArray},
    compute::cast,
    datatypes::DataType,
};
use log::{debug, info};
use snafu::prelude::*;

use crate::{
    columns::{ColumnDescriptor, ColumnKind},
    entity::EntityKind,
    push::{
        error::{SchemaError, SourceSnafu, UnsupportedColumnTypeSnafu},
        source::TableSource,
    },
};

/// Integer column names that hold references to other objects.
pub const SPECIAL_NAMES: [(&str, EntityKind); 7] = [
    ("roi", EntityKind::Roi),
    ("image", EntityKind::Image),
    ("dataset", EntityKind::Dataset),
    ("well", EntityKind::Well),
    ("field", EntityKind::Image),
    ("wellsample", EntityKind::Image),
    ("plate", EntityKind::Plate),
];

/// Upper bound on rows per pushed chunk.
pub const MAX_CHUNK_ROWS: usize = 50_000;

/// Cells per chunk used to derive a chunk size from the column count.
pub const CELLS_PER_CHUNK: usize = 2_000_000;

/// Schema and transfer plan for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredSchema {
    /// Remote columns, in source order.
    pub columns: Vec<ColumnDescriptor>,
    /// Names of the text columns.
    pub text_columns: Vec<String>,
    /// Row count, when known.
    pub total_rows: Option<u64>,
    /// Rows per transferred chunk.
    pub effective_chunk_size: usize,
}

/// Remote-safe column name.
pub fn clean_column_name(name: &str) -> String {
    name.replace('/', "\\")
}

/// Map an Arrow column type to a remote column kind. Text widths are left at
/// zero for pass 2 to fill in.
///
/// Only signed integer columns with one of the [`SPECIAL_NAMES`] become
/// entity references.
pub fn coarse_kind(name: &str, data_type: &DataType) -> Result<ColumnKind, SchemaError> {
    let kind = match data_type {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => SPECIAL_NAMES
            .iter()
            .find(|(special, _)| *special == name)
            .map_or(ColumnKind::Int64, |(_, kind)| ColumnKind::EntityRef(*kind)),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => ColumnKind::Int64,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnKind::Float64,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => ColumnKind::Text { max_len: 0 },
        DataType::Boolean => ColumnKind::Bool,
        other => {
            return UnsupportedColumnTypeSnafu {
                column: name,
                data_type: other.clone(),
            }
            .fail();
        }
    };
    Ok(kind)
}

/// Rows per chunk for `column_count` columns.
///
/// Without a request the size targets [`CELLS_PER_CHUNK`] cells per chunk.
/// Either way it is capped at [`MAX_CHUNK_ROWS`].
pub fn effective_chunk_size(requested: Option<usize>, column_count: usize) -> usize {
    let size = requested
        .unwrap_or_else(|| CELLS_PER_CHUNK / column_count.max(1))
        .max(1);
    if size > MAX_CHUNK_ROWS {
        info!("Chunk size reduced from {size} to {MAX_CHUNK_ROWS}");
        MAX_CHUNK_ROWS
    } else {
        size
    }
}

/// Infer the remote schema of `source`.
pub fn infer_schema(
    source: &mut dyn TableSource,
    scan_chunk_size: usize,
    chunk_size: Option<usize>,
) -> Result<InferredSchema, SchemaError> {
    let scan_rows = if source.is_materialized() {
        usize::MAX
    } else {
        scan_chunk_size.max(1)
    };
    let schema = source.schema(scan_rows)?;

    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let kind = coarse_kind(field.name(), field.data_type())?;
        columns.push(ColumnDescriptor::new(clean_column_name(field.name()), kind));
    }

    let effective = effective_chunk_size(chunk_size, columns.len());
    let mut total_rows = source.total_rows();

    let scanned: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !matches!(c.kind, ColumnKind::Float64))
        .map(|(position, _)| position)
        .collect();
    if !scanned.is_empty() {
        let described = source.describe();
        debug!(
            "Scanning {} column(s) of {described} for widths and missing values",
            scanned.len()
        );
        let mut widths = vec![0usize; columns.len()];
        let mut missing = vec![false; columns.len()];
        let mut counted = 0u64;
        for chunk in source.chunks(effective)? {
            let chunk = chunk?;
            counted += chunk.num_rows() as u64;
            for &position in &scanned {
                let array = chunk.column(position);
                missing[position] |= array.null_count() > 0;
                if matches!(columns[position].kind, ColumnKind::Int64 | ColumnKind::EntityRef(_)) {
                    continue;
                }
                let chunk_width = longest_text(array.as_ref()).context(SourceSnafu {
                    source_name: format!("{described} (column {})", schema.field(position).name()),
                })?;
                widths[position] = widths[position].max(chunk_width.unwrap_or(1));
            }
        }

        for &position in &scanned {
            let column = &mut columns[position];
            let width = widths[position].max(1);
            column.kind = match column.kind {
                ColumnKind::Text { .. } => ColumnKind::Text { max_len: width },
                ColumnKind::Int64 | ColumnKind::EntityRef(_) if missing[position] => {
                    info!("Column {} has missing values, storing it as Float64", column.name);
                    ColumnKind::Float64
                }
                ColumnKind::Bool if missing[position] => {
                    info!("Column {} has missing values, storing it as text", column.name);
                    ColumnKind::Text { max_len: width }
                }
                kind => kind,
            };
        }
        total_rows.get_or_insert(counted);
    }

    let text_columns = columns
        .iter()
        .filter(|c| matches!(c.kind, ColumnKind::Text { .. }))
        .map(|c| c.name.clone())
        .collect();
    Ok(InferredSchema {
        columns,
        text_columns,
        total_rows,
        effective_chunk_size: effective,
    })
}

/// Longest value in characters, `None` when every value is missing.
fn longest_text(array: &dyn Array) -> Result<Option<usize>, arrow::error::ArrowError> {
    let casted = cast(array, &DataType::Utf8)?;
    Ok(casted
        .as_string::<i32>()
        .iter()
        .flatten()
        .map(|s| s.chars().count())
        .max())
}
