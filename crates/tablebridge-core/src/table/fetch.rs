//! Paginated reads from an open table.
//!
//! Rows are read one window at a time, strictly in order. Each window's
//! values are appended to per-column buffers and the row numbers the server
//! reports for it are appended to an index buffer. Index-list reads report
//! row numbers even for rows that do not exist, so a short window keeps only
//! the requested rows below the table length before its labels are used.

use std::{path::Path, sync::Arc};

use arrow::{
    array::{ArrayRef, RecordBatch, UInt64Array},
    datatypes::{DataType, Field, Schema},
};
use log::{debug, warn};
use snafu::prelude::*;

use crate::{
    columns::{ChunkData, ColumnDescriptor, ColumnValues},
    progress::ProgressSink,
    remote::{PredicateVariables, RemoteTable},
    storage::{self, PartialFileGuard},
    table::{
        RemoteTableHandle,
        error::{
            ArrowSnafu, ConfigurationSnafu, RemoteSnafu, ShapeMismatchSnafu, StorageSnafu,
            TableError, TableResult, ValuesSnafu,
        },
    },
};

/// Which rows to read.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRequest {
    /// Every row.
    All,
    /// Rows `[start, end)`; `end` is clamped to the table length.
    Range {
        /// First row.
        start: u64,
        /// One past the last row.
        end: u64,
    },
    /// These rows, in this order.
    Rows(Vec<u64>),
    /// Rows matching a server-side predicate, evaluated once up front.
    Predicate {
        /// Condition expression.
        condition: String,
        /// Variables referenced by the condition.
        variables: PredicateVariables,
    },
}

/// A table loaded into memory.
#[derive(Debug, Clone)]
pub struct FetchedTable {
    /// Row number of each row of `batch`.
    pub index: Vec<u64>,
    /// Column values.
    pub batch: RecordBatch,
}

impl FetchedTable {
    /// Number of rows loaded.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }
}

enum Windows {
    Range { next: u64, end: u64 },
    Rows { rows: Vec<u64>, next: usize },
}

struct WindowReader<'a> {
    table: &'a dyn RemoteTable,
    columns: Vec<usize>,
    windows: Windows,
    chunk_size: usize,
    row_count: u64,
}

impl<'a> WindowReader<'a> {
    /// Resolve the projection and the row plan. Predicates are evaluated here.
    async fn open(
        handle: &'a RemoteTableHandle,
        column_names: &[String],
        request: ChunkRequest,
        chunk_size: usize,
    ) -> TableResult<(Self, Vec<ColumnDescriptor>, u64)> {
        ensure!(
            chunk_size > 0,
            ConfigurationSnafu {
                message: "chunk size must be at least 1",
            }
        );
        let (columns, fields) = project(handle, column_names);
        let row_count = handle.row_count();

        let windows = match request {
            ChunkRequest::All => Windows::Range {
                next: 0,
                end: row_count,
            },
            ChunkRequest::Range { start, end } => {
                ensure!(
                    start <= end,
                    ConfigurationSnafu {
                        message: format!("invalid row range {start}..{end}"),
                    }
                );
                Windows::Range {
                    next: start.min(row_count),
                    end: end.min(row_count),
                }
            }
            ChunkRequest::Rows(rows) => Windows::Rows { rows, next: 0 },
            ChunkRequest::Predicate {
                condition,
                variables,
            } => {
                let rows = handle
                    .table()
                    .where_list(&condition, &variables)
                    .await
                    .context(RemoteSnafu)?;
                debug!("Query '{condition}' matched {} row(s)", rows.len());
                Windows::Rows { rows, next: 0 }
            }
        };

        let total = match &windows {
            Windows::Range { next, end } => end - next,
            Windows::Rows { rows, .. } => rows.len() as u64,
        };
        let reader = WindowReader {
            table: handle.table(),
            columns,
            windows,
            chunk_size,
            row_count,
        };
        Ok((reader, fields, total))
    }

    /// Read the next window, `None` once every row has been requested.
    async fn next_chunk(&mut self) -> TableResult<Option<ChunkData>> {
        if self.columns.is_empty() {
            return Ok(None);
        }
        let step = self.chunk_size as u64;
        let mut chunk = match &mut self.windows {
            Windows::Range { next, end } => {
                if *next >= *end {
                    return Ok(None);
                }
                let start = *next;
                let stop = (start + step).min(*end);
                *next = stop;
                self.table.read(&self.columns, start, stop).await
            }
            Windows::Rows { rows, next } => {
                if *next >= rows.len() {
                    return Ok(None);
                }
                let start = *next;
                let stop = (start + self.chunk_size).min(rows.len());
                *next = stop;
                self.table.slice(&self.columns, &rows[start..stop]).await
            }
        }
        .context(RemoteSnafu)?;

        ensure!(
            chunk.columns.len() == self.columns.len(),
            ShapeMismatchSnafu {
                expected: self.columns.len(),
                found: chunk.columns.len(),
            }
        );

        let delivered = chunk.value_count();
        if chunk.row_numbers.len() > delivered {
            let row_count = self.row_count;
            chunk.row_numbers.retain(|&row| row < row_count);
            chunk.row_numbers.truncate(delivered);
        }
        Ok(Some(chunk))
    }
}

/// Map requested names to column positions, in table order. Unknown names
/// are dropped with a single warning.
fn project(handle: &RemoteTableHandle, names: &[String]) -> (Vec<usize>, Vec<ColumnDescriptor>) {
    let columns = handle.columns();
    if names.is_empty() {
        return ((0..columns.len()).collect(), columns.to_vec());
    }

    let (indices, fields): (Vec<usize>, Vec<ColumnDescriptor>) = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| names.contains(&c.name))
        .map(|(i, c)| (i, c.clone()))
        .unzip();

    let mut missing: Vec<&str> = names
        .iter()
        .filter(|n| !columns.iter().any(|c| &c.name == *n))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        missing.dedup();
        warn!(
            "Table {} is missing requested column(s): {}",
            handle.file().id,
            missing.join(", ")
        );
    }
    (indices, fields)
}

fn build_batch(fields: &[ColumnDescriptor], values: Vec<ColumnValues>) -> TableResult<RecordBatch> {
    let schema = Arc::new(Schema::new(
        fields.iter().map(ColumnDescriptor::to_arrow_field).collect::<Vec<_>>(),
    ));
    if fields.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let arrays: Vec<ArrayRef> = values.into_iter().map(ColumnValues::into_array).collect();
    RecordBatch::try_new(schema, arrays).context(ArrowSnafu)
}

/// Read `request` from an open table into memory, `chunk_size` rows per
/// remote call.
///
/// `column_names` selects columns by exact name (all columns when empty);
/// names the table lacks are dropped with a warning. `progress` is advanced
/// by the number of values each window delivers.
pub async fn fetch(
    handle: &RemoteTableHandle,
    column_names: &[String],
    request: ChunkRequest,
    chunk_size: usize,
    progress: &mut dyn ProgressSink,
) -> TableResult<FetchedTable> {
    let (mut reader, fields, total) =
        WindowReader::open(handle, column_names, request, chunk_size).await?;

    progress.start("Downloading table", Some(total));
    let mut buffers: Vec<ColumnValues> =
        fields.iter().map(|f| ColumnValues::empty_for(f.kind)).collect();
    let mut index = Vec::new();

    let result = async {
        while let Some(chunk) = reader.next_chunk().await? {
            let delivered = chunk.value_count();
            for ((buffer, field), column) in buffers.iter_mut().zip(&fields).zip(chunk.columns) {
                buffer.extend_from(&field.name, column.values).context(ValuesSnafu)?;
            }
            index.extend(chunk.row_numbers);
            progress.advance(delivered as u64);
        }
        Ok::<(), TableError>(())
    }
    .await;
    progress.finish();
    result?;

    let rows = buffers.first().map_or(0, ColumnValues::len);
    index.truncate(rows);
    let batch = build_batch(&fields, buffers)?;
    Ok(FetchedTable { index, batch })
}

/// Like [`fetch`], but each window is appended to a new CSV file at `target`
/// instead of being kept in memory.
///
/// The first column holds the row index (with an empty header). A partially
/// written file is removed if the transfer fails. Returns the number of rows
/// written.
pub async fn fetch_to_csv(
    handle: &RemoteTableHandle,
    column_names: &[String],
    request: ChunkRequest,
    chunk_size: usize,
    target: &Path,
    progress: &mut dyn ProgressSink,
) -> TableResult<u64> {
    let (mut reader, fields, total) =
        WindowReader::open(handle, column_names, request, chunk_size).await?;

    let mut file = storage::create_new(target).await.context(StorageSnafu)?;
    let mut guard = PartialFileGuard::new(target);

    let mut arrow_fields = vec![Field::new("", DataType::UInt64, false)];
    arrow_fields.extend(fields.iter().map(ColumnDescriptor::to_arrow_field));
    let schema = Arc::new(Schema::new(arrow_fields));

    progress.start("Downloading table", Some(total));
    let mut written = 0u64;
    let result = async {
        while let Some(chunk) = reader.next_chunk().await? {
            let delivered = chunk.value_count();
            let mut row_numbers = chunk.row_numbers;
            row_numbers.truncate(delivered);

            let mut arrays: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from(row_numbers))];
            arrays.extend(chunk.columns.into_iter().map(|c| c.values.into_array()));
            let batch = RecordBatch::try_new(schema.clone(), arrays).context(ArrowSnafu)?;

            let mut writer = arrow_csv::WriterBuilder::new()
                .with_header(written == 0)
                .build(Vec::new());
            writer.write(&batch).context(ArrowSnafu)?;
            storage::append(&mut file, target, &writer.into_inner())
                .await
                .context(StorageSnafu)?;

            written += delivered as u64;
            progress.advance(delivered as u64);
        }
        storage::finish(&mut file, target).await.context(StorageSnafu)?;
        Ok::<(), TableError>(())
    }
    .await;
    progress.finish();
    result?;

    guard.disarm();
    Ok(written)
}
