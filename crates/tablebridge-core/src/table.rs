//! Reading remote tables.
//!
//! A remote table is stored in an original file whose mimetype marks it as a
//! table, and is usually reached through the file annotation that links it to
//! other objects. Either id can be used ([`TableId`]).
//!
//! - [`resolve`] opens a table and returns an owned [`RemoteTableHandle`].
//! - [`fetch`] / [`fetch_to_csv`] page through an open table.
//! - [`read_table`], [`download_table`], [`table_size`] and [`table_columns`]
//!   wrap the above for a [`Session`]: validate, enter a session scope,
//!   resolve, do the work and close the table on every exit path.

mod error;
mod fetch;
mod resolve;

use std::{fmt, path::Path};

use log::{info, warn};
use snafu::prelude::*;

pub use error::{TableError, TableResult};
pub use fetch::{ChunkRequest, FetchedTable, fetch, fetch_to_csv};
pub use resolve::{discover_schema, resolve};

use crate::{
    columns::ColumnDescriptor,
    entity::EntityRef,
    progress::ProgressSink,
    remote::{OriginalFile, PredicateVariables, RemoteTable},
    session::Session,
    storage,
};
use error::{ConfigurationSnafu, RemoteSnafu, SessionSnafu, StorageSnafu};

/// Mimetype marking an original file as a remote table.
pub const TABLE_MIMETYPE: &str = "OMERO.tables";

/// Default rows per remote read.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Identifies a remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableId {
    /// The original file holding the table.
    File(i64),
    /// A file annotation wrapping the original file.
    Annotation(i64),
}

impl TableId {
    /// Build an id from optional parts; exactly one must be given.
    pub fn from_parts(file_id: Option<i64>, annotation_id: Option<i64>) -> TableResult<Self> {
        match (file_id, annotation_id) {
            (Some(id), None) => Ok(TableId::File(id)),
            (None, Some(id)) => Ok(TableId::Annotation(id)),
            (Some(_), Some(_)) => ConfigurationSnafu {
                message: "supply either a file or an annotation id, not both",
            }
            .fail(),
            (None, None) => ConfigurationSnafu {
                message: "a file or annotation id must be supplied",
            }
            .fail(),
        }
    }

    /// The object this id refers to.
    pub fn entity(self) -> EntityRef {
        match self {
            TableId::File(id) => EntityRef::new(crate::entity::EntityKind::OriginalFile, id),
            TableId::Annotation(id) => EntityRef::file_annotation(id),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity())
    }
}

/// An open remote table.
///
/// Owned by whoever opened it; call [`RemoteTableHandle::close`] exactly
/// once. Dropping an unclosed handle leaks the server-side resource until the
/// session ends, and logs a warning.
pub struct RemoteTableHandle {
    table: Box<dyn RemoteTable>,
    file: OriginalFile,
    row_count: u64,
    columns: Vec<ColumnDescriptor>,
    closed: bool,
}

impl fmt::Debug for RemoteTableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTableHandle")
            .field("file", &self.file)
            .field("row_count", &self.row_count)
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl RemoteTableHandle {
    pub(crate) fn new(
        table: Box<dyn RemoteTable>,
        file: OriginalFile,
        row_count: u64,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            table,
            file,
            row_count,
            columns,
            closed: false,
        }
    }

    /// Rows stored when the table was opened.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Column schema read when the table was opened.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// The backing file.
    pub fn file(&self) -> &OriginalFile {
        &self.file
    }

    pub(crate) fn table(&self) -> &dyn RemoteTable {
        self.table.as_ref()
    }

    /// Release the server-side resource.
    pub async fn close(mut self) -> TableResult<()> {
        self.closed = true;
        self.table.close().await.context(RemoteSnafu)
    }

    /// Close, logging instead of returning a failure. Used on paths that are
    /// already reporting another outcome.
    pub(crate) async fn close_logged(self) {
        let file_id = self.file.id;
        if let Err(e) = self.close().await {
            warn!("Failed to close table {file_id}: {e}");
        }
    }
}

impl Drop for RemoteTableHandle {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Table {} dropped without being closed", self.file.id);
        }
    }
}

/// What to read from a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    /// Columns to load, by exact name. Empty loads all columns.
    pub columns: Vec<String>,
    /// Explicit row indices to load, in order.
    pub rows: Option<Vec<u64>>,
    /// Server-side row predicate; cannot be combined with `rows`.
    pub query: Option<String>,
    /// Variables referenced by `query`.
    pub variables: PredicateVariables,
    /// Rows per remote read.
    pub chunk_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            rows: None,
            query: None,
            variables: PredicateVariables::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ReadOptions {
    /// Load only these columns.
    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = names.into_iter().map(Into::into).collect();
        self
    }

    /// Load only these rows.
    pub fn rows(mut self, rows: impl IntoIterator<Item = u64>) -> Self {
        self.rows = Some(rows.into_iter().collect());
        self
    }

    /// Load only rows matching `condition`.
    pub fn query(mut self, condition: impl Into<String>, variables: PredicateVariables) -> Self {
        self.query = Some(condition.into());
        self.variables = variables;
        self
    }

    /// Rows per remote read.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Check the options and turn them into a [`ChunkRequest`].
    pub fn validate(&self) -> TableResult<ChunkRequest> {
        ensure!(
            self.chunk_size > 0,
            ConfigurationSnafu {
                message: "chunk size must be at least 1",
            }
        );
        match (&self.rows, &self.query) {
            (Some(_), Some(_)) => ConfigurationSnafu {
                message: "a query supersedes explicit rows, supply only one",
            }
            .fail(),
            (Some(rows), None) => Ok(ChunkRequest::Rows(rows.clone())),
            (None, Some(condition)) => Ok(ChunkRequest::Predicate {
                condition: condition.clone(),
                variables: self.variables.clone(),
            }),
            (None, None) => Ok(ChunkRequest::All),
        }
    }
}

/// Load a table, or part of it, into memory.
pub async fn read_table(
    session: &Session,
    id: TableId,
    options: &ReadOptions,
    progress: &mut dyn ProgressSink,
) -> TableResult<FetchedTable> {
    let request = options.validate()?;
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;

    let handle = resolve(client.as_ref(), id).await?;
    info!("Loading table {id} ({} rows stored)", handle.row_count());
    let result = fetch(&handle, &options.columns, request, options.chunk_size, progress).await;
    handle.close_logged().await;
    result
}

/// Stream a table, or part of it, into a new CSV file at `target`.
///
/// The first CSV column holds the row index. Fails before contacting the
/// server if `target` exists. Returns the number of rows written.
pub async fn download_table(
    session: &Session,
    id: TableId,
    target: &Path,
    options: &ReadOptions,
    progress: &mut dyn ProgressSink,
) -> TableResult<u64> {
    let request = options.validate()?;
    storage::ensure_absent(target).await.context(StorageSnafu)?;

    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;

    let handle = resolve(client.as_ref(), id).await?;
    info!("Downloading table {id} to {}", target.display());
    let result = fetch_to_csv(
        &handle,
        &options.columns,
        request,
        options.chunk_size,
        target,
        progress,
    )
    .await;
    handle.close_logged().await;
    if result.is_ok() {
        info!("Download complete, saved to {}", target.display());
    }
    result
}

/// `(rows, columns)` of a remote table.
pub async fn table_size(session: &Session, id: TableId) -> TableResult<(u64, usize)> {
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;
    let handle = resolve(client.as_ref(), id).await?;
    let size = (handle.row_count(), handle.columns().len());
    handle.close().await?;
    Ok(size)
}

/// Column names of a remote table, in order.
pub async fn table_columns(session: &Session, id: TableId) -> TableResult<Vec<String>> {
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;
    let handle = resolve(client.as_ref(), id).await?;
    let names = handle.columns().iter().map(|c| c.name.clone()).collect();
    handle.close().await?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_requires_exactly_one_part() {
        assert_eq!(TableId::from_parts(Some(3), None).unwrap(), TableId::File(3));
        assert_eq!(
            TableId::from_parts(None, Some(4)).unwrap(),
            TableId::Annotation(4)
        );
        assert!(matches!(
            TableId::from_parts(Some(3), Some(4)),
            Err(TableError::Configuration { .. })
        ));
        assert!(matches!(
            TableId::from_parts(None, None),
            Err(TableError::Configuration { .. })
        ));
    }

    #[test]
    fn rows_and_query_are_exclusive() {
        let options = ReadOptions::default()
            .rows([1, 2])
            .query("x > 1", PredicateVariables::new());
        assert!(matches!(
            options.validate(),
            Err(TableError::Configuration { .. })
        ));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let options = ReadOptions::default().chunk_size(0);
        assert!(matches!(
            options.validate(),
            Err(TableError::Configuration { .. })
        ));
    }

    #[test]
    fn default_options_read_everything() {
        assert_eq!(ReadOptions::default().validate().unwrap(), ChunkRequest::All);
    }
}
