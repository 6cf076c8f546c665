//! Error types and SNAFU context selectors for the `table` module.

use arrow::error::ArrowError;
use snafu::prelude::*;

use crate::{
    columns::ColumnConvertError, entity::EntityRef, remote::RemoteError,
    session::SessionError, storage::StorageError,
};

/// Errors from resolving, reading or downloading remote tables.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Bad or conflicting arguments. Raised before any remote call.
    #[snafu(display("Invalid table request: {message}"))]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// The referenced file or annotation does not exist.
    #[snafu(display("{entity} not found"))]
    RemoteNotFound {
        /// The missing object.
        entity: EntityRef,
    },

    /// The file exists but is not a remote table.
    #[snafu(display("File {file_id} is not a table (mimetype {mimetype:?})"))]
    UnsupportedFormat {
        /// File id.
        file_id: i64,
        /// Declared mimetype.
        mimetype: Option<String>,
    },

    /// A remote call failed.
    #[snafu(display("Remote table call failed: {source}"))]
    Remote {
        /// Underlying collaborator error.
        source: RemoteError,
    },

    /// The server returned values that do not fit the table schema.
    #[snafu(display("Unexpected values from server: {source}"))]
    Values {
        /// Underlying conversion error.
        source: ColumnConvertError,
    },

    /// A read returned a different number of columns than requested.
    #[snafu(display("Server returned {found} column(s), expected {expected}"))]
    ShapeMismatch {
        /// Columns requested.
        expected: usize,
        /// Columns returned.
        found: usize,
    },

    /// Assembling or encoding Arrow data failed.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Writing the local download target failed.
    #[snafu(display("Cannot write download target: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// No session could be used.
    #[snafu(display("Session error: {source}"))]
    Session {
        /// Underlying session error.
        #[snafu(source(from(SessionError, Box::new)))]
        source: Box<SessionError>,
    },
}

/// Convenient result alias for table operations.
pub type TableResult<T> = Result<T, TableError>;
