//! Error types for schema inference and uploads.

use arrow::{datatypes::DataType, error::ArrowError};
use snafu::prelude::*;

use crate::{
    columns::ColumnConvertError,
    entity::{EntityRef, GroupId},
    registration::RegistrationError,
    remote::RemoteError,
    session::SessionError,
};

/// Errors scanning a local source or inferring its remote schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// A column's type has no remote counterpart.
    #[snafu(display("Column {column} has unsupported type {data_type}"))]
    UnsupportedColumnType {
        /// Column name.
        column: String,
        /// Arrow type found in the source.
        data_type: DataType,
    },

    /// Reading the source failed.
    #[snafu(display("Cannot read source {source_name}: {source}"))]
    Source {
        /// Source description.
        source_name: String,
        /// Underlying Arrow (or CSV) error.
        source: ArrowError,
    },

    /// Opening a file-backed source failed.
    #[snafu(display("Cannot open {path}: {source}"))]
    Open {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// A secondary link that could not be created. The table exists and is
/// linked to its primary target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    /// Object that could not be linked.
    pub target: EntityRef,
    /// Reason reported by the server.
    pub message: String,
}

/// Errors from pushing a table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PushError {
    /// Bad arguments. Raised before any remote call.
    #[snafu(display("Invalid upload request: {message}"))]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// A link target does not exist.
    #[snafu(display("{target} not found"))]
    RemoteNotFound {
        /// The missing object.
        target: EntityRef,
    },

    /// Link targets live in different groups.
    #[snafu(display("Link targets span groups {first} and {other} ({target})"))]
    GroupMismatch {
        /// Group of the first target.
        first: GroupId,
        /// Group of the offending target.
        other: GroupId,
        /// The offending target.
        target: EntityRef,
    },

    /// The source's schema could not be inferred.
    #[snafu(display("Schema inference failed: {source}"))]
    Schema {
        /// Underlying inference error.
        source: SchemaError,
    },

    /// A source column could not be converted for transfer (for example a
    /// missing integer value).
    #[snafu(display("Cannot convert chunk at row {row}: {source}"))]
    Convert {
        /// First source row of the chunk.
        row: u64,
        /// Underlying conversion error.
        source: ColumnConvertError,
    },

    /// A remote call failed during transfer.
    #[snafu(display("Remote call failed: {source}"))]
    Remote {
        /// Underlying collaborator error.
        source: RemoteError,
    },

    /// The table was written but linking it to its primary target failed.
    /// The file exists and is unreachable from `target`.
    #[snafu(display("Table file {file_id} was created but could not be linked to {target}: {source}"))]
    PrimaryLink {
        /// Orphaned file id.
        file_id: i64,
        /// Primary target.
        target: EntityRef,
        /// Underlying collaborator error.
        source: RemoteError,
    },

    /// No session could be used.
    #[snafu(display("Session error: {source}"))]
    Session {
        /// Underlying session error.
        #[snafu(source(from(SessionError, Box::new)))]
        source: Box<SessionError>,
    },

    /// Registration of an externally written artifact failed.
    #[snafu(display("Artifact registration failed: {source}"))]
    Registration {
        /// Underlying registration error.
        #[snafu(source(from(RegistrationError, Box::new)))]
        source: Box<RegistrationError>,
    },
}

/// Convenient result alias for push operations.
pub type PushResult<T> = Result<T, PushError>;
