//! Error types for artifact registration.

use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{push::SchemaError, session::SessionError, storage::StorageError};

/// Errors writing or registering an externally stored artifact.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistrationError {
    /// Bad arguments. Raised before any file is written.
    #[snafu(display("Invalid registration request: {message}"))]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// The local artifact path is taken.
    #[snafu(display("Artifact file {path} already exists"))]
    ArtifactAlreadyExists {
        /// Local write path.
        path: String,
    },

    /// Creating the artifact file failed.
    #[snafu(display("Cannot create artifact: {source}"))]
    ArtifactStorage {
        /// Underlying storage error.
        #[snafu(source(from(StorageError, Box::new)))]
        source: Box<StorageError>,
    },

    /// Encoding the artifact failed.
    #[snafu(display("Cannot write artifact {path}: {source}"))]
    Artifact {
        /// Local write path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Reading the source failed while writing the artifact.
    #[snafu(display("Cannot read source for artifact: {source}"))]
    ArtifactSource {
        /// Underlying source error.
        source: SchemaError,
    },

    /// The HTTP exchange failed before a response was received.
    #[snafu(display("Request to {url} failed: {message}"))]
    Network {
        /// Request URL.
        url: String,
        /// Transport-level reason.
        message: String,
    },

    /// The server refused the token request or the registration.
    #[snafu(display("Registration rejected ({status}): {message}"))]
    RegistrationRejected {
        /// HTTP status.
        status: u16,
        /// Message from the server, or derived from the status.
        message: String,
    },

    /// A 2xx response did not have the expected shape.
    #[snafu(display("Unexpected response from {url}: {message}"))]
    MalformedResponse {
        /// Request URL.
        url: String,
        /// What was missing or invalid.
        message: String,
    },

    /// No session could be used.
    #[snafu(display("Session error: {source}"))]
    Session {
        /// Underlying session error.
        #[snafu(source(from(SessionError, Box::new)))]
        source: Box<SessionError>,
    },
}

/// Convenient result alias for registration.
pub type RegistrationResult<T> = Result<T, RegistrationError>;
