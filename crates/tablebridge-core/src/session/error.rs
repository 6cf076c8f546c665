//! Error types for session management.

use snafu::prelude::*;

use crate::remote::RemoteError;

/// Errors from establishing or using a session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    /// The session was configured inconsistently.
    #[snafu(display("Invalid session configuration: {message}"))]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// Not enough details to attempt a connection, and none could be obtained.
    #[snafu(display("Insufficient details to create a connection: {missing}"))]
    InsufficientCredentials {
        /// What is missing (server, credentials, ...).
        missing: String,
    },

    /// The server refused or failed to create or join the session.
    #[snafu(display("Failed to establish session with {server}: {source}"))]
    SessionEstablishment {
        /// Server that was contacted.
        server: String,
        /// Underlying collaborator error.
        source: RemoteError,
    },

    /// An operation needs a live session but there is none.
    #[snafu(display("Session is not connected"))]
    NotConnected,

    /// A remote call made on behalf of the session failed.
    #[snafu(display("Remote call failed: {source}"))]
    Remote {
        /// Underlying collaborator error.
        source: RemoteError,
    },
}
