use std::io;

use snafu::{Backtrace, prelude::*};

/// Failures writing a local output file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The output file already exists. Nothing was written to it.
    #[snafu(display("Refusing to overwrite existing file: {path}"))]
    TargetExists {
        /// The existing path.
        path: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other I/O failure on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    Io {
        /// The path where the I/O error occurred.
        path: String,
        /// Platform error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// True when the output file already existed.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::TargetExists { .. })
    }
}
