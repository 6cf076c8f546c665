//! Local output files.
//!
//! Downloads and registration artifacts are written to local paths that must
//! not exist beforehand. This module centralizes the existence checks, the
//! create-new open, and the cleanup of partially written files when a
//! transfer fails midway.

mod error;

use std::{
    fs::File as StdFile,
    io,
    path::{Path, PathBuf},
};

use snafu::{IntoError, prelude::*};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

pub use error::StorageError;
use error::{IoSnafu, TargetExistsSnafu};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Fail with [`StorageError::TargetExists`] if `path` exists.
pub async fn ensure_absent(path: &Path) -> StorageResult<()> {
    let exists = fs::try_exists(path).await.context(IoSnafu {
        path: path.display().to_string(),
    })?;
    ensure!(
        !exists,
        TargetExistsSnafu {
            path: path.display().to_string(),
        }
    );
    Ok(())
}

fn open_error(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    if e.kind() == io::ErrorKind::AlreadyExists {
        TargetExistsSnafu { path }.build()
    } else {
        IoSnafu { path }.into_error(e)
    }
}

fn create_parent_dir(path: &Path) -> StorageResult<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent).context(IoSnafu {
            path: parent.display().to_string(),
        }),
        None => Ok(()),
    }
}

/// Create a *new* file at `path` (and its parent directories), failing if the
/// file already exists.
pub async fn create_new(path: &Path) -> StorageResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.context(IoSnafu {
            path: parent.display().to_string(),
        })?;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| open_error(path, e))
}

/// Blocking variant of [`create_new`] for writers that need a `std::fs::File`.
pub fn create_new_blocking(path: &Path) -> StorageResult<StdFile> {
    create_parent_dir(path)?;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| open_error(path, e))
}

/// Append `contents` to an open output file.
pub async fn append(file: &mut File, path: &Path, contents: &[u8]) -> StorageResult<()> {
    file.write_all(contents).await.context(IoSnafu {
        path: path.display().to_string(),
    })
}

/// Flush and sync an output file.
pub async fn finish(file: &mut File, path: &Path) -> StorageResult<()> {
    let path = path.display().to_string();
    file.flush().await.context(IoSnafu { path: &path })?;
    file.sync_all().await.context(IoSnafu { path })
}

/// Removes a partially written output file on drop unless disarmed.
#[derive(Debug)]
pub(crate) struct PartialFileGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialFileGuard {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    /// Keep the file. Call once it is complete.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort; the caller is already reporting the real failure.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
