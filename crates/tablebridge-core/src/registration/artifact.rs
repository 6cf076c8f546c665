//! Local columnar artifacts for out-of-band registration.

use std::{collections::HashMap, fs::File, path::Path};

use log::debug;
use parquet::{
    arrow::ArrowWriter,
    file::{
        metadata::KeyValue,
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
    },
};
use snafu::prelude::*;

use crate::{
    progress::ProgressSink,
    push::TableSource,
    registration::error::{
        ArtifactSnafu, ArtifactSourceSnafu, ArtifactStorageSnafu, RegistrationResult,
    },
    storage::{self, PartialFileGuard},
};

/// Metadata key holding the artifact format version.
pub const VERSION_KEY: &str = "__version";
/// Metadata key holding the creation time, in Unix seconds.
pub const INITIALIZED_KEY: &str = "__initialized";
/// Metadata key holding the registration secret.
pub const SECRET_TOKEN_KEY: &str = "__secret_token";
/// Artifact format version understood by the server.
pub const ARTIFACT_VERSION: &str = "3";

/// Default rows per artifact write.
pub const DEFAULT_ARTIFACT_CHUNK_ROWS: usize = 1000;

/// Writes a table source to a local artifact file.
pub trait ArtifactWriter: Send + Sync {
    /// Write every row of `source` to a new file at `path`, then embed
    /// `metadata` as file-level key/value metadata. Returns rows written.
    ///
    /// A partially written file is removed on failure.
    fn write_artifact(
        &self,
        source: &mut dyn TableSource,
        path: &Path,
        metadata: &[(String, String)],
        progress: &mut dyn ProgressSink,
    ) -> RegistrationResult<u64>;
}

/// Parquet artifact writer.
#[derive(Debug, Clone)]
pub struct ParquetArtifactWriter {
    chunk_rows: usize,
}

impl Default for ParquetArtifactWriter {
    fn default() -> Self {
        Self::new(DEFAULT_ARTIFACT_CHUNK_ROWS)
    }
}

impl ParquetArtifactWriter {
    /// Writer reading the source `chunk_rows` rows at a time.
    pub fn new(chunk_rows: usize) -> Self {
        Self {
            chunk_rows: chunk_rows.max(1),
        }
    }
}

impl ArtifactWriter for ParquetArtifactWriter {
    fn write_artifact(
        &self,
        source: &mut dyn TableSource,
        path: &Path,
        metadata: &[(String, String)],
        progress: &mut dyn ProgressSink,
    ) -> RegistrationResult<u64> {
        let display = path.display().to_string();
        let schema = source
            .schema(self.chunk_rows)
            .context(ArtifactSourceSnafu)?;

        let file = storage::create_new_blocking(path).context(ArtifactStorageSnafu)?;
        let mut guard = PartialFileGuard::new(path);

        let props = WriterProperties::builder().build();
        let mut writer =
            ArrowWriter::try_new(file, schema, Some(props)).context(ArtifactSnafu { path: &display })?;

        progress.start("Generating artifact", source.total_rows());
        let mut rows = 0u64;
        let written = (|| -> RegistrationResult<()> {
            for chunk in source.chunks(self.chunk_rows).context(ArtifactSourceSnafu)? {
                let batch = chunk.context(ArtifactSourceSnafu)?;
                writer.write(&batch).context(ArtifactSnafu { path: &display })?;
                rows += batch.num_rows() as u64;
                progress.advance(batch.num_rows() as u64);
            }
            Ok(())
        })();
        progress.finish();
        written?;

        debug!("Appending registration metadata to {display}");
        for (key, value) in metadata {
            writer.append_key_value_metadata(KeyValue::new(key.clone(), value.clone()));
        }
        writer.close().context(ArtifactSnafu { path: &display })?;

        guard.disarm();
        Ok(rows)
    }
}

/// File-level key/value metadata of an artifact.
pub fn read_artifact_metadata(path: &Path) -> RegistrationResult<HashMap<String, String>> {
    let display = path.display().to_string();
    let file = File::open(path)
        .map_err(parquet::errors::ParquetError::from)
        .context(ArtifactSnafu { path: &display })?;
    let reader = SerializedFileReader::new(file).context(ArtifactSnafu { path: &display })?;
    let entries = reader
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kv| {
            kv.iter()
                .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::RecordingProgress,
        push::BatchSource,
        registration::RegistrationError,
    };
    use arrow::{
        array::{Int64Array, StringArray},
        record_batch::RecordBatch,
    };
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample() -> Result<RecordBatch, arrow::error::ArrowError> {
        RecordBatch::try_from_iter([
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as _),
            ("name", Arc::new(StringArray::from(vec!["a", "bb", "ccc"])) as _),
        ])
    }

    #[test]
    fn writes_rows_and_metadata() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("table.parquet");
        let mut source = BatchSource::new(sample()?);
        let mut progress = RecordingProgress::default();
        let metadata = vec![(VERSION_KEY.to_string(), ARTIFACT_VERSION.to_string())];

        let rows = ParquetArtifactWriter::new(2).write_artifact(
            &mut source,
            &path,
            &metadata,
            &mut progress,
        )?;
        assert_eq!(rows, 3);
        assert_eq!(progress.updates, vec![2, 1]);
        assert!(progress.finished);

        let stored = read_artifact_metadata(&path)?;
        assert_eq!(stored.get(VERSION_KEY).map(String::as_str), Some("3"));

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
        let total: usize = reader
            .map(|b| b.map(|b| b.num_rows()))
            .sum::<Result<usize, _>>()?;
        assert_eq!(total, 3);
        Ok(())
    }

    #[test]
    fn existing_file_is_not_overwritten() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("table.parquet");
        std::fs::write(&path, b"keep me")?;

        let err = ParquetArtifactWriter::default()
            .write_artifact(
                &mut BatchSource::new(sample()?),
                &path,
                &[],
                &mut RecordingProgress::default(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ArtifactStorage { .. }));
        assert_eq!(std::fs::read(&path)?, b"keep me");
        Ok(())
    }
}
