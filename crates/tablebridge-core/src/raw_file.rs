//! Plain CSV files attached to the remote service.
//!
//! Not every table lives in the server's table format; some are uploaded as
//! `.csv` or `.csv.gz` files. These helpers read such files in byte chunks,
//! either into a `RecordBatch` or straight to a local file.

use std::{
    io::{Cursor, Read},
    path::Path,
    sync::Arc,
};

use arrow::{compute::concat_batches, error::ArrowError, record_batch::RecordBatch};
use arrow_csv::{ReaderBuilder, reader::Format};
use bytes::Bytes;
use flate2::read::GzDecoder;
use log::{debug, info};
use snafu::prelude::*;

use crate::{
    entity::EntityRef,
    progress::ProgressSink,
    remote::{OriginalFile, RemoteError, ServiceClient},
    session::{Session, SessionError},
    storage::{self, PartialFileGuard, StorageError},
    table::TableId,
};

/// Default bytes per remote read.
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

/// Upper bound on the buffer reserved up front for an in-memory read.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Errors reading attached CSV files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RawFileError {
    /// The referenced file or annotation does not exist.
    #[snafu(display("{entity} not found"))]
    RemoteNotFound {
        /// The missing object.
        entity: EntityRef,
    },

    /// The file is not a CSV or gzipped CSV.
    #[snafu(display("Unsupported file {name} (mimetype {mimetype:?})"))]
    UnsupportedFormat {
        /// File name.
        name: String,
        /// Declared mimetype.
        mimetype: Option<String>,
    },

    /// The server reports no content for the file.
    #[snafu(display("Invalid size for file {file_id}"))]
    InvalidSize {
        /// File id.
        file_id: i64,
    },

    /// Requested columns are not in the file.
    #[snafu(display("Columns not found: {}", names.join(", ")))]
    MissingColumns {
        /// Names that did not match.
        names: Vec<String>,
    },

    /// A remote call failed.
    #[snafu(display("Remote file call failed: {source}"))]
    Remote {
        /// Underlying collaborator error.
        source: RemoteError,
    },

    /// Decompressing the file failed.
    #[snafu(display("Cannot decompress file {file_id}: {source}"))]
    Decompress {
        /// File id.
        file_id: i64,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Parsing the CSV failed.
    #[snafu(display("Cannot parse file {file_id} as CSV: {source}"))]
    Csv {
        /// File id.
        file_id: i64,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Writing the local copy failed.
    #[snafu(display("Download target error: {source}"))]
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

/// Convenient result alias for raw file access.
pub type RawFileResult<T> = Result<T, RawFileError>;

/// Compression of an attached CSV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain text.
    None,
    /// gzip.
    Gzip,
}

/// Work out how a CSV file is stored from its mimetype, or from its name when
/// no mimetype is recorded.
pub fn infer_compression(mimetype: Option<&str>, name: &str) -> RawFileResult<Compression> {
    let unsupported = || RawFileError::UnsupportedFormat {
        name: name.to_string(),
        mimetype: mimetype.map(str::to_string),
    };
    let mimetype = match mimetype {
        Some(m) => m.to_ascii_lowercase(),
        None => {
            let lower = name.to_ascii_lowercase();
            if lower.ends_with(".csv") {
                "text/csv".to_string()
            } else if lower.ends_with(".csv.gz") {
                "application/x-gzip".to_string()
            } else {
                return Err(unsupported());
            }
        }
    };
    match mimetype.as_str() {
        "application/x-gzip" => Ok(Compression::Gzip),
        "text/csv" => Ok(Compression::None),
        _ => Err(unsupported()),
    }
}

async fn find_file(client: &dyn ServiceClient, id: TableId) -> RawFileResult<OriginalFile> {
    let file = match id {
        TableId::File(file_id) => client.find_original_file(file_id).await,
        TableId::Annotation(annotation_id) => client.find_annotation_file(annotation_id).await,
    }
    .context(RemoteSnafu)?;
    file.context(RemoteNotFoundSnafu { entity: id.entity() })
}

/// Sequential reader over a remote file's bytes.
struct ChunkedReader<'a> {
    client: &'a dyn ServiceClient,
    file_id: i64,
    size: u64,
    offset: u64,
    chunk_bytes: usize,
}

impl<'a> ChunkedReader<'a> {
    fn open(client: &'a dyn ServiceClient, file: &OriginalFile, chunk_bytes: usize) -> RawFileResult<Self> {
        let size = file
            .size
            .filter(|s| *s > 0)
            .context(InvalidSizeSnafu { file_id: file.id })?;
        Ok(Self {
            client,
            file_id: file.id,
            size,
            offset: 0,
            chunk_bytes: chunk_bytes.max(1),
        })
    }

    async fn next_chunk(&mut self) -> RawFileResult<Option<Bytes>> {
        if self.offset >= self.size {
            return Ok(None);
        }
        let len = (self.size - self.offset).min(self.chunk_bytes as u64) as usize;
        debug!("Reading {len} bytes from file {} at {}", self.file_id, self.offset);
        let bytes = self
            .client
            .read_file_bytes(self.file_id, self.offset, len)
            .await
            .context(RemoteSnafu)?;
        if bytes.is_empty() {
            // The server ran out before the declared size.
            self.offset = self.size;
            return Ok(None);
        }
        self.offset += bytes.len() as u64;
        Ok(Some(bytes))
    }

    /// Bytes to reserve before reading. The declared size is only trusted up
    /// to [`MAX_PREALLOCATION`]; the buffer grows past that as data arrives.
    fn initial_capacity(&self) -> usize {
        usize::try_from(self.size.min(MAX_PREALLOCATION)).unwrap_or(0)
    }
}

/// Copy an attached file to a new local file at `target`.
///
/// With `check_type`, only CSV and gzipped CSV files are accepted. Fails
/// before contacting the server if `target` exists. Returns bytes written.
pub async fn download_file(
    session: &Session,
    id: TableId,
    target: &Path,
    chunk_bytes: usize,
    check_type: bool,
    progress: &mut dyn ProgressSink,
) -> RawFileResult<u64> {
    storage::ensure_absent(target).await.context(StorageSnafu)?;
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;

    let file = find_file(client.as_ref(), id).await?;
    if check_type {
        infer_compression(file.mimetype.as_deref(), &file.name)?;
    }
    let mut reader = ChunkedReader::open(client.as_ref(), &file, chunk_bytes)?;
    info!(
        "Downloading file {} of mimetype {:?} to {}",
        file.id,
        file.mimetype,
        target.display()
    );

    let mut out = storage::create_new(target).await.context(StorageSnafu)?;
    let mut guard = PartialFileGuard::new(target);
    progress.start("Downloading file", Some(reader.size));
    let copied = async {
        let mut written = 0u64;
        while let Some(chunk) = reader.next_chunk().await? {
            storage::append(&mut out, target, &chunk)
                .await
                .context(StorageSnafu)?;
            written += chunk.len() as u64;
            progress.advance(chunk.len() as u64);
        }
        storage::finish(&mut out, target).await.context(StorageSnafu)?;
        Ok::<_, RawFileError>(written)
    }
    .await;
    progress.finish();

    let written = copied?;
    guard.disarm();
    info!("Download complete, saved to {}", target.display());
    Ok(written)
}

/// Load an attached CSV (optionally gzipped) file into memory.
///
/// `column_names`, when given, selects columns. They keep their file order and
/// any name not in the file is an error.
pub async fn read_csv(
    session: &Session,
    id: TableId,
    column_names: Option<&[String]>,
    chunk_bytes: usize,
    progress: &mut dyn ProgressSink,
) -> RawFileResult<RecordBatch> {
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;

    let file = find_file(client.as_ref(), id).await?;
    let compression = infer_compression(file.mimetype.as_deref(), &file.name)?;
    let mut reader = ChunkedReader::open(client.as_ref(), &file, chunk_bytes)?;
    info!("Reading file {} of mimetype {:?}", file.id, file.mimetype);

    progress.start("Reading CSV", Some(reader.size));
    let fetched = async {
        let mut raw = Vec::with_capacity(reader.initial_capacity());
        while let Some(chunk) = reader.next_chunk().await? {
            raw.extend_from_slice(&chunk);
            progress.advance(chunk.len() as u64);
        }
        Ok::<_, RawFileError>(raw)
    }
    .await;
    progress.finish();
    let raw = fetched?;

    let data = match compression {
        Compression::None => raw,
        Compression::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut decoded)
                .context(DecompressSnafu { file_id: file.id })?;
            decoded
        }
    };
    parse_csv(file.id, data, column_names)
}

fn parse_csv(file_id: i64, data: Vec<u8>, column_names: Option<&[String]>) -> RawFileResult<RecordBatch> {
    let format = Format::default().with_header(true);
    let (schema, _) = format
        .infer_schema(Cursor::new(&data), None)
        .context(CsvSnafu { file_id })?;
    let schema = Arc::new(schema);

    let projection = match column_names {
        Some(names) if !names.is_empty() => {
            let missing: Vec<String> = names
                .iter()
                .filter(|n| schema.index_of(n).is_err())
                .cloned()
                .collect();
            ensure!(missing.is_empty(), MissingColumnsSnafu { names: missing });
            let indices: Vec<usize> = (0..schema.fields().len())
                .filter(|i| names.contains(schema.field(*i).name()))
                .collect();
            Some(indices)
        }
        _ => None,
    };

    let output_schema = match &projection {
        Some(indices) => Arc::new(schema.project(indices).context(CsvSnafu { file_id })?),
        None => Arc::clone(&schema),
    };
    let mut builder = ReaderBuilder::new(schema).with_format(format);
    if let Some(indices) = projection {
        builder = builder.with_projection(indices);
    }
    let batches = builder
        .build(Cursor::new(data))
        .context(CsvSnafu { file_id })?
        .collect::<Result<Vec<_>, _>>()
        .context(CsvSnafu { file_id })?;
    concat_batches(&output_schema, &batches).context(CsvSnafu { file_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{progress::RecordingProgress, remote::memory::InMemoryService};
    use arrow::array::{Array, Int64Array, StringArray};
    use flate2::{Compression as GzLevel, write::GzEncoder};
    use std::io::Write;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const CSV: &str = "id,name,score\n1,a,0.5\n2,bb,1.5\n3,ccc,2.5\n";

    #[test]
    fn compression_from_mimetype_or_name() {
        assert_eq!(infer_compression(Some("text/csv"), "x").unwrap(), Compression::None);
        assert_eq!(
            infer_compression(Some("Application/X-Gzip"), "x").unwrap(),
            Compression::Gzip
        );
        assert_eq!(infer_compression(None, "DATA.CSV").unwrap(), Compression::None);
        assert_eq!(infer_compression(None, "data.csv.gz").unwrap(), Compression::Gzip);
        assert!(matches!(
            infer_compression(None, "data.xlsx"),
            Err(RawFileError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            infer_compression(Some("OMERO.tables"), "data.csv"),
            Err(RawFileError::UnsupportedFormat { .. })
        ));
    }

    #[tokio::test]
    async fn overstated_size_is_not_preallocated() -> TestResult {
        let service = InMemoryService::new();
        let file_id = service.add_raw_file("data.csv", Some("text/csv"), CSV.as_bytes().to_vec());
        let client = service.client("localhost", 4064);
        let file = OriginalFile {
            id: file_id,
            name: "data.csv".to_string(),
            mimetype: Some("text/csv".to_string()),
            size: Some(u64::MAX),
        };

        let mut reader = ChunkedReader::open(client.as_ref(), &file, 16)?;
        assert_eq!(reader.initial_capacity() as u64, MAX_PREALLOCATION);
        let mut raw = Vec::with_capacity(reader.initial_capacity());
        while let Some(chunk) = reader.next_chunk().await? {
            raw.extend_from_slice(&chunk);
        }
        assert_eq!(raw, CSV.as_bytes());

        let small = OriginalFile {
            size: Some(10),
            ..file
        };
        assert_eq!(ChunkedReader::open(client.as_ref(), &small, 16)?.initial_capacity(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn reads_gzipped_csv_with_projection() -> TestResult {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(CSV.as_bytes())?;
        let gz = encoder.finish()?;

        let service = InMemoryService::new();
        let file_id = service.add_raw_file("data.csv.gz", None, gz);
        let session = Session::from_client(service.client("localhost", 4064));
        let mut progress = RecordingProgress::default();

        let columns = vec!["name".to_string(), "id".to_string()];
        let batch = read_csv(&session, TableId::File(file_id), Some(&columns), 7, &mut progress).await?;

        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema().field(0).name(), "id");
        assert_eq!(batch.schema().field(1).name(), "name");
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or("id column should be integers")?;
        assert_eq!(ids.iter().flatten().collect::<Vec<_>>(), vec![1, 2, 3]);
        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or("name column should be text")?;
        assert_eq!(names.value(2), "ccc");
        assert!(progress.updates.iter().all(|n| *n <= 7));
        assert!(progress.finished);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_columns_are_an_error() -> TestResult {
        let service = InMemoryService::new();
        let file_id = service.add_raw_file("data.csv", Some("text/csv"), CSV.as_bytes().to_vec());
        let session = Session::from_client(service.client("localhost", 4064));

        let columns = vec!["nope".to_string()];
        let err = read_csv(
            &session,
            TableId::File(file_id),
            Some(&columns),
            DEFAULT_CHUNK_BYTES,
            &mut RecordingProgress::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RawFileError::MissingColumns { ref names } if names == &columns));
        Ok(())
    }

    #[tokio::test]
    async fn downloads_in_chunks() -> TestResult {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("copy.csv");
        let service = InMemoryService::new();
        let file_id = service.add_raw_file("data.csv", Some("text/csv"), CSV.as_bytes().to_vec());
        let annotation_id = service.annotate(file_id);
        let session = Session::from_client(service.client("localhost", 4064));
        let mut progress = RecordingProgress::default();

        let written = download_file(
            &session,
            TableId::Annotation(annotation_id),
            &target,
            10,
            true,
            &mut progress,
        )
        .await?;
        assert_eq!(written, CSV.len() as u64);
        assert_eq!(std::fs::read_to_string(&target)?, CSV);
        assert_eq!(progress.total, Some(CSV.len() as u64));
        assert_eq!(progress.updates.len(), CSV.len().div_ceil(10));
        Ok(())
    }

    #[tokio::test]
    async fn type_check_can_be_skipped() -> TestResult {
        let tmp = TempDir::new()?;
        let service = InMemoryService::new();
        let file_id = service.add_raw_file("image.tif", Some("image/tiff"), vec![1u8, 2, 3]);
        let session = Session::from_client(service.client("localhost", 4064));

        let checked = download_file(
            &session,
            TableId::File(file_id),
            &tmp.path().join("a.tif"),
            DEFAULT_CHUNK_BYTES,
            true,
            &mut RecordingProgress::default(),
        )
        .await;
        assert!(matches!(checked, Err(RawFileError::UnsupportedFormat { .. })));
        assert!(!tmp.path().join("a.tif").exists());

        let written = download_file(
            &session,
            TableId::File(file_id),
            &tmp.path().join("b.tif"),
            DEFAULT_CHUNK_BYTES,
            false,
            &mut RecordingProgress::default(),
        )
        .await?;
        assert_eq!(written, 3);
        Ok(())
    }

    #[tokio::test]
    async fn existing_target_fails_before_lookup() -> TestResult {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("taken.csv");
        std::fs::write(&target, "x")?;
        let service = InMemoryService::new();
        let session = Session::from_client(service.client("localhost", 4064));

        let err = download_file(
            &session,
            TableId::File(1),
            &target,
            DEFAULT_CHUNK_BYTES,
            true,
            &mut RecordingProgress::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RawFileError::Storage { .. }));
        assert_eq!(service.stats().file_lookups, 0);
        Ok(())
    }
}
