//! Table id to open table handle.

use log::{debug, warn};
use snafu::prelude::*;

use crate::{
    columns::ColumnDescriptor,
    remote::{OriginalFile, RemoteError, ServiceClient},
    table::{
        RemoteTableHandle, TABLE_MIMETYPE, TableId,
        error::{RemoteNotFoundSnafu, RemoteSnafu, TableResult, UnsupportedFormatSnafu},
    },
};

/// Look up the original file behind `id`.
pub(crate) async fn find_file(client: &dyn ServiceClient, id: TableId) -> TableResult<OriginalFile> {
    let file = match id {
        TableId::File(file_id) => client.find_original_file(file_id).await,
        TableId::Annotation(annotation_id) => client.find_annotation_file(annotation_id).await,
    }
    .context(RemoteSnafu)?;
    file.context(RemoteNotFoundSnafu { entity: id.entity() })
}

/// Open the table identified by `id`.
///
/// Annotation ids cost one extra lookup to find the underlying file. The file
/// must carry the table mimetype; other files are rejected without opening
/// anything.
pub async fn resolve(client: &dyn ServiceClient, id: TableId) -> TableResult<RemoteTableHandle> {
    let file = find_file(client, id).await?;
    ensure!(
        file.mimetype.as_deref() == Some(TABLE_MIMETYPE),
        UnsupportedFormatSnafu {
            file_id: file.id,
            mimetype: file.mimetype.clone(),
        }
    );

    let mut table = client.open_table(&file).await.context(RemoteSnafu)?;
    let described = async {
        let rows = table.row_count().await?;
        let headers = table.headers().await?;
        Ok::<_, RemoteError>((rows, headers))
    }
    .await;

    match described {
        Ok((rows, headers)) => {
            debug!("Opened table {} ({rows} rows, {} columns)", file.id, headers.len());
            Ok(RemoteTableHandle::new(table, file, rows, headers))
        }
        Err(source) => {
            // Opened but unusable; release it before reporting.
            if let Err(e) = table.close().await {
                warn!("Failed to close table {} after a failed open: {e}", file.id);
            }
            Err(source).context(RemoteSnafu)
        }
    }
}

/// Ask the server for the table's current column schema.
pub async fn discover_schema(handle: &RemoteTableHandle) -> TableResult<Vec<ColumnDescriptor>> {
    handle.table().headers().await.context(RemoteSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        columns::{ColumnKind, ColumnValues},
        remote::memory::InMemoryService,
        table::TableError,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn seeded() -> (InMemoryService, i64) {
        let service = InMemoryService::new();
        let file_id = service.add_table(
            "measurements",
            vec![ColumnDescriptor::new("x", ColumnKind::Float64)],
            vec![ColumnValues::Float64(vec![0.5, 1.5])],
        );
        (service, file_id)
    }

    #[tokio::test]
    async fn resolves_by_file_and_by_annotation() -> TestResult {
        let (service, file_id) = seeded();
        let annotation_id = service.annotate(file_id);
        let client = service.client("localhost", 4064);

        for id in [TableId::File(file_id), TableId::Annotation(annotation_id)] {
            let handle = resolve(client.as_ref(), id).await?;
            assert_eq!(handle.file().id, file_id);
            assert_eq!(handle.row_count(), 2);
            assert_eq!(discover_schema(&handle).await?, handle.columns().to_vec());
            handle.close().await?;
        }
        let stats = service.stats();
        assert_eq!(stats.tables_opened, stats.tables_closed);
        Ok(())
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let (service, _) = seeded();
        let client = service.client("localhost", 4064);
        let err = resolve(client.as_ref(), TableId::Annotation(999)).await.unwrap_err();
        assert!(matches!(err, TableError::RemoteNotFound { .. }));
    }

    #[tokio::test]
    async fn non_table_files_are_rejected_unopened() {
        let (service, _) = seeded();
        let csv = service.add_raw_file("data.csv", Some("text/csv"), &b"a\n1\n"[..]);
        let client = service.client("localhost", 4064);

        let err = resolve(client.as_ref(), TableId::File(csv)).await.unwrap_err();
        assert!(matches!(err, TableError::UnsupportedFormat { .. }));
        assert_eq!(service.stats().tables_opened, 0);
    }

    #[tokio::test]
    async fn unusable_table_is_released_and_open_error_wins() -> TestResult {
        let (service, file_id) = seeded();
        service.break_table(file_id);
        let client = service.client("localhost", 4064);

        let err = resolve(client.as_ref(), TableId::File(file_id)).await.unwrap_err();
        match err {
            TableError::Remote { source, .. } => {
                assert!(source.to_string().contains("is unreachable"), "{source}");
            }
            other => panic!("unexpected error: {other}"),
        }
        let stats = service.stats();
        assert_eq!(stats.tables_opened, 1);
        assert_eq!(stats.tables_closed, 0);
        Ok(())
    }
}
