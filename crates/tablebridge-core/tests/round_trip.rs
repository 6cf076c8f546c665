//! Push then fetch against the in-process service.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use arrow::{
    array::{BooleanArray, Float64Array, Int64Array, StringArray},
    record_batch::RecordBatch,
};
use tablebridge_core::{
    columns::{ColumnKind, ENTITY_KIND_METADATA_KEY},
    entity::{EntityKind, EntityRef, GroupId},
    progress::NoProgress,
    push::{BatchSource, CsvSource, PushOptions, push},
    remote::memory::InMemoryService,
    session::Session,
    table::{ChunkRequest, ReadOptions, TableId, download_table, fetch, read_table, resolve},
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn service() -> InMemoryService {
    let service = InMemoryService::new();
    service.add_entity(EntityRef::image(1), GroupId(0));
    service
}

#[tokio::test]
async fn three_row_table_round_trips() -> TestResult {
    let service = service();
    let session = Session::from_client(service.client("localhost", 4064));
    let batch = RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as _),
        ("name", Arc::new(StringArray::from(vec!["a", "bb", "ccc"])) as _),
    ])?;

    let report = push(
        &session,
        &mut BatchSource::new(batch.clone()),
        "three rows",
        &[EntityRef::image(1)],
        &PushOptions::default(),
        &mut NoProgress,
    )
    .await?;
    assert_eq!(report.columns[1].kind, ColumnKind::Text { max_len: 3 });

    let fetched = read_table(
        &session,
        TableId::Annotation(report.annotation.id),
        &ReadOptions::default(),
        &mut NoProgress,
    )
    .await?;
    assert_eq!(fetched.index, vec![0, 1, 2]);
    assert_eq!(fetched.batch.columns(), batch.columns());
    Ok(())
}

#[tokio::test]
async fn windowed_fetch_matches_single_read() -> TestResult {
    let service = service();
    let client = service.client("localhost", 4064);
    let session = Session::from_client(Arc::clone(&client));
    let rows = 7i64;
    let batch = RecordBatch::try_from_iter([
        ("image", Arc::new(Int64Array::from((0..rows).collect::<Vec<_>>())) as _),
        (
            "area",
            Arc::new(Float64Array::from(
                (0..rows).map(|i| i as f64 * 0.5).collect::<Vec<_>>(),
            )) as _,
        ),
        (
            "ok",
            Arc::new(BooleanArray::from(
                (0..rows).map(|i| i % 2 == 0).collect::<Vec<_>>(),
            )) as _,
        ),
    ])?;
    let report = push(
        &session,
        &mut BatchSource::new(batch),
        "windows",
        &[EntityRef::image(1)],
        &PushOptions::default(),
        &mut NoProgress,
    )
    .await?;

    let handle = resolve(client.as_ref(), TableId::File(report.file_id)).await?;
    let whole = fetch(&handle, &[], ChunkRequest::All, rows as usize, &mut NoProgress).await?;
    assert_eq!(
        whole.batch.schema().field(0).metadata().get(ENTITY_KIND_METADATA_KEY),
        Some(&EntityKind::Image.to_string())
    );
    for chunk_size in 1..=rows as usize {
        let windowed = fetch(&handle, &[], ChunkRequest::All, chunk_size, &mut NoProgress).await?;
        assert_eq!(windowed.index, whole.index, "chunk size {chunk_size}");
        assert_eq!(windowed.batch, whole.batch, "chunk size {chunk_size}");
    }
    handle.close().await?;
    Ok(())
}

#[tokio::test]
async fn csv_upload_downloads_as_csv() -> TestResult {
    let tmp = TempDir::new()?;
    let source_path = tmp.path().join("source.csv");
    std::fs::write(&source_path, "id,label\n10,x\n20,\n30,zzz\n")?;

    let service = service();
    let session = Session::from_client(service.client("localhost", 4064));
    let report = push(
        &session,
        &mut CsvSource::new(&source_path),
        "from csv",
        &[EntityRef::image(1)],
        &PushOptions {
            chunk_size: Some(2),
            ..PushOptions::default()
        },
        &mut NoProgress,
    )
    .await?;
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.columns[1].kind, ColumnKind::Text { max_len: 3 });

    let target = tmp.path().join("copy.csv");
    let written = download_table(
        &session,
        TableId::File(report.file_id),
        &target,
        &ReadOptions::default().chunk_size(2),
        &mut NoProgress,
    )
    .await?;
    assert_eq!(written, 3);
    assert_eq!(
        std::fs::read_to_string(&target)?,
        ",id,label\n0,10,x\n1,20,\n2,30,zzz\n"
    );
    Ok(())
}
