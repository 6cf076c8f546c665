//! Uploading local tables.
//!
//! [`push`] creates a new remote table from a [`TableSource`]:
//!
//! - every link target is checked before the source is touched,
//! - the schema is inferred in two passes ([`infer_schema`]), since text
//!   widths are fixed when the table is created,
//! - rows are streamed in chunks, in source order,
//! - the new file is wrapped in an annotation and linked to the targets.
//!
//! [`upload_table`] is the session-level entry point; it also routes requests
//! that name an artifact path to [`crate::registration`].

mod error;
mod infer;
mod source;

use std::collections::HashSet;

use log::{debug, info, warn};
use snafu::prelude::*;

pub use error::{LinkFailure, PushError, PushResult, SchemaError};
pub use infer::{
    CELLS_PER_CHUNK, InferredSchema, MAX_CHUNK_ROWS, SPECIAL_NAMES, clean_column_name, coarse_kind,
    effective_chunk_size, infer_schema,
};
pub use source::{BatchSource, ChunkIter, CsvSource, TableSource};

use crate::{
    columns::{ColumnData, ColumnDescriptor, ColumnValues},
    config::TransferConfig,
    entity::{EntityRef, GroupId},
    progress::ProgressSink,
    registration::{
        ArtifactLocation, ParquetArtifactWriter, RegistrationRequest, RegistrationTransport,
        register_remote_artifact,
    },
    remote::{RemoteTable, ServiceClient},
    session::Session,
};
use error::{
    ConfigurationSnafu, ConvertSnafu, GroupMismatchSnafu, PrimaryLinkSnafu, RegistrationSnafu,
    RemoteNotFoundSnafu, RemoteSnafu, SchemaSnafu, SessionSnafu,
};

/// Tuning for a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    /// Rows per transferred chunk; derived from the column count when unset.
    pub chunk_size: Option<usize>,
    /// Records scanned to infer column types of streaming sources.
    pub scan_chunk_size: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            scan_chunk_size: 1000,
        }
    }
}

impl From<&TransferConfig> for PushOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.push_chunk_rows,
            scan_chunk_size: config.scan_chunk_rows,
        }
    }
}

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushReport {
    /// File annotation wrapping the new table.
    pub annotation: EntityRef,
    /// Original file holding the new table.
    pub file_id: i64,
    /// Rows transferred.
    pub rows_written: u64,
    /// Schema of the new table.
    pub columns: Vec<ColumnDescriptor>,
    /// Secondary targets that could not be linked.
    pub link_failures: Vec<LinkFailure>,
}

/// Check a table name and its link targets without touching the source.
///
/// Returns the de-duplicated targets, in order, and their shared group.
async fn preflight(
    client: &dyn ServiceClient,
    table_name: &str,
    targets: &[EntityRef],
) -> PushResult<(Vec<EntityRef>, GroupId)> {
    ensure!(
        !table_name.trim().is_empty(),
        ConfigurationSnafu {
            message: format!("invalid table name: {table_name:?}"),
        }
    );
    ensure!(
        !targets.is_empty(),
        ConfigurationSnafu {
            message: "no objects to link the table to",
        }
    );
    if let Some(bad) = targets.iter().find(|t| !t.kind.is_linkable()) {
        return ConfigurationSnafu {
            message: format!("{} cannot be linked to a table", bad.kind),
        }
        .fail();
    }

    let mut seen = HashSet::new();
    let unique: Vec<EntityRef> = targets.iter().copied().filter(|t| seen.insert(*t)).collect();

    let mut group: Option<GroupId> = None;
    for target in &unique {
        let info = client
            .find_entity(*target)
            .await
            .context(RemoteSnafu)?
            .context(RemoteNotFoundSnafu { target: *target })?;
        match group {
            None => group = Some(info.group),
            Some(first) => ensure!(
                first == info.group,
                GroupMismatchSnafu {
                    first,
                    other: info.group,
                    target: *target,
                }
            ),
        }
    }
    let group = group.context(ConfigurationSnafu {
        message: "no objects to link the table to",
    })?;
    Ok((unique, group))
}

fn check_options(options: &PushOptions) -> PushResult<()> {
    ensure!(
        options.chunk_size != Some(0),
        ConfigurationSnafu {
            message: "chunk size must be at least 1",
        }
    );
    Ok(())
}

/// Stream every chunk of `source` into an initialized `table`.
async fn transfer(
    table: &mut dyn RemoteTable,
    source: &mut dyn TableSource,
    columns: &[ColumnDescriptor],
    chunk_size: usize,
    progress: &mut dyn ProgressSink,
) -> PushResult<u64> {
    table.initialize(columns).await.context(RemoteSnafu)?;

    let mut written = 0u64;
    let mut warned_names = false;
    let chunks = source.chunks(chunk_size).context(SchemaSnafu)?;
    for chunk in chunks {
        let batch = chunk.context(SchemaSnafu)?;
        let mut data = Vec::with_capacity(columns.len());
        for (position, descriptor) in columns.iter().enumerate() {
            let field_name = batch.schema_ref().field(position).name().clone();
            if !warned_names && clean_column_name(&field_name) != descriptor.name {
                warn!(
                    "Source column {field_name:?} is being written to remote column {:?}",
                    descriptor.name
                );
                warned_names = true;
            }
            let values = ColumnValues::from_array(
                &descriptor.name,
                descriptor.kind,
                batch.column(position).as_ref(),
            )
            .context(ConvertSnafu { row: written })?;
            data.push(ColumnData::new(descriptor.name.clone(), values));
        }
        table.add_data(&data).await.context(RemoteSnafu)?;
        written += batch.num_rows() as u64;
        progress.advance(batch.num_rows() as u64);
    }
    Ok(written)
}

/// Create a remote table from `source` and link it to `targets`.
///
/// The first target is the primary one: failing to link it is an error that
/// names the orphaned file. Links to the remaining targets are best effort and
/// reported in [`PushReport::link_failures`].
pub async fn push(
    session: &Session,
    source: &mut dyn TableSource,
    table_name: &str,
    targets: &[EntityRef],
    options: &PushOptions,
    progress: &mut dyn ProgressSink,
) -> PushResult<PushReport> {
    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;
    push_with_client(client.as_ref(), source, table_name, targets, options, progress).await
}

/// [`push`] against an already established client.
pub async fn push_with_client(
    client: &dyn ServiceClient,
    source: &mut dyn TableSource,
    table_name: &str,
    targets: &[EntityRef],
    options: &PushOptions,
    progress: &mut dyn ProgressSink,
) -> PushResult<PushReport> {
    check_options(options)?;
    let (targets, group) = preflight(client, table_name, targets).await?;

    let inferred = infer_schema(source, options.scan_chunk_size, options.chunk_size)
        .context(SchemaSnafu)?;
    ensure!(
        !inferred.columns.is_empty(),
        ConfigurationSnafu {
            message: format!("{} has no columns", source.describe()),
        }
    );
    debug!(
        "Inferred {} columns for {table_name}, {} rows per chunk",
        inferred.columns.len(),
        inferred.effective_chunk_size
    );

    let mut table = client.new_table(group, table_name).await.context(RemoteSnafu)?;
    progress.start("Uploading table", inferred.total_rows);
    let outcome = async {
        let rows = transfer(
            table.as_mut(),
            source,
            &inferred.columns,
            inferred.effective_chunk_size,
            progress,
        )
        .await?;
        let file_id = table.original_file_id().await.context(RemoteSnafu)?;
        Ok::<_, PushError>((rows, file_id))
    }
    .await;
    progress.finish();

    let closed = table.close().await;
    let (rows_written, file_id) = match (outcome, closed) {
        (Ok(done), Ok(())) => done,
        (Ok(_), Err(e)) => return Err(e).context(RemoteSnafu),
        (Err(e), closed) => {
            if let Err(close_error) = closed {
                warn!("Failed to close table {table_name}: {close_error}");
            }
            return Err(e);
        }
    };
    info!("Table creation complete ({rows_written} rows), linking to targets");

    let (&primary, rest) = targets.split_first().context(ConfigurationSnafu {
        message: "no objects to link the table to",
    })?;
    let annotation_id = client
        .create_file_annotation(file_id, group)
        .await
        .context(PrimaryLinkSnafu {
            file_id,
            target: primary,
        })?;
    client
        .link_annotation(primary, annotation_id, group)
        .await
        .context(PrimaryLinkSnafu {
            file_id,
            target: primary,
        })?;

    let mut link_failures = Vec::new();
    if !rest.is_empty()
        && let Err(e) = client.link_annotations(rest, annotation_id, group).await
    {
        for target in rest {
            warn!("Failed to link table {file_id} to {target}: {e}");
            link_failures.push(LinkFailure {
                target: *target,
                message: e.to_string(),
            });
        }
    }

    info!("Finished creating table {table_name} under {primary}");
    Ok(PushReport {
        annotation: EntityRef::file_annotation(annotation_id),
        file_id,
        rows_written,
        columns: inferred.columns,
        link_failures,
    })
}

/// A session-level upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Name of the new table.
    pub table_name: String,
    /// Objects to link the table to. The first is the primary target.
    pub targets: Vec<EntityRef>,
    /// Appended to `targets` unless already present.
    pub parent: Option<EntityRef>,
    /// Push tuning.
    pub options: PushOptions,
    /// When set, write an artifact and register it instead of pushing.
    pub artifact: ArtifactLocation,
}

impl UploadRequest {
    /// Upload `table_name` and link it to `targets`.
    pub fn new(table_name: impl Into<String>, targets: impl IntoIterator<Item = EntityRef>) -> Self {
        Self {
            table_name: table_name.into(),
            targets: targets.into_iter().collect(),
            ..Self::default()
        }
    }

    /// All link targets, parent last.
    pub fn all_targets(&self) -> Vec<EntityRef> {
        let mut targets = self.targets.clone();
        if let Some(parent) = self.parent.filter(|p| !targets.contains(p)) {
            targets.push(parent);
        }
        targets
    }
}

/// How an upload was stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Uploaded {
    /// Streamed into a new remote table.
    Pushed(PushReport),
    /// Written as an artifact and registered.
    Registered(EntityRef),
}

impl Uploaded {
    /// File annotation wrapping the new table.
    pub fn annotation(&self) -> EntityRef {
        match self {
            Uploaded::Pushed(report) => report.annotation,
            Uploaded::Registered(annotation) => *annotation,
        }
    }
}

/// Upload `source` as a new table.
///
/// Pushes through the session unless the request names an artifact path, in
/// which case the table is written locally and registered over `transport`.
pub async fn upload_table(
    session: &Session,
    source: &mut dyn TableSource,
    request: &UploadRequest,
    transport: &dyn RegistrationTransport,
    progress: &mut dyn ProgressSink,
) -> PushResult<Uploaded> {
    check_options(&request.options)?;
    let targets = request.all_targets();
    ensure!(
        !targets.is_empty(),
        ConfigurationSnafu {
            message: "no objects to link the table to",
        }
    );

    if request.artifact.is_set() {
        let registration = RegistrationRequest {
            table_name: request.table_name.clone(),
            targets,
            location: request.artifact.clone(),
        };
        let writer = ParquetArtifactWriter::new(
            request
                .options
                .chunk_size
                .unwrap_or(crate::registration::DEFAULT_ARTIFACT_CHUNK_ROWS),
        );
        let annotation =
            register_remote_artifact(&registration, session, source, &writer, transport, progress)
                .await
                .context(RegistrationSnafu)?;
        return Ok(Uploaded::Registered(annotation));
    }

    let report = push(
        session,
        source,
        &request.table_name,
        &targets,
        &request.options,
        progress,
    )
    .await?;
    Ok(Uploaded::Pushed(report))
}
