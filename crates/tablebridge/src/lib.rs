//! # tablebridge
//!
//! Move tables between a remote, paginated tabular service and Apache Arrow.
//!
//! This crate is the supported public entry point and provides a small, stable surface:
//!
//! - [`Session`]: connect, keep alive and clean up.
//! - [`read_table`] / [`download_table`]: fetch a remote table into a
//!   `RecordBatch` or a CSV file.
//! - [`upload_table`]: push a local table, or register it as a Parquet
//!   artifact.
//! - [`read_csv`] / [`download_file`]: plain CSV files attached to the
//!   service.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tablebridge::prelude::*;
//!
//! let session = Session::builder().server("omero.example.org").login("user", "pass").build();
//! session.connect(false, true).await?;
//! let table = read_table(&session, TableId::Annotation(42), &ReadOptions::default(), &mut NoProgress).await?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Remote service capability traits and the in-process implementation.
pub mod remote {
    pub use tablebridge_core::remote::memory::{CallStats, InMemoryService};
    pub use tablebridge_core::remote::{
        EntityInfo, OriginalFile, PredicateValue, PredicateVariables, RemoteError, RemoteResult,
        RemoteTable, ServiceClient, ServiceConnector,
    };
}

/// Artifact registration namespace.
pub mod registration {
    pub use tablebridge_core::registration::{
        ArtifactLocation, ArtifactWriter, HttpReply, ParquetArtifactWriter, RegistrationError,
        RegistrationRequest, RegistrationToken, RegistrationTransport, ReqwestTransport,
        read_artifact_metadata, register_remote_artifact,
    };
}

pub use tablebridge_core::columns::{ColumnDescriptor, ColumnKind};
pub use tablebridge_core::config::{ConfigError, ConnectionConfig, TransferConfig};
pub use tablebridge_core::entity::{EntityKind, EntityRef, GroupId, ParseEntityError};
pub use tablebridge_core::progress::{LogProgress, NoProgress, ProgressSink};
pub use tablebridge_core::push::{
    BatchSource, CsvSource, LinkFailure, PushError, PushOptions, PushReport, SchemaError,
    TableSource, UploadRequest, Uploaded, push, upload_table,
};
pub use tablebridge_core::raw_file::{Compression, RawFileError, download_file, read_csv};
pub use tablebridge_core::session::{
    CredentialPrompter, Credentials, PromptOutcome, Session, SessionBuilder, SessionError,
    SessionState, TokenSource, UserTokenFile, cleanup_sessions,
};
pub use tablebridge_core::table::{
    FetchedTable, ReadOptions, TableError, TableId, download_table, read_table, table_columns,
    table_size,
};
