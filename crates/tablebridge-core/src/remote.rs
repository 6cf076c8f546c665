//! Capability interface onto the remote table service.
//!
//! The wire protocol is not part of this crate. Instead, the operations the
//! engines need are enumerated as three object-safe async traits:
//!
//! - [`ServiceConnector`] establishes authenticated sessions.
//! - [`ServiceClient`] is one live session: entity lookups, linking, raw file
//!   access and table open/create.
//! - [`RemoteTable`] is one open table resource: paginated reads, schema
//!   initialization, appends and close.
//!
//! [`memory`] provides an in-process implementation of all three.

pub mod memory;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;

use crate::{
    columns::{ChunkData, ColumnData, ColumnDescriptor},
    entity::{EntityKind, EntityRef, GroupId},
};

/// Result alias for collaborator calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by the remote service collaborator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RemoteError {
    /// The referenced object does not exist or is not visible.
    #[snafu(display("{kind} {id} not found"))]
    ObjectNotFound {
        /// Object kind.
        kind: EntityKind,
        /// Object id.
        id: i64,
    },

    /// The server refused the call (permissions, invalid state, bad input).
    #[snafu(display("Server rejected request: {message}"))]
    Rejected {
        /// Server supplied reason.
        message: String,
    },

    /// The call did not complete (connection dropped, timeout, ...).
    #[snafu(display("Transport failure: {message}"))]
    Transport {
        /// Description of the failure.
        message: String,
    },
}

/// Metadata of a file stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalFile {
    /// File id.
    pub id: i64,
    /// File name.
    pub name: String,
    /// Declared content type, if any.
    pub mimetype: Option<String>,
    /// Size in bytes, if known.
    pub size: Option<u64>,
}

/// A resolved remote object together with its consistency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInfo {
    /// The object.
    pub entity: EntityRef,
    /// Group owning the object.
    pub group: GroupId,
}

/// Value bound to a variable of a server-side row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateValue {
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Text(String),
    /// Boolean literal.
    Bool(bool),
}

impl fmt::Display for PredicateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredicateValue::Int(v) => write!(f, "{v}"),
            PredicateValue::Float(v) => write!(f, "{v}"),
            PredicateValue::Text(v) => write!(f, "'{v}'"),
            PredicateValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Variables referenced by a predicate condition.
pub type PredicateVariables = BTreeMap<String, PredicateValue>;

/// Establishes sessions against a server.
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Log in with a username and password, creating a new session.
    async fn create_session(
        &self,
        server: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> RemoteResult<Arc<dyn ServiceClient>>;

    /// Join an existing session by key.
    async fn join_session(
        &self,
        server: &str,
        port: u16,
        session_key: &str,
    ) -> RemoteResult<Arc<dyn ServiceClient>>;
}

/// A live, authenticated session.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Host this client is connected to, if known.
    fn host(&self) -> Option<String>;

    /// Port this client is connected to, if known.
    fn port(&self) -> Option<u16>;

    /// Server-side session identifier.
    fn session_id(&self) -> String;

    /// Ping the server so the session does not time out.
    async fn keep_alive(&self) -> RemoteResult<()>;

    /// Close the server-side session. Best effort and idempotent.
    fn close_session(&self);

    /// Look up an original file by id.
    async fn find_original_file(&self, file_id: i64) -> RemoteResult<Option<OriginalFile>>;

    /// Look up the original file wrapped by a file annotation.
    async fn find_annotation_file(&self, annotation_id: i64) -> RemoteResult<Option<OriginalFile>>;

    /// Look up an object and the group it belongs to.
    async fn find_entity(&self, entity: EntityRef) -> RemoteResult<Option<EntityInfo>>;

    /// Open an existing table stored in `file`.
    async fn open_table(&self, file: &OriginalFile) -> RemoteResult<Box<dyn RemoteTable>>;

    /// Create a new, uninitialized table in `group`.
    async fn new_table(&self, group: GroupId, name: &str) -> RemoteResult<Box<dyn RemoteTable>>;

    /// Create a file annotation wrapping `file_id`, returning its id.
    async fn create_file_annotation(&self, file_id: i64, group: GroupId) -> RemoteResult<i64>;

    /// Link an annotation to one object.
    async fn link_annotation(
        &self,
        target: EntityRef,
        annotation_id: i64,
        group: GroupId,
    ) -> RemoteResult<()>;

    /// Link an annotation to several objects in one call.
    async fn link_annotations(
        &self,
        targets: &[EntityRef],
        annotation_id: i64,
        group: GroupId,
    ) -> RemoteResult<()>;

    /// Read up to `len` bytes of a raw file starting at `offset`.
    async fn read_file_bytes(&self, file_id: i64, offset: u64, len: usize) -> RemoteResult<Bytes>;
}

/// An open remote table. Owned by whoever opened it; close exactly once.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Number of rows currently stored.
    async fn row_count(&self) -> RemoteResult<u64>;

    /// Ordered column schema.
    async fn headers(&self) -> RemoteResult<Vec<ColumnDescriptor>>;

    /// Read rows `[start, end)` of the given columns.
    async fn read(&self, columns: &[usize], start: u64, end: u64) -> RemoteResult<ChunkData>;

    /// Read an explicit, ordered list of rows of the given columns.
    async fn slice(&self, columns: &[usize], rows: &[u64]) -> RemoteResult<ChunkData>;

    /// Evaluate a predicate server-side and return matching row indices.
    async fn where_list(
        &self,
        condition: &str,
        variables: &PredicateVariables,
    ) -> RemoteResult<Vec<u64>>;

    /// Fix the schema of a new table. Must precede the first append.
    async fn initialize(&mut self, columns: &[ColumnDescriptor]) -> RemoteResult<()>;

    /// Append one chunk; columns are matched to the schema by position.
    async fn add_data(&mut self, columns: &[ColumnData]) -> RemoteResult<()>;

    /// Id of the file backing this table.
    async fn original_file_id(&self) -> RemoteResult<i64>;

    /// Release the server-side resource.
    async fn close(&mut self) -> RemoteResult<()>;
}
