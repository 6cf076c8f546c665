//! In-process implementation of the remote service.
//!
//! [`InMemoryService`] keeps entities, files, tables, annotations and links in
//! a shared, mutex-guarded state and hands out clients and tables that
//! implement the capability traits. It mirrors the observable behavior the
//! engines depend on:
//!
//! - a table's schema can be initialized once and never changed,
//! - text values longer than the declared width are rejected,
//! - index-list reads report every requested row number even when some rows
//!   do not exist (values are only returned for rows that do),
//! - batch linking is all-or-nothing.
//!
//! Call counters ([`CallStats`]) let tests assert on the exact remote traffic.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    columns::{ChunkData, ColumnData, ColumnDescriptor, ColumnKind, ColumnValues},
    entity::{EntityKind, EntityRef, GroupId},
    remote::{
        EntityInfo, OriginalFile, PredicateValue, PredicateVariables, RemoteError, RemoteResult,
        RemoteTable, ServiceClient, ServiceConnector,
    },
    table::TABLE_MIMETYPE,
};

/// Counters of remote calls made against an [`InMemoryService`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Sessions created with username/password.
    pub sessions_created: usize,
    /// Sessions joined by key.
    pub sessions_joined: usize,
    /// Sessions closed.
    pub sessions_closed: usize,
    /// Keep-alive pings received.
    pub keep_alives: usize,
    /// Entity lookups.
    pub entity_lookups: usize,
    /// File lookups (direct or through an annotation).
    pub file_lookups: usize,
    /// Tables opened or created.
    pub tables_opened: usize,
    /// Tables closed.
    pub tables_closed: usize,
    /// Range reads.
    pub reads: usize,
    /// Index-list reads.
    pub slices: usize,
    /// Predicate evaluations.
    pub where_lists: usize,
    /// Appended chunks.
    pub appends: usize,
}

enum FileContent {
    Table(StoredTable),
    Raw(Bytes),
}

struct StoredFile {
    meta: OriginalFile,
    content: FileContent,
}

#[derive(Default)]
struct StoredTable {
    columns: Option<Vec<ColumnDescriptor>>,
    data: Vec<ColumnValues>,
}

impl StoredTable {
    fn row_count(&self) -> u64 {
        self.data.first().map_or(0, |c| c.len() as u64)
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    users: HashMap<String, String>,
    session_keys: HashSet<String>,
    entities: HashMap<EntityRef, GroupId>,
    files: BTreeMap<i64, StoredFile>,
    annotations: BTreeMap<i64, i64>,
    links: Vec<(EntityRef, i64)>,
    failing_links: HashSet<EntityRef>,
    broken_tables: HashSet<i64>,
    fail_keep_alive: bool,
    stats: CallStats,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn table(&self, file_id: i64) -> RemoteResult<&StoredTable> {
        match self.files.get(&file_id).map(|f| &f.content) {
            Some(FileContent::Table(t)) => Ok(t),
            _ => Err(RemoteError::ObjectNotFound {
                kind: EntityKind::OriginalFile,
                id: file_id,
            }),
        }
    }

    fn table_mut(&mut self, file_id: i64) -> RemoteResult<&mut StoredTable> {
        match self.files.get_mut(&file_id).map(|f| &mut f.content) {
            Some(FileContent::Table(t)) => Ok(t),
            _ => Err(RemoteError::ObjectNotFound {
                kind: EntityKind::OriginalFile,
                id: file_id,
            }),
        }
    }

    fn check_link_target(&self, target: EntityRef) -> RemoteResult<()> {
        if !self.entities.contains_key(&target) {
            return Err(RemoteError::ObjectNotFound {
                kind: target.kind,
                id: target.id,
            });
        }
        if self.failing_links.contains(&target) {
            return Err(RemoteError::Rejected {
                message: format!("cannot link to {target}"),
            });
        }
        Ok(())
    }
}

/// Shared in-process service. Cloning yields another handle to the same
/// state.
#[derive(Clone, Default)]
pub struct InMemoryService {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept `username`/`password` logins.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.lock()
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Accept joins with `key`.
    pub fn with_session_key(self, key: &str) -> Self {
        self.lock().session_keys.insert(key.to_string());
        self
    }

    /// Register an object in `group`.
    pub fn add_entity(&self, entity: EntityRef, group: GroupId) {
        self.lock().entities.insert(entity, group);
    }

    /// Store a populated table and return its file id.
    pub fn add_table(&self, name: &str, columns: Vec<ColumnDescriptor>, data: Vec<ColumnValues>) -> i64 {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.files.insert(
            id,
            StoredFile {
                meta: OriginalFile {
                    id,
                    name: name.to_string(),
                    mimetype: Some(TABLE_MIMETYPE.to_string()),
                    size: None,
                },
                content: FileContent::Table(StoredTable {
                    columns: Some(columns),
                    data,
                }),
            },
        );
        id
    }

    /// Store a raw file and return its id.
    pub fn add_raw_file(&self, name: &str, mimetype: Option<&str>, bytes: impl Into<Bytes>) -> i64 {
        let bytes = bytes.into();
        let mut state = self.lock();
        let id = state.allocate_id();
        state.files.insert(
            id,
            StoredFile {
                meta: OriginalFile {
                    id,
                    name: name.to_string(),
                    mimetype: mimetype.map(str::to_string),
                    size: Some(bytes.len() as u64),
                },
                content: FileContent::Raw(bytes),
            },
        );
        id
    }

    /// Wrap an existing file in a file annotation and return the annotation id.
    pub fn annotate(&self, file_id: i64) -> i64 {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.annotations.insert(id, file_id);
        id
    }

    /// Make every link to `target` fail.
    pub fn fail_links_to(&self, target: EntityRef) {
        self.lock().failing_links.insert(target);
    }

    /// Let `file_id` open, then fail every header request and close on it.
    pub fn break_table(&self, file_id: i64) {
        self.lock().broken_tables.insert(file_id);
    }

    /// Make keep-alive pings fail (or succeed again).
    pub fn set_keep_alive_failing(&self, failing: bool) {
        self.lock().fail_keep_alive = failing;
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> CallStats {
        self.lock().stats.clone()
    }

    /// All `(target, annotation id)` links created so far.
    pub fn links(&self) -> Vec<(EntityRef, i64)> {
        self.lock().links.clone()
    }

    /// File wrapped by an annotation.
    pub fn annotation_file(&self, annotation_id: i64) -> Option<i64> {
        self.lock().annotations.get(&annotation_id).copied()
    }

    /// Schema of a stored table.
    pub fn table_schema(&self, file_id: i64) -> Option<Vec<ColumnDescriptor>> {
        self.lock().table(file_id).ok().and_then(|t| t.columns.clone())
    }

    /// Contents of a stored table, one run per column.
    pub fn table_data(&self, file_id: i64) -> Option<Vec<ColumnValues>> {
        self.lock().table(file_id).ok().map(|t| t.data.clone())
    }

    /// A client for a session that was established elsewhere.
    pub fn client(&self, host: &str, port: u16) -> Arc<dyn ServiceClient> {
        let session_id = {
            let mut state = self.lock();
            format!("session-{}", state.allocate_id())
        };
        Arc::new(InMemoryClient {
            service: self.clone(),
            session_id,
            host: host.to_string(),
            port,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ServiceConnector for InMemoryService {
    async fn create_session(
        &self,
        server: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> RemoteResult<Arc<dyn ServiceClient>> {
        {
            let mut state = self.lock();
            if state.users.get(username).map(String::as_str) != Some(password) {
                return Err(RemoteError::Rejected {
                    message: format!("invalid credentials for {username}"),
                });
            }
            state.stats.sessions_created += 1;
        }
        Ok(self.client(server, port))
    }

    async fn join_session(
        &self,
        server: &str,
        port: u16,
        session_key: &str,
    ) -> RemoteResult<Arc<dyn ServiceClient>> {
        {
            let mut state = self.lock();
            if !state.session_keys.contains(session_key) {
                return Err(RemoteError::Rejected {
                    message: "session key is unknown or expired".to_string(),
                });
            }
            state.stats.sessions_joined += 1;
        }
        Ok(self.client(server, port))
    }
}

struct InMemoryClient {
    service: InMemoryService,
    session_id: String,
    host: String,
    port: u16,
    closed: AtomicBool,
}

impl InMemoryClient {
    fn live_state(&self) -> RemoteResult<MutexGuard<'_, MemoryState>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::Transport {
                message: format!("{} is closed", self.session_id),
            });
        }
        Ok(self.service.lock())
    }
}

#[async_trait]
impl ServiceClient for InMemoryClient {
    fn host(&self) -> Option<String> {
        Some(self.host.clone())
    }

    fn port(&self) -> Option<u16> {
        Some(self.port)
    }

    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    async fn keep_alive(&self) -> RemoteResult<()> {
        let mut state = self.live_state()?;
        state.stats.keep_alives += 1;
        if state.fail_keep_alive {
            return Err(RemoteError::Transport {
                message: "keep-alive timed out".to_string(),
            });
        }
        Ok(())
    }

    fn close_session(&self) {
        if !self.closed.swap(true, AtomicOrdering::SeqCst) {
            self.service.lock().stats.sessions_closed += 1;
        }
    }

    async fn find_original_file(&self, file_id: i64) -> RemoteResult<Option<OriginalFile>> {
        let mut state = self.live_state()?;
        state.stats.file_lookups += 1;
        Ok(state.files.get(&file_id).map(|f| f.meta.clone()))
    }

    async fn find_annotation_file(&self, annotation_id: i64) -> RemoteResult<Option<OriginalFile>> {
        let mut state = self.live_state()?;
        state.stats.file_lookups += 1;
        let file = state
            .annotations
            .get(&annotation_id)
            .and_then(|file_id| state.files.get(file_id))
            .map(|f| f.meta.clone());
        Ok(file)
    }

    async fn find_entity(&self, entity: EntityRef) -> RemoteResult<Option<EntityInfo>> {
        let mut state = self.live_state()?;
        state.stats.entity_lookups += 1;
        Ok(state
            .entities
            .get(&entity)
            .map(|group| EntityInfo { entity, group: *group }))
    }

    async fn open_table(&self, file: &OriginalFile) -> RemoteResult<Box<dyn RemoteTable>> {
        let mut state = self.live_state()?;
        state.table(file.id)?;
        state.stats.tables_opened += 1;
        Ok(Box::new(InMemoryTable {
            service: self.service.clone(),
            file_id: file.id,
            closed: false,
        }))
    }

    async fn new_table(&self, _group: GroupId, name: &str) -> RemoteResult<Box<dyn RemoteTable>> {
        let mut state = self.live_state()?;
        let id = state.allocate_id();
        state.files.insert(
            id,
            StoredFile {
                meta: OriginalFile {
                    id,
                    name: name.to_string(),
                    mimetype: Some(TABLE_MIMETYPE.to_string()),
                    size: None,
                },
                content: FileContent::Table(StoredTable::default()),
            },
        );
        state.stats.tables_opened += 1;
        Ok(Box::new(InMemoryTable {
            service: self.service.clone(),
            file_id: id,
            closed: false,
        }))
    }

    async fn create_file_annotation(&self, file_id: i64, _group: GroupId) -> RemoteResult<i64> {
        let mut state = self.live_state()?;
        if !state.files.contains_key(&file_id) {
            return Err(RemoteError::ObjectNotFound {
                kind: EntityKind::OriginalFile,
                id: file_id,
            });
        }
        let id = state.allocate_id();
        state.annotations.insert(id, file_id);
        Ok(id)
    }

    async fn link_annotation(
        &self,
        target: EntityRef,
        annotation_id: i64,
        _group: GroupId,
    ) -> RemoteResult<()> {
        let mut state = self.live_state()?;
        state.check_link_target(target)?;
        state.links.push((target, annotation_id));
        Ok(())
    }

    async fn link_annotations(
        &self,
        targets: &[EntityRef],
        annotation_id: i64,
        _group: GroupId,
    ) -> RemoteResult<()> {
        let mut state = self.live_state()?;
        for target in targets {
            state.check_link_target(*target)?;
        }
        state
            .links
            .extend(targets.iter().map(|t| (*t, annotation_id)));
        Ok(())
    }

    async fn read_file_bytes(&self, file_id: i64, offset: u64, len: usize) -> RemoteResult<Bytes> {
        let state = self.live_state()?;
        match state.files.get(&file_id).map(|f| &f.content) {
            Some(FileContent::Raw(bytes)) => {
                let start = (offset as usize).min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes.slice(start..end))
            }
            _ => Err(RemoteError::ObjectNotFound {
                kind: EntityKind::OriginalFile,
                id: file_id,
            }),
        }
    }
}

struct InMemoryTable {
    service: InMemoryService,
    file_id: i64,
    closed: bool,
}

impl InMemoryTable {
    fn state(&self) -> RemoteResult<MutexGuard<'_, MemoryState>> {
        if self.closed {
            return Err(RemoteError::Rejected {
                message: format!("table {} is closed", self.file_id),
            });
        }
        Ok(self.service.lock())
    }

    fn unreachable(&self) -> RemoteError {
        RemoteError::Transport {
            message: format!("table {} is unreachable", self.file_id),
        }
    }
}

fn project(
    table: &StoredTable,
    columns: &[usize],
    rows: impl Iterator<Item = u64> + Clone,
) -> RemoteResult<Vec<ColumnData>> {
    let schema = table.columns.as_deref().unwrap_or_default();
    columns
        .iter()
        .map(|&idx| {
            let (desc, values) = schema.get(idx).zip(table.data.get(idx)).ok_or_else(|| {
                RemoteError::Rejected {
                    message: format!("column index {idx} out of range"),
                }
            })?;
            Ok(ColumnData::new(desc.name.clone(), take_rows(values, rows.clone())))
        })
        .collect()
}

fn take_rows(values: &ColumnValues, rows: impl Iterator<Item = u64>) -> ColumnValues {
    let rows: Vec<usize> = rows.map(|r| r as usize).filter(|&r| r < values.len()).collect();
    match values {
        ColumnValues::Int64(v) => ColumnValues::Int64(rows.iter().map(|&r| v[r]).collect()),
        ColumnValues::Float64(v) => ColumnValues::Float64(rows.iter().map(|&r| v[r]).collect()),
        ColumnValues::Text(v) => ColumnValues::Text(rows.iter().map(|&r| v[r].clone()).collect()),
        ColumnValues::Bool(v) => ColumnValues::Bool(rows.iter().map(|&r| v[r]).collect()),
    }
}

fn same_type(kind: ColumnKind, values: &ColumnValues) -> bool {
    std::mem::discriminant(&ColumnValues::empty_for(kind)) == std::mem::discriminant(values)
}

#[async_trait]
impl RemoteTable for InMemoryTable {
    async fn row_count(&self) -> RemoteResult<u64> {
        let state = self.state()?;
        Ok(state.table(self.file_id)?.row_count())
    }

    async fn headers(&self) -> RemoteResult<Vec<ColumnDescriptor>> {
        let state = self.state()?;
        if state.broken_tables.contains(&self.file_id) {
            return Err(self.unreachable());
        }
        Ok(state.table(self.file_id)?.columns.clone().unwrap_or_default())
    }

    async fn read(&self, columns: &[usize], start: u64, end: u64) -> RemoteResult<ChunkData> {
        let mut state = self.state()?;
        state.stats.reads += 1;
        let table = state.table(self.file_id)?;
        let end = end.min(table.row_count());
        let start = start.min(end);
        Ok(ChunkData {
            columns: project(table, columns, start..end)?,
            row_numbers: (start..end).collect(),
        })
    }

    async fn slice(&self, columns: &[usize], rows: &[u64]) -> RemoteResult<ChunkData> {
        let mut state = self.state()?;
        state.stats.slices += 1;
        let table = state.table(self.file_id)?;
        Ok(ChunkData {
            columns: project(table, columns, rows.iter().copied())?,
            row_numbers: rows.to_vec(),
        })
    }

    async fn where_list(
        &self,
        condition: &str,
        variables: &PredicateVariables,
    ) -> RemoteResult<Vec<u64>> {
        let mut state = self.state()?;
        state.stats.where_lists += 1;
        let table = state.table(self.file_id)?;
        let clauses = parse_condition(condition, variables)?;
        let schema = table.columns.as_deref().unwrap_or_default();

        let mut resolved = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let idx = schema
                .iter()
                .position(|c| c.name == clause.column)
                .ok_or_else(|| RemoteError::Rejected {
                    message: format!("unknown column '{}' in condition", clause.column),
                })?;
            resolved.push((idx, clause));
        }

        let matches = (0..table.row_count())
            .filter(|&row| {
                resolved
                    .iter()
                    .all(|(idx, clause)| clause.matches(&table.data[*idx], row as usize))
            })
            .collect();
        Ok(matches)
    }

    async fn initialize(&mut self, columns: &[ColumnDescriptor]) -> RemoteResult<()> {
        let file_id = self.file_id;
        let mut state = self.state()?;
        let table = state.table_mut(file_id)?;
        if table.columns.is_some() {
            return Err(RemoteError::Rejected {
                message: format!("table {file_id} is already initialized"),
            });
        }
        table.data = columns.iter().map(|c| ColumnValues::empty_for(c.kind)).collect();
        table.columns = Some(columns.to_vec());
        Ok(())
    }

    async fn add_data(&mut self, columns: &[ColumnData]) -> RemoteResult<()> {
        let file_id = self.file_id;
        let mut state = self.state()?;
        state.stats.appends += 1;
        let table = state.table_mut(file_id)?;
        let schema = table.columns.clone().ok_or_else(|| RemoteError::Rejected {
            message: format!("table {file_id} is not initialized"),
        })?;
        if schema.len() != columns.len() {
            return Err(RemoteError::Rejected {
                message: format!("expected {} columns, got {}", schema.len(), columns.len()),
            });
        }
        let rows = columns.first().map_or(0, |c| c.values.len());
        for (desc, col) in schema.iter().zip(columns) {
            if !same_type(desc.kind, &col.values) || col.values.len() != rows {
                return Err(RemoteError::Rejected {
                    message: format!("column {} does not match {}", col.name, desc.kind),
                });
            }
            if let (ColumnKind::Text { max_len }, ColumnValues::Text(values)) = (desc.kind, &col.values)
                && let Some(long) = values.iter().find(|v| v.chars().count() > max_len)
            {
                return Err(RemoteError::Rejected {
                    message: format!("value '{long}' exceeds width {max_len} of {}", desc.name),
                });
            }
        }
        for (buffer, col) in table.data.iter_mut().zip(columns) {
            buffer
                .extend_from(&col.name, col.values.clone())
                .map_err(|e| RemoteError::Rejected { message: e.to_string() })?;
        }
        Ok(())
    }

    async fn original_file_id(&self) -> RemoteResult<i64> {
        Ok(self.file_id)
    }

    async fn close(&mut self) -> RemoteResult<()> {
        if self.closed {
            return Err(RemoteError::Rejected {
                message: format!("table {} closed twice", self.file_id),
            });
        }
        let mut state = self.service.lock();
        if state.broken_tables.contains(&self.file_id) {
            return Err(RemoteError::Transport {
                message: format!("table {} did not acknowledge close", self.file_id),
            });
        }
        self.closed = true;
        state.stats.tables_closed += 1;
        Ok(())
    }
}

// ---- predicate evaluation ----

const OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

struct Clause {
    column: String,
    op: &'static str,
    value: PredicateValue,
}

impl Clause {
    fn matches(&self, values: &ColumnValues, row: usize) -> bool {
        let ordering = match (values, &self.value) {
            (ColumnValues::Int64(v), PredicateValue::Int(x)) => v[row].partial_cmp(x),
            (ColumnValues::Int64(v), PredicateValue::Float(x)) => (v[row] as f64).partial_cmp(x),
            (ColumnValues::Float64(v), PredicateValue::Float(x)) => v[row].partial_cmp(x),
            (ColumnValues::Float64(v), PredicateValue::Int(x)) => v[row].partial_cmp(&(*x as f64)),
            (ColumnValues::Text(v), PredicateValue::Text(x)) => Some(v[row].as_str().cmp(x.as_str())),
            (ColumnValues::Bool(v), PredicateValue::Bool(x)) => Some(v[row].cmp(x)),
            _ => None,
        };
        let Some(ordering) = ordering else {
            return false;
        };
        match self.op {
            "==" => ordering == Ordering::Equal,
            "!=" => ordering != Ordering::Equal,
            "<=" => ordering != Ordering::Greater,
            ">=" => ordering != Ordering::Less,
            "<" => ordering == Ordering::Less,
            _ => ordering == Ordering::Greater,
        }
    }
}

fn parse_condition(condition: &str, variables: &PredicateVariables) -> RemoteResult<Vec<Clause>> {
    condition
        .split('&')
        .map(|part| parse_clause(part, variables))
        .collect()
}

fn parse_clause(part: &str, variables: &PredicateVariables) -> RemoteResult<Clause> {
    let text = part.trim().trim_start_matches('(').trim_end_matches(')').trim();
    let (pos, op) = OPERATORS
        .iter()
        .filter_map(|op| text.find(op).map(|pos| (pos, *op)))
        .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
        .ok_or_else(|| RemoteError::Rejected {
            message: format!("unsupported condition '{part}'"),
        })?;
    let column = text[..pos].trim().to_string();
    let operand = text[pos + op.len()..].trim();
    Ok(Clause {
        column,
        op,
        value: parse_operand(operand, variables)?,
    })
}

fn parse_operand(operand: &str, variables: &PredicateVariables) -> RemoteResult<PredicateValue> {
    let quoted = operand
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| operand.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(text) = quoted {
        return Ok(PredicateValue::Text(text.to_string()));
    }
    match operand {
        "True" | "true" => return Ok(PredicateValue::Bool(true)),
        "False" | "false" => return Ok(PredicateValue::Bool(false)),
        _ => {}
    }
    if let Ok(v) = operand.parse::<i64>() {
        return Ok(PredicateValue::Int(v));
    }
    if let Ok(v) = operand.parse::<f64>() {
        return Ok(PredicateValue::Float(v));
    }
    variables
        .get(operand)
        .cloned()
        .ok_or_else(|| RemoteError::Rejected {
            message: format!("undefined variable '{operand}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers_table(service: &InMemoryService) -> i64 {
        service.add_table(
            "numbers",
            vec![
                ColumnDescriptor::new("x", ColumnKind::Int64),
                ColumnDescriptor::new("label", ColumnKind::Text { max_len: 5 }),
            ],
            vec![
                ColumnValues::Int64(vec![1, 5, 9, 12]),
                ColumnValues::Text(vec!["a".into(), "b".into(), "a".into(), "c".into()]),
            ],
        )
    }

    async fn open(service: &InMemoryService, file_id: i64) -> Box<dyn RemoteTable> {
        let client = service.client("localhost", 4064);
        let file = client.find_original_file(file_id).await.unwrap().unwrap();
        client.open_table(&file).await.unwrap()
    }

    #[tokio::test]
    async fn where_list_supports_variables_and_conjunctions() {
        let service = InMemoryService::new();
        let file_id = numbers_table(&service);
        let table = open(&service, file_id).await;

        let vars = PredicateVariables::from([("low".to_string(), PredicateValue::Int(4))]);
        let rows = table.where_list("(x > low) & (label == 'a')", &vars).await.unwrap();
        assert_eq!(rows, vec![2]);

        let rows = table.where_list("x<=5", &PredicateVariables::new()).await.unwrap();
        assert_eq!(rows, vec![0, 1]);
    }

    #[tokio::test]
    async fn slice_reports_missing_rows_without_values() {
        let service = InMemoryService::new();
        let file_id = numbers_table(&service);
        let table = open(&service, file_id).await;

        let chunk = table.slice(&[0], &[3, 40, 1]).await.unwrap();
        assert_eq!(chunk.row_numbers, vec![3, 40, 1]);
        assert_eq!(chunk.columns[0].values, ColumnValues::Int64(vec![12, 5]));
    }

    #[tokio::test]
    async fn schema_cannot_be_initialized_twice() {
        let service = InMemoryService::new();
        let client = service.client("localhost", 4064);
        let mut table = client.new_table(GroupId(1), "t").await.unwrap();
        let cols = vec![ColumnDescriptor::new("x", ColumnKind::Int64)];
        table.initialize(&cols).await.unwrap();
        assert!(matches!(
            table.initialize(&cols).await,
            Err(RemoteError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn over_wide_text_is_rejected() {
        let service = InMemoryService::new();
        let client = service.client("localhost", 4064);
        let mut table = client.new_table(GroupId(1), "t").await.unwrap();
        table
            .initialize(&[ColumnDescriptor::new("s", ColumnKind::Text { max_len: 2 })])
            .await
            .unwrap();
        let err = table
            .add_data(&[ColumnData::new("s", ColumnValues::Text(vec!["abc".into()]))])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { .. }));
    }

    #[tokio::test]
    async fn closed_client_refuses_calls() {
        let service = InMemoryService::new();
        let client = service.client("localhost", 4064);
        client.close_session();
        client.close_session();
        assert!(client.keep_alive().await.is_err());
        assert_eq!(service.stats().sessions_closed, 1);
    }
}
