use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::backend::{
    Backend, BackendError, ChangeEvent, ChangeKind, Filter, Op, Predicate, Query, Row, Subscription,
};

/// A write or read the backend has seen, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub table: String,
    pub filter: Filter,
    pub row: Option<Row>,
}

/// In-process backend with the same observable behavior as the hosted
/// service: ids are assigned on insert and every write is echoed on the
/// change feed.
pub struct MemoryBackend {
    tables: DashMap<String, Vec<Row>>,
    blobs: DashMap<String, Vec<u8>>,
    events_tx: broadcast::Sender<ChangeEvent>,
    next_id: AtomicI64,
    calls: Option<Mutex<Vec<Call>>>,
    selects_held: watch::Sender<bool>,
    fail_selects: AtomicBool,
    fail_writes: AtomicBool,
    fail_uploads: AtomicBool,
}

impl MemoryBackend {
    pub fn new(event_buffer_size: usize) -> Self {
        Self::build(event_buffer_size, false)
    }

    /// Like [`new`](Self::new), but keeps every call for [`calls`](Self::calls).
    pub fn recording(event_buffer_size: usize) -> Self {
        Self::build(event_buffer_size, true)
    }

    fn build(event_buffer_size: usize, recording: bool) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let (selects_held, _unused_watch) = watch::channel(false);

        Self {
            tables: DashMap::new(),
            blobs: DashMap::new(),
            events_tx,
            next_id: AtomicI64::new(1),
            calls: recording.then(|| Mutex::new(Vec::new())),
            selects_held,
            fail_selects: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
        }
    }

    /// Inserts rows without emitting change events, for seeding state.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut entry = self.tables.entry(table.to_string()).or_default();
        for mut row in rows {
            self.assign_id(&mut row);
            entry.push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.blobs
            .get(&format!("{bucket}/{path}"))
            .map(|blob| blob.value().clone())
    }

    /// Calls seen so far; always empty unless built with [`recording`](Self::recording).
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .as_ref()
            .and_then(|calls| calls.lock().ok().map(|calls| calls.clone()))
            .unwrap_or_default()
    }

    pub fn count_calls(&self, op: &str, table: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.op == op && call.table == table)
            .count()
    }

    /// Parks every subsequent `select` until [`release_selects`](Self::release_selects).
    pub fn hold_selects(&self) {
        self.selects_held.send_replace(true);
    }

    pub fn release_selects(&self) {
        self.selects_held.send_replace(false);
    }

    pub fn fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    fn record(&self, op: &'static str, table: &str, filter: &Filter, row: Option<&Row>) {
        let Some(calls) = &self.calls else {
            return;
        };
        if let Ok(mut calls) = calls.lock() {
            calls.push(Call {
                op,
                table: table.to_string(),
                filter: filter.clone(),
                row: row.cloned(),
            });
        }
    }

    fn assign_id(&self, row: &mut Row) {
        match row.get("id").and_then(Value::as_i64) {
            Some(id) => {
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                row.insert("id".to_string(), Value::from(id));
            }
        }
    }

    fn check_writes(&self) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Request("write rejected by backend".to_string()));
        }
        Ok(())
    }

    fn emit(&self, table: &str, kind: ChangeKind, new: Option<Row>, old: Option<Row>) {
        let _ = self.events_tx.send(ChangeEvent {
            table: table.to_string(),
            kind,
            new,
            old,
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: Query) -> Result<Vec<Row>, BackendError> {
        self.record("select", &query.table, &query.filter, None);

        let mut held = self.selects_held.subscribe();
        held.wait_for(|held| !*held)
            .await
            .map_err(|err| BackendError::Request(format!("backend closed: {err}")))?;

        if self.fail_selects.load(Ordering::SeqCst) {
            return Err(BackendError::Request("query failed".to_string()));
        }

        let mut rows: Vec<Row> = self
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches(&query.filter, row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, descending)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare(a.get(column), b.get(column));
                if *descending { ordering.reverse() } else { ordering }
            });
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        debug!(table = %query.table, rows = rows.len(), "select served");
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, BackendError> {
        self.record("insert", table, &Filter::new(), Some(&row));
        self.check_writes()?;

        self.assign_id(&mut row);
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());

        self.emit(table, ChangeKind::Insert, Some(row.clone()), None);
        Ok(row)
    }

    async fn update(&self, table: &str, filter: Filter, patch: Row) -> Result<Vec<Row>, BackendError> {
        self.record("update", table, &filter, Some(&patch));
        self.check_writes()?;

        let mut changes = Vec::new();
        if let Some(mut rows) = self.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| matches(&filter, row)) {
                let old = row.clone();
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                changes.push((old, row.clone()));
            }
        }

        let mut affected = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            self.emit(table, ChangeKind::Update, Some(new.clone()), Some(old));
            affected.push(new);
        }

        Ok(affected)
    }

    async fn delete(&self, table: &str, filter: Filter) -> Result<Vec<Row>, BackendError> {
        self.record("delete", table, &filter, None);
        self.check_writes()?;

        let mut removed = Vec::new();
        if let Some(mut rows) = self.tables.get_mut(table) {
            let (gone, kept): (Vec<Row>, Vec<Row>) =
                rows.drain(..).partition(|row| matches(&filter, row));
            *rows = kept;
            removed = gone;
        }

        for old in &removed {
            self.emit(table, ChangeKind::Delete, None, Some(old.clone()));
        }

        Ok(removed)
    }

    fn subscribe(&self, table: &str) -> Subscription {
        Subscription::new(table, self.events_tx.subscribe())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        upsert: bool,
    ) -> Result<String, BackendError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackendError::Storage(format!("upload to {bucket} failed")));
        }

        let key = format!("{bucket}/{path}");
        if !upsert && self.blobs.contains_key(&key) {
            return Err(BackendError::Storage(format!("{key} already exists")));
        }

        self.blobs.insert(key, bytes);
        Ok(path.to_string())
    }
}

fn matches(filter: &Filter, row: &Row) -> bool {
    filter.predicates.iter().all(|predicate| holds(predicate, row))
        && filter
            .alternatives
            .iter()
            .all(|group| group.iter().any(|predicate| holds(predicate, row)))
}

fn holds(predicate: &Predicate, row: &Row) -> bool {
    let value = row.get(&predicate.column);
    match &predicate.op {
        Op::Eq(expected) => compare(value, Some(expected)) == CmpOrdering::Equal,
        Op::In(options) => options
            .iter()
            .any(|option| compare(value, Some(option)) == CmpOrdering::Equal),
    }
}

/// Orders missing and null values first, numbers numerically, everything else
/// by its string form.
fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());

    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => text(a).cmp(&text(b)),
        },
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
