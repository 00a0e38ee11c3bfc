//! In-memory document engine
//!
//! Reference implementation of [`StorageDriver`] with the behaviour the
//! gateway expects from a real document store:
//!
//! - databases exist while they hold at least one collection
//! - inserts create missing collections implicitly
//! - unique indexes are enforced by the engine on every write
//! - document writes under an open transaction are recorded in a per-session
//!   undo log and rolled back on abort; DDL is never transactional
//!
//! Writes are applied eagerly, so concurrent readers observe uncommitted
//! data and there is no write-conflict detection. The state can optionally
//! be persisted to a JSON snapshot file.
//!
//! Fault injection (latency, failing collection names, failing database
//! drops, an unavailable switch) lets tests exercise timeout and
//! compensation paths.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::document::{Document, DocumentId, StoredDocument};
use super::driver::{FindOptions, Session, StorageDriver, UpdateResult};
use super::filter::{Filter, Update};
use crate::error::{Error, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct EngineState {
    databases: BTreeMap<String, DatabaseState>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DatabaseState {
    collections: BTreeMap<String, CollectionState>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CollectionState {
    documents: Vec<StoredDocument>,
    #[serde(default)]
    unique_fields: BTreeSet<String>,
}

impl EngineState {
    fn collection(&self, db: &str, coll: &str) -> Option<&CollectionState> {
        self.databases.get(db)?.collections.get(coll)
    }

    fn collection_mut(&mut self, db: &str, coll: &str) -> Option<&mut CollectionState> {
        self.databases.get_mut(db)?.collections.get_mut(coll)
    }

    fn collection_or_create(&mut self, db: &str, coll: &str) -> &mut CollectionState {
        self.databases
            .entry(db.to_string())
            .or_default()
            .collections
            .entry(coll.to_string())
            .or_default()
    }
}

#[derive(Debug)]
enum UndoEntry {
    Inserted {
        db: String,
        coll: String,
        id: DocumentId,
    },
    Replaced {
        db: String,
        coll: String,
        previous: StoredDocument,
    },
    Deleted {
        db: String,
        coll: String,
        position: usize,
        document: StoredDocument,
    },
}

#[derive(Debug, Default)]
struct SessionState {
    in_transaction: bool,
    undo: Vec<UndoEntry>,
}

#[derive(Debug, Default)]
struct Faults {
    latency: Option<Duration>,
    failing_collections: HashSet<String>,
    fail_drop_database: bool,
    unavailable: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<EngineState>,
    sessions: DashMap<u64, SessionState>,
    next_session: AtomicU64,
    faults: Mutex<Faults>,
    snapshot_path: Option<PathBuf>,
}

/// In-memory document engine.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("snapshot_path", &self.inner.snapshot_path)
            .finish()
    }
}

impl MemoryDriver {
    /// Create an empty, non-persistent engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an engine backed by a JSON snapshot file, loading it when present.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = std::fs::read(&path)
                .map_err(|e| Error::Internal(format!("Failed to read snapshot: {}", e)))?;
            serde_json::from_slice(&bytes)?
        } else {
            EngineState::default()
        };
        info!(path = %path.display(), "Opened in-memory engine");
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                snapshot_path: Some(path),
                ..Default::default()
            }),
        })
    }

    /// Write the current state to the snapshot file, if one is configured.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.inner.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&*self.inner.state.lock())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("Failed to create snapshot dir: {}", e)))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| Error::Internal(format!("Failed to write snapshot: {}", e)))?;
        debug!(path = %path.display(), "Snapshot persisted");
        Ok(())
    }

    // ===== Fault injection =====

    /// Delay every storage call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.faults.lock().latency = latency;
    }

    /// Make `create_collection` fail for this collection name.
    pub fn fail_collection(&self, name: &str) {
        self.inner
            .faults
            .lock()
            .failing_collections
            .insert(name.to_string());
    }

    pub fn fail_drop_database(&self, fail: bool) {
        self.inner.faults.lock().fail_drop_database = fail;
    }

    /// Make every call except abort/end-session fail with `StorageUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    /// Number of documents in a collection, bypassing sessions and faults.
    pub fn document_count(&self, db: &str, coll: &str) -> usize {
        self.inner
            .state
            .lock()
            .collection(db, coll)
            .map_or(0, |c| c.documents.len())
    }

    async fn preflight(&self) -> Result<()> {
        let (latency, unavailable) = {
            let faults = self.inner.faults.lock();
            (faults.latency, faults.unavailable)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unavailable {
            return Err(Error::StorageUnavailable(
                "engine is not accepting requests".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether writes under `session` must be recorded for rollback.
    fn is_transactional(&self, session: Option<&Session>) -> Result<bool> {
        match session {
            None => Ok(false),
            Some(session) => self
                .inner
                .sessions
                .get(&session.id())
                .map(|s| s.in_transaction)
                .ok_or_else(|| Error::Internal(format!("Unknown {}", session))),
        }
    }

    fn record_undo(&self, session: Option<&Session>, entries: Vec<UndoEntry>) {
        if let Some(session) = session {
            if let Some(mut state) = self.inner.sessions.get_mut(&session.id()) {
                if state.in_transaction {
                    state.undo.extend(entries);
                }
            }
        }
    }

    fn rollback(&self, undo: Vec<UndoEntry>) {
        let mut state = self.inner.state.lock();
        for entry in undo.into_iter().rev() {
            match entry {
                UndoEntry::Inserted { db, coll, id } => {
                    if let Some(c) = state.collection_mut(&db, &coll) {
                        c.documents.retain(|d| d.id != id);
                    }
                }
                UndoEntry::Replaced { db, coll, previous } => {
                    if let Some(c) = state.collection_mut(&db, &coll) {
                        if let Some(doc) = c.documents.iter_mut().find(|d| d.id == previous.id) {
                            *doc = previous;
                        }
                    }
                }
                UndoEntry::Deleted {
                    db,
                    coll,
                    position,
                    document,
                } => {
                    if let Some(c) = state.collection_mut(&db, &coll) {
                        let position = position.min(c.documents.len());
                        c.documents.insert(position, document);
                    }
                }
            }
        }
    }
}

/// First non-null value of `field` that occurs more than once.
fn first_duplicate<'a>(bodies: impl Iterator<Item = &'a Document>, field: &str) -> Option<Value> {
    let mut seen = HashSet::new();
    bodies
        .filter_map(|body| body.get(field))
        .filter(|value| !value.is_null())
        .find(|value| !seen.insert(value.to_string()))
        .cloned()
}

fn check_unique<'a>(
    coll_name: &str,
    coll: &CollectionState,
    bodies: impl Iterator<Item = &'a Document> + Clone,
) -> Result<()> {
    for field in &coll.unique_fields {
        if let Some(value) = first_duplicate(bodies.clone(), field) {
            return Err(Error::DuplicateKey {
                index: format!("{}.{}", coll_name, field),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn list_database_names(&self) -> Result<Vec<String>> {
        self.preflight().await?;
        let state = self.inner.state.lock();
        Ok(state
            .databases
            .iter()
            .filter(|(_, db)| !db.collections.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn drop_database(&self, db: &str) -> Result<()> {
        self.preflight().await?;
        if self.inner.faults.lock().fail_drop_database {
            return Err(Error::StorageUnavailable(format!(
                "injected failure dropping database {}",
                db
            )));
        }
        self.inner.state.lock().databases.remove(db);
        debug!(db, "Dropped database");
        Ok(())
    }

    async fn create_collection(&self, db: &str, coll: &str) -> Result<()> {
        self.preflight().await?;
        if self.inner.faults.lock().failing_collections.contains(coll) {
            return Err(Error::Internal(format!(
                "injected failure creating {}.{}",
                db, coll
            )));
        }
        let mut state = self.inner.state.lock();
        let database = state.databases.entry(db.to_string()).or_default();
        if database.collections.contains_key(coll) {
            return Err(Error::NamespaceExists(format!("{}.{}", db, coll)));
        }
        database
            .collections
            .insert(coll.to_string(), CollectionState::default());
        debug!(db, coll, "Created collection");
        Ok(())
    }

    async fn drop_collection(&self, db: &str, coll: &str) -> Result<()> {
        self.preflight().await?;
        let mut state = self.inner.state.lock();
        let database = state
            .databases
            .get_mut(db)
            .ok_or_else(|| Error::NamespaceNotFound(format!("{}.{}", db, coll)))?;
        if database.collections.remove(coll).is_none() {
            return Err(Error::NamespaceNotFound(format!("{}.{}", db, coll)));
        }
        if database.collections.is_empty() {
            state.databases.remove(db);
        }
        debug!(db, coll, "Dropped collection");
        Ok(())
    }

    async fn list_collection_names(&self, db: &str) -> Result<Vec<String>> {
        self.preflight().await?;
        let state = self.inner.state.lock();
        Ok(state
            .databases
            .get(db)
            .map(|d| d.collections.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn ensure_unique_index(&self, db: &str, coll: &str, field: &str) -> Result<()> {
        self.preflight().await?;
        let mut state = self.inner.state.lock();
        let collection = state.collection_or_create(db, coll);
        if collection.unique_fields.contains(field) {
            return Ok(());
        }
        if let Some(value) = first_duplicate(collection.documents.iter().map(|d| &d.body), field) {
            return Err(Error::DuplicateKey {
                index: format!("{}.{}", coll, field),
                value: value.to_string(),
            });
        }
        collection.unique_fields.insert(field.to_string());
        debug!(db, coll, field, "Unique index ensured");
        Ok(())
    }

    async fn insert_one(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        doc: Document,
    ) -> Result<DocumentId> {
        let mut ids = self.insert_many(session, db, coll, vec![doc]).await?;
        ids.pop()
            .ok_or_else(|| Error::Internal("insert returned no id".to_string()))
    }

    async fn insert_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<DocumentId>> {
        self.preflight().await?;
        let transactional = self.is_transactional(session)?;
        let ids: Vec<DocumentId> = {
            let mut state = self.inner.state.lock();
            let collection = state.collection_or_create(db, coll);
            check_unique(
                coll,
                collection,
                collection.documents.iter().map(|d| &d.body).chain(docs.iter()),
            )?;
            docs.into_iter()
                .map(|body| {
                    let id = DocumentId::new();
                    collection.documents.push(StoredDocument::new(id, body));
                    id
                })
                .collect()
        };
        if transactional {
            let undo = ids
                .iter()
                .map(|id| UndoEntry::Inserted {
                    db: db.to_string(),
                    coll: coll.to_string(),
                    id: *id,
                })
                .collect();
            self.record_undo(session, undo);
        }
        Ok(ids)
    }

    async fn find(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<StoredDocument>> {
        self.preflight().await?;
        self.is_transactional(session)?;
        let state = self.inner.state.lock();
        let Some(collection) = state.collection(db, coll) else {
            return Ok(Vec::new());
        };
        let limit = options.limit.map_or(usize::MAX, |l| l as usize);
        Ok(collection
            .documents
            .iter()
            .filter(|d| filter.matches(&d.id, &d.body))
            .skip(options.skip as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_documents(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64> {
        self.preflight().await?;
        self.is_transactional(session)?;
        let state = self.inner.state.lock();
        Ok(state.collection(db, coll).map_or(0, |c| {
            c.documents
                .iter()
                .filter(|d| filter.matches(&d.id, &d.body))
                .count() as u64
        }))
    }

    async fn update_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult> {
        self.preflight().await?;
        let transactional = self.is_transactional(session)?;
        let mut undo = Vec::new();
        let result = {
            let mut state = self.inner.state.lock();
            let Some(collection) = state.collection_mut(db, coll) else {
                return Ok(UpdateResult::default());
            };

            let mut matched_count = 0;
            let mut replacements: HashMap<usize, Document> = HashMap::new();
            for (position, doc) in collection.documents.iter().enumerate() {
                if !filter.matches(&doc.id, &doc.body) {
                    continue;
                }
                matched_count += 1;
                let mut body = doc.body.clone();
                if update.apply(&mut body) {
                    replacements.insert(position, body);
                }
            }

            check_unique(
                coll,
                collection,
                collection
                    .documents
                    .iter()
                    .enumerate()
                    .map(|(i, d)| replacements.get(&i).unwrap_or(&d.body)),
            )?;

            let modified_count = replacements.len() as u64;
            for (position, body) in replacements {
                let doc = &mut collection.documents[position];
                let previous = std::mem::replace(&mut doc.body, body);
                if transactional {
                    undo.push(UndoEntry::Replaced {
                        db: db.to_string(),
                        coll: coll.to_string(),
                        previous: StoredDocument::new(doc.id, previous),
                    });
                }
            }
            UpdateResult {
                matched_count,
                modified_count,
            }
        };
        self.record_undo(session, undo);
        Ok(result)
    }

    async fn delete_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64> {
        self.preflight().await?;
        let transactional = self.is_transactional(session)?;
        let mut undo = Vec::new();
        let deleted = {
            let mut state = self.inner.state.lock();
            let Some(collection) = state.collection_mut(db, coll) else {
                return Ok(0);
            };
            let positions: Vec<usize> = collection
                .documents
                .iter()
                .enumerate()
                .filter(|(_, d)| filter.matches(&d.id, &d.body))
                .map(|(i, _)| i)
                .collect();
            // Highest first so earlier positions stay valid; rollback replays
            // in reverse and restores the original order.
            for &position in positions.iter().rev() {
                let document = collection.documents.remove(position);
                if transactional {
                    undo.push(UndoEntry::Deleted {
                        db: db.to_string(),
                        coll: coll.to_string(),
                        position,
                        document,
                    });
                }
            }
            positions.len() as u64
        };
        self.record_undo(session, undo);
        Ok(deleted)
    }

    async fn start_session(&self) -> Result<Session> {
        self.preflight().await?;
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.sessions.insert(id, SessionState::default());
        Ok(Session::new(id))
    }

    async fn start_transaction(&self, session: &Session) -> Result<()> {
        self.preflight().await?;
        let mut state = self
            .inner
            .sessions
            .get_mut(&session.id())
            .ok_or_else(|| Error::Internal(format!("Unknown {}", session)))?;
        if state.in_transaction {
            return Err(Error::Internal(format!(
                "{} already has an open transaction",
                session
            )));
        }
        state.in_transaction = true;
        state.undo.clear();
        Ok(())
    }

    async fn commit_transaction(&self, session: &Session) -> Result<()> {
        self.preflight().await?;
        let mut state = self
            .inner
            .sessions
            .get_mut(&session.id())
            .ok_or_else(|| Error::Internal(format!("Unknown {}", session)))?;
        if !state.in_transaction {
            return Err(Error::Internal(format!("{} has no open transaction", session)));
        }
        state.in_transaction = false;
        state.undo.clear();
        Ok(())
    }

    async fn abort_transaction(&self, session: &Session) -> Result<()> {
        let undo = {
            let mut state = self
                .inner
                .sessions
                .get_mut(&session.id())
                .ok_or_else(|| Error::Internal(format!("Unknown {}", session)))?;
            state.in_transaction = false;
            std::mem::take(&mut state.undo)
        };
        if !undo.is_empty() {
            debug!(%session, writes = undo.len(), "Rolling back transaction");
        }
        self.rollback(undo);
        Ok(())
    }

    async fn end_session(&self, session: &Session) -> Result<()> {
        if let Some((_, state)) = self.inner.sessions.remove(&session.id()) {
            if state.in_transaction {
                warn!(%session, "Session ended with an open transaction, rolling back");
                self.rollback(state.undo);
            }
        }
        Ok(())
    }
}
