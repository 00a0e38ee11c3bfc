//! Storage driver trait and the timeout-enforcing `Storage` handle

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::document::{Document, DocumentId, StoredDocument};
use super::filter::{Filter, Update};
use crate::error::{Error, Result};

/// Client session handle.
///
/// Writes issued with a session whose transaction is open are undone when
/// the transaction aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session(u64);

impl Session {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Skip/limit for `find`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn page(skip: u64, limit: u64) -> Self {
        Self {
            skip,
            limit: Some(limit),
        }
    }
}

/// Outcome of `update_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Minimal document-engine surface the gateway relies on.
///
/// Collection and database DDL is not transactional. Document writes are
/// transactional when issued with a session whose transaction is open.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    // ===== Databases =====

    /// Names of physical databases holding at least one collection.
    async fn list_database_names(&self) -> Result<Vec<String>>;

    /// Drops a physical database and everything in it. Dropping a missing
    /// database is a no-op.
    async fn drop_database(&self, db: &str) -> Result<()>;

    // ===== Collections =====

    /// Fails with `NamespaceExists` when the collection is already present.
    async fn create_collection(&self, db: &str, coll: &str) -> Result<()>;

    /// Fails with `NamespaceNotFound` when the collection is absent.
    async fn drop_collection(&self, db: &str, coll: &str) -> Result<()>;

    async fn list_collection_names(&self, db: &str) -> Result<Vec<String>>;

    /// Enforces uniqueness of `field` across the collection, creating the
    /// collection when needed. Idempotent.
    async fn ensure_unique_index(&self, db: &str, coll: &str, field: &str) -> Result<()>;

    // ===== Documents =====

    async fn insert_one(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        doc: Document,
    ) -> Result<DocumentId>;

    /// Inserts in order; ids are returned in input order.
    async fn insert_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<DocumentId>>;

    /// Matches in insertion order.
    async fn find(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<StoredDocument>>;

    async fn count_documents(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64>;

    async fn update_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult>;

    async fn delete_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64>;

    // ===== Sessions =====

    async fn start_session(&self) -> Result<Session>;
    async fn start_transaction(&self, session: &Session) -> Result<()>;
    async fn commit_transaction(&self, session: &Session) -> Result<()>;
    async fn abort_transaction(&self, session: &Session) -> Result<()>;
    async fn end_session(&self, session: &Session) -> Result<()>;
}

/// Shared storage handle.
///
/// Every call is bounded by the configured timeout; an elapsed timer
/// surfaces as `StorageTimeout`. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn StorageDriver>,
    timeout: Duration,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Storage {
    pub fn new(driver: Arc<dyn StorageDriver>, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn timed<T>(&self, op: &'static str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Storage call timed out");
                Err(Error::StorageTimeout(format!(
                    "{} did not complete within {:?}",
                    op, self.timeout
                )))
            }
        }
    }

    pub async fn list_database_names(&self) -> Result<Vec<String>> {
        self.timed("list_database_names", self.driver.list_database_names())
            .await
    }

    pub async fn drop_database(&self, db: &str) -> Result<()> {
        self.timed("drop_database", self.driver.drop_database(db)).await
    }

    pub async fn create_collection(&self, db: &str, coll: &str) -> Result<()> {
        self.timed("create_collection", self.driver.create_collection(db, coll))
            .await
    }

    pub async fn drop_collection(&self, db: &str, coll: &str) -> Result<()> {
        self.timed("drop_collection", self.driver.drop_collection(db, coll))
            .await
    }

    pub async fn list_collection_names(&self, db: &str) -> Result<Vec<String>> {
        self.timed("list_collection_names", self.driver.list_collection_names(db))
            .await
    }

    pub async fn ensure_unique_index(&self, db: &str, coll: &str, field: &str) -> Result<()> {
        self.timed(
            "ensure_unique_index",
            self.driver.ensure_unique_index(db, coll, field),
        )
        .await
    }

    pub async fn insert_one(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        doc: Document,
    ) -> Result<DocumentId> {
        self.timed("insert_one", self.driver.insert_one(session, db, coll, doc))
            .await
    }

    pub async fn insert_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<DocumentId>> {
        self.timed("insert_many", self.driver.insert_many(session, db, coll, docs))
            .await
    }

    pub async fn find(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Vec<StoredDocument>> {
        self.timed("find", self.driver.find(session, db, coll, filter, options))
            .await
    }

    pub async fn count_documents(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64> {
        self.timed(
            "count_documents",
            self.driver.count_documents(session, db, coll, filter),
        )
        .await
    }

    pub async fn update_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateResult> {
        self.timed(
            "update_many",
            self.driver.update_many(session, db, coll, filter, update),
        )
        .await
    }

    pub async fn delete_many(
        &self,
        session: Option<&Session>,
        db: &str,
        coll: &str,
        filter: &Filter,
    ) -> Result<u64> {
        self.timed("delete_many", self.driver.delete_many(session, db, coll, filter))
            .await
    }

    /// Starts a session and opens a transaction on it.
    pub async fn begin(&self) -> Result<Transaction> {
        let session = self.timed("start_session", self.driver.start_session()).await?;
        if let Err(e) = self
            .timed("start_transaction", self.driver.start_transaction(&session))
            .await
        {
            self.end_session_quietly(&session).await;
            return Err(e);
        }
        debug!(%session, "Transaction started");
        Ok(Transaction {
            storage: self.clone(),
            session,
        })
    }

    async fn end_session_quietly(&self, session: &Session) {
        if let Err(e) = self.timed("end_session", self.driver.end_session(session)).await {
            warn!(%session, error = %e, "Failed to end session");
        }
    }
}

/// An open transaction. Must be finished with [`commit`](Self::commit) or
/// [`abort`](Self::abort).
#[derive(Debug)]
pub struct Transaction {
    storage: Storage,
    session: Session,
}

impl Transaction {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Commits; a failed commit is aborted before the error is returned.
    pub async fn commit(self) -> Result<()> {
        let storage = &self.storage;
        let result = storage
            .timed(
                "commit_transaction",
                storage.driver.commit_transaction(&self.session),
            )
            .await;
        if let Err(e) = &result {
            warn!(session = %self.session, error = %e, "Commit failed, aborting");
            if let Err(abort_err) = storage
                .timed(
                    "abort_transaction",
                    storage.driver.abort_transaction(&self.session),
                )
                .await
            {
                warn!(session = %self.session, error = %abort_err, "Abort after failed commit failed");
            }
        } else {
            debug!(session = %self.session, "Transaction committed");
        }
        storage.end_session_quietly(&self.session).await;
        result
    }

    pub async fn abort(self) -> Result<()> {
        let storage = &self.storage;
        let result = storage
            .timed(
                "abort_transaction",
                storage.driver.abort_transaction(&self.session),
            )
            .await;
        storage.end_session_quietly(&self.session).await;
        debug!(session = %self.session, ok = result.is_ok(), "Transaction aborted");
        result
    }
}
