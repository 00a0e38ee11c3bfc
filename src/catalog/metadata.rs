//! Metadata service: the only reader and writer of catalog records.
//!
//! Mutations are read-modify-write cycles on a single record guarded by the
//! record's `revision`: the write only lands if the stored revision is the
//! one that was read, and is retried a bounded number of times otherwise.
//! Uniqueness of `database_name` is enforced by a unique index in the
//! catalog collection, not by the existence check in [`MetadataService::create`].

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::cache::{CacheStats, CatalogCache, LruCatalogCache, NoCache};
use super::validate::{validate_identifier, validate_unique};
use super::{CatalogRecord, CollectionDef, FieldDef};
use crate::config::{CatalogConfig, GatewayConfig, PaginationConfig};
use crate::error::{Error, Result};
use crate::metrics::CATALOG_CAS_RETRY;
use crate::page::{Page, PageRequest};
use crate::storage::{DocumentId, Filter, FindOptions, Session, Storage, Update};

/// Where catalog records are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLocation {
    pub database: String,
    pub collection: String,
}

impl CatalogLocation {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl From<&CatalogConfig> for CatalogLocation {
    fn from(config: &CatalogConfig) -> Self {
        Self::new(config.database.clone(), config.collection.clone())
    }
}

impl Default for CatalogLocation {
    fn default() -> Self {
        Self::from(&CatalogConfig::default())
    }
}

/// Single source of truth for "does this database exist" and "what does
/// this collection declare".
#[derive(Clone)]
pub struct MetadataService {
    storage: Storage,
    cache: Arc<dyn CatalogCache>,
    location: CatalogLocation,
    cas_retries: u32,
    pagination: PaginationConfig,
}

impl std::fmt::Debug for MetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataService")
            .field("location", &self.location)
            .field("cas_retries", &self.cas_retries)
            .finish()
    }
}

impl MetadataService {
    /// Uncached service with default retry and pagination settings.
    pub fn new(storage: Storage, location: CatalogLocation) -> Self {
        Self {
            storage,
            cache: Arc::new(NoCache),
            location,
            cas_retries: CatalogConfig::default().cas_retries,
            pagination: PaginationConfig::default(),
        }
    }

    pub fn from_config(storage: Storage, config: &GatewayConfig) -> Self {
        let catalog = &config.catalog;
        let cache: Arc<dyn CatalogCache> = if catalog.cache_capacity == 0 {
            Arc::new(NoCache)
        } else {
            Arc::new(LruCatalogCache::new(
                catalog.cache_capacity,
                catalog.cache_ttl(),
            ))
        };
        Self::new(storage, CatalogLocation::from(catalog))
            .with_cache(cache)
            .with_cas_retries(catalog.cas_retries)
            .with_pagination(config.pagination.clone())
    }

    pub fn with_cache(mut self, cache: Arc<dyn CatalogCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cas_retries(mut self, retries: u32) -> Self {
        self.cas_retries = retries;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn location(&self) -> &CatalogLocation {
        &self.location
    }

    pub fn pagination(&self) -> &PaginationConfig {
        &self.pagination
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Checks a normalized database name. Besides the identifier rules, the
    /// physical database holding the catalog itself is reserved.
    pub fn check_database_name(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        if name.eq_ignore_ascii_case(&self.location.database) {
            return Err(Error::InvalidName(format!(
                "'{}' is reserved for the catalog",
                name
            )));
        }
        Ok(())
    }

    /// Creates the unique index on `database_name`. Idempotent; call once
    /// at startup before serving requests.
    pub async fn init(&self) -> Result<()> {
        self.storage
            .ensure_unique_index(
                &self.location.database,
                &self.location.collection,
                "database_name",
            )
            .await?;
        info!(
            database = %self.location.database,
            collection = %self.location.collection,
            "Catalog store ready"
        );
        Ok(())
    }

    // ===== Reads =====

    /// Whether a logical database with this name is registered. Names are
    /// compared after lowercasing.
    pub async fn exists(&self, database_name: &str) -> Result<bool> {
        let name = normalize_name(database_name);
        if self.cache.id_for_name(&name).is_some() {
            return Ok(true);
        }
        Ok(self.find_by_name(None, &name).await?.is_some())
    }

    pub async fn get_by_id(&self, id: &DocumentId) -> Result<CatalogRecord> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        self.load(None, id).await
    }

    /// Reads the record from the store, bypassing and refreshing the cache.
    pub async fn reload(&self, id: &DocumentId) -> Result<CatalogRecord> {
        self.load(None, id).await
    }

    pub async fn get_by_name(&self, database_name: &str) -> Result<CatalogRecord> {
        let name = normalize_name(database_name);
        if let Some(record) = self
            .cache
            .id_for_name(&name)
            .and_then(|id| self.cache.get(&id))
        {
            return Ok(record);
        }
        self.find_by_name(None, &name)
            .await?
            .ok_or_else(|| Error::DatabaseNotFound(name.clone()))
    }

    /// Offset-paginated listing in insertion order.
    pub async fn list(&self, filter: &Filter, page: PageRequest) -> Result<Page<CatalogRecord>> {
        let page = page.normalized(&self.pagination);
        let (db, coll) = self.namespace();
        let total = self.storage.count_documents(None, db, coll, filter).await?;
        let items = self
            .storage
            .find(
                None,
                db,
                coll,
                filter,
                FindOptions::page(page.skip(), page.page_size),
            )
            .await?
            .into_iter()
            .map(CatalogRecord::from_stored)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            total,
            page: page.page,
            page_size: page.page_size,
            items,
        })
    }

    pub async fn list_for_owner(&self, owner: &str, page: PageRequest) -> Result<Page<CatalogRecord>> {
        self.list(&Filter::all().field("owner", owner), page).await
    }

    /// Every registered record, unpaginated. Used by audits.
    pub async fn all_records(&self) -> Result<Vec<CatalogRecord>> {
        let (db, coll) = self.namespace();
        self.storage
            .find(None, db, coll, &Filter::all(), FindOptions::default())
            .await?
            .into_iter()
            .map(CatalogRecord::from_stored)
            .collect()
    }

    /// Resolves a collection of a registered database.
    pub async fn collection(
        &self,
        id: &DocumentId,
        name: &str,
    ) -> Result<(CatalogRecord, CollectionDef)> {
        let record = self.get_by_id(id).await?;
        let collection = record.collection(name).cloned().ok_or_else(|| {
            Error::CollectionNotFound(format!("'{}' in database '{}'", name, record.database_name))
        })?;
        Ok((record, collection))
    }

    pub async fn collection_fields(&self, id: &DocumentId, name: &str) -> Result<Vec<FieldDef>> {
        Ok(self.collection(id, name).await?.1.fields)
    }

    // ===== Mutations =====

    /// Registers a new logical database.
    ///
    /// The existence check only short-circuits the common case. A
    /// concurrent create that passes it too is rejected by the unique index
    /// and still reported as `DuplicateDatabase`.
    #[instrument(skip(self, session, collections, owner), fields(count = collections.len()))]
    pub async fn create(
        &self,
        session: Option<&Session>,
        database_name: &str,
        collections: Vec<CollectionDef>,
        owner: Option<String>,
    ) -> Result<CatalogRecord> {
        let name = normalize_name(database_name);
        self.check_database_name(&name)?;
        validate_unique(collections.iter().map(|c| c.name.as_str()))?;

        if self.find_by_name(session, &name).await?.is_some() {
            return Err(Error::DuplicateDatabase(name));
        }

        let mut record = CatalogRecord::new(name, collections, owner);
        let (db, coll) = self.namespace();
        record.id = self
            .storage
            .insert_one(session, db, coll, record.to_document()?)
            .await
            .map_err(|e| match e {
                Error::DuplicateKey { .. } => Error::DuplicateDatabase(record.database_name.clone()),
                other => other,
            })?;
        self.cache.invalidate(&record.id, &record.database_name);

        debug!(database = %record.database_name, id = %record.id, "Catalog record inserted");
        Ok(record)
    }

    /// Appends collection definitions. Any collision with an existing
    /// collection rejects the whole batch.
    #[instrument(skip(self, session, collections), fields(count = collections.len()))]
    pub async fn add_collections(
        &self,
        session: Option<&Session>,
        id: &DocumentId,
        collections: Vec<CollectionDef>,
    ) -> Result<Vec<CollectionDef>> {
        validate_unique(collections.iter().map(|c| c.name.as_str()))?;

        let (_, added) = self
            .mutate(session, id, |record| {
                let collisions: Vec<String> = collections
                    .iter()
                    .filter(|c| record.collection(&c.name).is_some())
                    .map(|c| c.name.clone())
                    .collect();
                if !collisions.is_empty() {
                    return Err(Error::DuplicateCollection(collisions));
                }
                record.collections.extend(collections.iter().cloned());
                Ok(collections.clone())
            })
            .await?;
        Ok(added)
    }

    /// Removes collection definitions. Either every named collection is
    /// removed or, when any is unknown, none is.
    #[instrument(skip(self, session))]
    pub async fn drop_collections(
        &self,
        session: Option<&Session>,
        id: &DocumentId,
        names: &[String],
    ) -> Result<Vec<String>> {
        validate_unique(names.iter().map(String::as_str))?;

        let (_, removed) = self
            .mutate(session, id, |record| {
                let unknown: Vec<String> = names
                    .iter()
                    .filter(|n| record.collection(n).is_none())
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(Error::UnknownCollection(unknown));
                }
                record.collections.retain(|c| !names.contains(&c.name));
                Ok(names.to_vec())
            })
            .await?;
        Ok(removed)
    }

    /// Removes the catalog record. Dropping the physical database is the
    /// caller's job.
    #[instrument(skip(self, session))]
    pub async fn drop_database(
        &self,
        session: Option<&Session>,
        id: &DocumentId,
    ) -> Result<CatalogRecord> {
        let record = self.load(session, id).await?;
        let (db, coll) = self.namespace();
        let deleted = self
            .storage
            .delete_many(session, db, coll, &Filter::by_id(*id))
            .await?;
        self.cache.invalidate(id, &record.database_name);
        if deleted == 0 {
            return Err(Error::DatabaseNotFound(id.to_string()));
        }
        debug!(database = %record.database_name, "Catalog record removed");
        Ok(record)
    }

    /// Drops any cached view of this database.
    pub fn invalidate(&self, id: &DocumentId, database_name: &str) {
        self.cache.invalidate(id, &normalize_name(database_name));
    }

    // ===== Internals =====

    fn namespace(&self) -> (&str, &str) {
        (&self.location.database, &self.location.collection)
    }

    async fn load(&self, session: Option<&Session>, id: &DocumentId) -> Result<CatalogRecord> {
        let (db, coll) = self.namespace();
        let stored = self
            .storage
            .find(session, db, coll, &Filter::by_id(*id), FindOptions::page(0, 1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DatabaseNotFound(id.to_string()))?;
        let record = CatalogRecord::from_stored(stored)?;
        if session.is_none() {
            self.cache.put(&record);
        }
        Ok(record)
    }

    async fn find_by_name(
        &self,
        session: Option<&Session>,
        name: &str,
    ) -> Result<Option<CatalogRecord>> {
        let (db, coll) = self.namespace();
        let filter = Filter::all().field("database_name", name);
        let Some(stored) = self
            .storage
            .find(session, db, coll, &filter, FindOptions::page(0, 1))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let record = CatalogRecord::from_stored(stored)?;
        if session.is_none() {
            self.cache.put(&record);
        }
        Ok(Some(record))
    }

    /// Read-modify-write of one record, guarded by its revision.
    async fn mutate<T, F>(
        &self,
        session: Option<&Session>,
        id: &DocumentId,
        apply: F,
    ) -> Result<(CatalogRecord, T)>
    where
        F: Fn(&mut CatalogRecord) -> Result<T>,
    {
        let (db, coll) = self.namespace();
        for attempt in 0..=self.cas_retries {
            let mut record = self.load(session, id).await?;
            let expected = record.revision;

            let out = apply(&mut record)?;
            record.recount();
            record.revision = expected + 1;
            record.updated_at = chrono::Utc::now();

            let guard = Filter::by_id(*id).field("revision", expected);
            let result = self
                .storage
                .update_many(session, db, coll, &guard, &Update::Set(record.to_document()?))
                .await?;
            self.cache.invalidate(id, &record.database_name);

            if result.matched_count > 0 {
                return Ok((record, out));
            }
            counter!(CATALOG_CAS_RETRY).increment(1);
            warn!(id = %id, attempt, "Catalog record changed concurrently, retrying");
        }
        Err(Error::CatalogConflict(id.to_string()))
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldType, LruCatalogCache};
    use crate::error::ErrorKind;
    use crate::storage::{
        Document, MemoryDriver, StorageDriver, StoredDocument, UpdateResult,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Engine wrapper that simulates other writers racing the service.
    ///
    /// With `hide_names` set, lookups by `database_name` see nothing, as if
    /// a concurrent create committed right after the existence check.
    /// While `bumps` is non-zero, every revision-guarded update is preceded
    /// by a competing write that advances the stored revision.
    #[derive(Default)]
    struct RacingDriver {
        inner: MemoryDriver,
        hide_names: AtomicBool,
        bumps: AtomicU32,
    }

    #[async_trait]
    impl StorageDriver for RacingDriver {
        async fn list_database_names(&self) -> Result<Vec<String>> {
            self.inner.list_database_names().await
        }

        async fn drop_database(&self, db: &str) -> Result<()> {
            self.inner.drop_database(db).await
        }

        async fn create_collection(&self, db: &str, coll: &str) -> Result<()> {
            self.inner.create_collection(db, coll).await
        }

        async fn drop_collection(&self, db: &str, coll: &str) -> Result<()> {
            self.inner.drop_collection(db, coll).await
        }

        async fn list_collection_names(&self, db: &str) -> Result<Vec<String>> {
            self.inner.list_collection_names(db).await
        }

        async fn ensure_unique_index(&self, db: &str, coll: &str, field: &str) -> Result<()> {
            self.inner.ensure_unique_index(db, coll, field).await
        }

        async fn insert_one(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            doc: Document,
        ) -> Result<DocumentId> {
            self.inner.insert_one(session, db, coll, doc).await
        }

        async fn insert_many(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            docs: Vec<Document>,
        ) -> Result<Vec<DocumentId>> {
            self.inner.insert_many(session, db, coll, docs).await
        }

        async fn find(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            filter: &Filter,
            options: FindOptions,
        ) -> Result<Vec<StoredDocument>> {
            if self.hide_names.load(Ordering::SeqCst) && filter.has_field("database_name") {
                return Ok(Vec::new());
            }
            self.inner.find(session, db, coll, filter, options).await
        }

        async fn count_documents(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            filter: &Filter,
        ) -> Result<u64> {
            self.inner.count_documents(session, db, coll, filter).await
        }

        async fn update_many(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            filter: &Filter,
            update: &Update,
        ) -> Result<UpdateResult> {
            let expected = filter.fields.get("revision").and_then(|v| v.as_u64());
            if let Some(expected) = expected {
                let racing = self
                    .bumps
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if racing {
                    let competitor = Filter {
                        ids: filter.ids.clone(),
                        fields: Document::new(),
                    };
                    let bump = json!({"revision": expected + 1});
                    let bump = bump.as_object().cloned().unwrap_or_default();
                    self.inner
                        .update_many(None, db, coll, &competitor, &Update::Set(bump))
                        .await?;
                }
            }
            self.inner.update_many(session, db, coll, filter, update).await
        }

        async fn delete_many(
            &self,
            session: Option<&Session>,
            db: &str,
            coll: &str,
            filter: &Filter,
        ) -> Result<u64> {
            self.inner.delete_many(session, db, coll, filter).await
        }

        async fn start_session(&self) -> Result<Session> {
            self.inner.start_session().await
        }

        async fn start_transaction(&self, session: &Session) -> Result<()> {
            self.inner.start_transaction(session).await
        }

        async fn commit_transaction(&self, session: &Session) -> Result<()> {
            self.inner.commit_transaction(session).await
        }

        async fn abort_transaction(&self, session: &Session) -> Result<()> {
            self.inner.abort_transaction(session).await
        }

        async fn end_session(&self, session: &Session) -> Result<()> {
            self.inner.end_session(session).await
        }
    }

    async fn racing_service() -> Result<(Arc<RacingDriver>, MetadataService)> {
        let driver = Arc::new(RacingDriver::default());
        let storage = Storage::new(driver.clone(), Duration::from_secs(5));
        let metadata = MetadataService::new(storage, CatalogLocation::default());
        metadata.init().await?;
        Ok((driver, metadata))
    }

    async fn service() -> Result<MetadataService> {
        let storage = Storage::new(Arc::new(MemoryDriver::new()), Duration::from_secs(5));
        let metadata = MetadataService::new(storage, CatalogLocation::default())
            .with_cache(Arc::new(LruCatalogCache::new(16, Duration::from_secs(60))));
        metadata.init().await?;
        Ok(metadata)
    }

    fn orders() -> CollectionDef {
        CollectionDef::new(
            "orders",
            vec![
                FieldDef::new("order_id", FieldType::String),
                FieldDef::new("total", FieldType::Number),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_and_lookup() -> Result<()> {
        let metadata = service().await?;
        let record = metadata.create(None, "Shop", vec![orders()], None).await?;

        assert_eq!(record.database_name, "shop");
        assert!(metadata.exists("shop").await?);
        assert!(metadata.exists("SHOP").await?);
        assert_eq!(metadata.get_by_id(&record.id).await?.database_name, "shop");
        assert_eq!(metadata.get_by_name("shop").await?.id, record.id);

        let fields = metadata.collection_fields(&record.id, "orders").await?;
        assert_eq!(fields.len(), 2);

        let err = metadata.collection(&record.id, "missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollectionNotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() -> Result<()> {
        let metadata = service().await?;
        metadata.create(None, "shop", vec![], None).await?;
        let err = metadata.create(None, "shop", vec![], None).await.unwrap_err();
        assert_eq!(err, Error::DuplicateDatabase("shop".to_string()));

        let err = metadata.create(None, "bad-name", vec![], None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);

        let err = metadata.create(None, "__docgate", vec![], None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);
        Ok(())
    }

    #[tokio::test]
    async fn test_add_and_drop_collections_keep_counters() -> Result<()> {
        let metadata = service().await?;
        let record = metadata.create(None, "shop", vec![orders()], None).await?;

        let users = CollectionDef::new("users", vec![FieldDef::new("email", FieldType::String)]);
        metadata.add_collections(None, &record.id, vec![users]).await?;
        let updated = metadata.get_by_id(&record.id).await?;
        assert_eq!(updated.number_of_collections, 2);
        assert_eq!(updated.number_of_fields, 3);
        assert_eq!(updated.revision, 1);

        let err = metadata
            .add_collections(None, &record.id, vec![orders()])
            .await
            .unwrap_err();
        assert_eq!(err, Error::DuplicateCollection(vec!["orders".to_string()]));

        let err = metadata
            .drop_collections(None, &record.id, &["orders".into(), "ghost".into()])
            .await
            .unwrap_err();
        assert_eq!(err, Error::UnknownCollection(vec!["ghost".to_string()]));
        assert_eq!(metadata.get_by_id(&record.id).await?.number_of_collections, 2);

        metadata
            .drop_collections(None, &record.id, &["orders".into()])
            .await?;
        let after = metadata.get_by_id(&record.id).await?;
        assert_eq!(after.collection_names(), vec!["users"]);
        assert!(after.counters_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_database_invalidates_cache() -> Result<()> {
        let metadata = service().await?;
        let record = metadata.create(None, "shop", vec![], None).await?;
        assert!(metadata.exists("shop").await?);

        let removed = metadata.drop_database(None, &record.id).await?;
        assert_eq!(removed.database_name, "shop");
        assert!(!metadata.exists("shop").await?);

        let err = metadata.get_by_id(&record.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseNotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_pages_and_owner_filter() -> Result<()> {
        let metadata = service().await?;
        for (name, owner) in [("a", "u1"), ("b", "u2"), ("c", "u1")] {
            metadata
                .create(None, name, vec![], Some(owner.to_string()))
                .await?;
        }

        let page = metadata.list(&Filter::all(), PageRequest::new(2, 2)).await?;
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].database_name, "c");

        let mine = metadata.list_for_owner("u1", PageRequest::new(1, 10)).await?;
        assert_eq!(mine.total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unique_index_decides_create_race() -> Result<()> {
        let (driver, metadata) = racing_service().await?;
        metadata.create(None, "shop", vec![], None).await?;

        // The second create passes the existence check and reaches the insert.
        driver.hide_names.store(true, Ordering::SeqCst);
        let err = metadata
            .create(None, "shop", vec![orders()], None)
            .await
            .unwrap_err();
        assert_eq!(err, Error::DuplicateDatabase("shop".to_string()));

        driver.hide_names.store(false, Ordering::SeqCst);
        let page = metadata.list(&Filter::all(), PageRequest::new(1, 10)).await?;
        assert_eq!(page.total, 1);
        assert!(page.items[0].collections.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_revision_change_is_retried() -> Result<()> {
        let (driver, metadata) = racing_service().await?;
        let metadata = metadata.with_cas_retries(3);
        let record = metadata.create(None, "shop", vec![], None).await?;

        driver.bumps.store(1, Ordering::SeqCst);
        metadata
            .add_collections(None, &record.id, vec![orders()])
            .await?;

        let updated = metadata.reload(&record.id).await?;
        assert_eq!(updated.collection_names(), vec!["orders"]);
        // One competing write plus the retried one.
        assert_eq!(updated.revision, 2);
        assert!(updated.counters_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_conflict() -> Result<()> {
        let (driver, metadata) = racing_service().await?;
        let metadata = metadata.with_cas_retries(2);
        let record = metadata.create(None, "shop", vec![], None).await?;

        driver.bumps.store(u32::MAX, Ordering::SeqCst);
        let err = metadata
            .add_collections(None, &record.id, vec![orders()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CatalogConflict);

        driver.bumps.store(0, Ordering::SeqCst);
        let after = metadata.reload(&record.id).await?;
        assert!(after.collections.is_empty());
        // Initial attempt plus two retries, each beaten by a competitor.
        assert_eq!(after.revision, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_dirty_read_leaves_cache_at_abort() -> Result<()> {
        let metadata = service().await?;
        let txn = metadata.storage().begin().await?;
        let record = metadata
            .create(Some(txn.session()), "shop", vec![], None)
            .await?;

        // The engine exposes the uncommitted insert to readers outside the
        // transaction, and the cache keeps what they saw.
        assert!(metadata.exists("shop").await?);

        txn.abort().await?;
        metadata.invalidate(&record.id, &record.database_name);
        assert!(!metadata.exists("shop").await?);
        let err = metadata.get_by_id(&record.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatabaseNotFound);
        Ok(())
    }
}
