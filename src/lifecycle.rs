//! Database lifecycle
//!
//! Orchestrates control-plane operations that touch both the catalog and
//! physical storage:
//!
//! - create database with collections
//! - drop database and its physical database
//! - add collections with creation, drop collections with removal
//! - chunked, resumable bulk provisioning
//!
//! Catalog writes run inside a storage transaction. Physical collection DDL
//! cannot join that transaction, so a failed provisioning step is undone by
//! explicit compensation before the transaction is aborted.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, instrument, warn};

use crate::catalog::{
    CatalogRecord, CollectionDef, CollectionSpec, MetadataService, SchemaValidator,
};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::metrics::{DATABASES_CREATED, DATABASES_DROPPED, PARTIAL_DROPS};
use crate::provision::{
    CollectionProvisioner, ProvisionCheckpoint, ProvisionFailure, ProvisionedCollection,
};
use crate::storage::{DocumentId, Storage, Transaction};

/// Progress of one create-database request.
///
/// `Validating -> CatalogInserted -> CollectionsProvisioned -> Committed`,
/// with `Aborted` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateState {
    Validating,
    CatalogInserted,
    CollectionsProvisioned,
    Committed,
    Aborted,
}

impl CreateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CreateState::Committed | CreateState::Aborted)
    }

    fn advance(self, database: &str, next: CreateState) -> CreateState {
        info!(database, from = %self, to = %next, "Create database state change");
        next
    }
}

impl fmt::Display for CreateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreateState::Validating => "validating",
            CreateState::CatalogInserted => "catalog_inserted",
            CreateState::CollectionsProvisioned => "collections_provisioned",
            CreateState::Committed => "committed",
            CreateState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of a committed create-database request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedDatabase {
    pub record: CatalogRecord,
    pub collections: Vec<ProvisionedCollection>,
    pub state: CreateState,
}

/// Orchestrates catalog and physical changes for whole databases and their
/// collections.
#[derive(Debug, Clone)]
pub struct DatabaseLifecycleManager {
    storage: Storage,
    metadata: MetadataService,
    provisioner: CollectionProvisioner,
    validator: SchemaValidator,
    bulk_chunk_size: usize,
}

impl DatabaseLifecycleManager {
    pub fn new(metadata: MetadataService, validator: SchemaValidator) -> Self {
        let storage = metadata.storage().clone();
        Self {
            provisioner: CollectionProvisioner::new(storage.clone()),
            storage,
            metadata,
            validator,
            bulk_chunk_size: 100,
        }
    }

    pub fn from_config(metadata: MetadataService, config: &GatewayConfig) -> Self {
        Self::new(
            metadata,
            SchemaValidator::new(config.validation.lenient_field_types),
        )
        .with_bulk_chunk_size(config.provisioning.bulk_chunk_size)
    }

    pub fn with_bulk_chunk_size(mut self, chunk_size: usize) -> Self {
        self.bulk_chunk_size = chunk_size.max(1);
        self
    }

    pub fn metadata(&self) -> &MetadataService {
        &self.metadata
    }

    /// Creates a logical database, its catalog record and every physical
    /// collection, or nothing at all.
    #[instrument(skip(self, specs, owner), fields(collections = specs.len()))]
    pub async fn create_database_with_collections(
        &self,
        name: &str,
        specs: &[CollectionSpec],
        owner: Option<String>,
    ) -> Result<CreatedDatabase> {
        let name = name.trim().to_lowercase();
        let mut state = CreateState::Validating;
        self.metadata.check_database_name(&name)?;
        let defs = self.validator.collections(specs)?;

        let txn = self.storage.begin().await?;
        let record = match self
            .metadata
            .create(Some(txn.session()), &name, defs.clone(), owner)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.abort(txn).await;
                state.advance(&name, CreateState::Aborted);
                return Err(e);
            }
        };
        state = state.advance(&name, CreateState::CatalogInserted);

        let collections = match self.provisioner.create(&name, &defs).await {
            Ok(collections) => collections,
            Err(failure) => {
                let err = self.roll_back(txn, &record, failure).await;
                state.advance(&name, CreateState::Aborted);
                return Err(err);
            }
        };
        state = state.advance(&name, CreateState::CollectionsProvisioned);

        if let Err(e) = txn.commit().await {
            let created: Vec<String> = collections.iter().map(|c| c.name.clone()).collect();
            let err = self.compensate(&name, &created, e).await;
            self.metadata.invalidate(&record.id, &name);
            state.advance(&name, CreateState::Aborted);
            return Err(err);
        }
        state = state.advance(&name, CreateState::Committed);

        counter!(DATABASES_CREATED).increment(1);
        Ok(CreatedDatabase {
            record,
            collections,
            state,
        })
    }

    /// Removes a database from the catalog, then drops it physically.
    ///
    /// `confirmation` must equal the database name, ignoring case. When the
    /// physical drop fails after the catalog removal committed, the result
    /// is `PartialDrop` naming the orphaned collections.
    #[instrument(skip(self, confirmation))]
    pub async fn drop_database_and_collections(
        &self,
        id: &DocumentId,
        confirmation: &str,
    ) -> Result<CatalogRecord> {
        let record = self.metadata.get_by_id(id).await?;
        if !confirmation.trim().eq_ignore_ascii_case(&record.database_name) {
            return Err(Error::ConfirmationMismatch(record.database_name));
        }

        let txn = self.storage.begin().await?;
        let removed = match self.metadata.drop_database(Some(txn.session()), id).await {
            Ok(removed) => removed,
            Err(e) => {
                self.abort(txn).await;
                self.metadata.invalidate(id, &record.database_name);
                return Err(e);
            }
        };
        txn.commit().await?;
        self.metadata.invalidate(id, &removed.database_name);
        counter!(DATABASES_DROPPED).increment(1);

        if let Err(e) = self.storage.drop_database(&removed.database_name).await {
            counter!(PARTIAL_DROPS).increment(1);
            error!(
                database = %removed.database_name,
                error = %e,
                "Catalog record removed but physical drop failed"
            );
            return Err(Error::PartialDrop {
                database: removed.database_name.clone(),
                orphaned: removed
                    .collection_names()
                    .into_iter()
                    .map(String::from)
                    .collect(),
                detail: e.to_string(),
            });
        }

        info!(database = %removed.database_name, "Database dropped");
        Ok(removed)
    }

    /// Registers and provisions new collections on an existing database.
    /// Collisions with existing collections are rejected before anything
    /// physical happens.
    #[instrument(skip(self, specs), fields(collections = specs.len()))]
    pub async fn add_collections_with_creation(
        &self,
        id: &DocumentId,
        specs: &[CollectionSpec],
    ) -> Result<Vec<ProvisionedCollection>> {
        let defs = self.validator.collections(specs)?;
        let record = self.metadata.get_by_id(id).await?;

        let txn = self.storage.begin().await?;
        if let Err(e) = self
            .metadata
            .add_collections(Some(txn.session()), id, defs.clone())
            .await
        {
            self.abort(txn).await;
            self.metadata.invalidate(id, &record.database_name);
            return Err(e);
        }

        let collections = match self.provisioner.create(&record.database_name, &defs).await {
            Ok(collections) => collections,
            Err(failure) => return Err(self.roll_back(txn, &record, failure).await),
        };

        if let Err(e) = txn.commit().await {
            let created: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();
            let err = self.compensate(&record.database_name, &created, e).await;
            self.metadata.invalidate(id, &record.database_name);
            return Err(err);
        }

        info!(
            database = %record.database_name,
            count = collections.len(),
            "Collections added"
        );
        Ok(collections)
    }

    /// Removes collections from the catalog, then drops them physically.
    /// Physical failures after the catalog change committed are reported as
    /// `PartialDrop`.
    #[instrument(skip(self))]
    pub async fn drop_collections_with_removal(
        &self,
        id: &DocumentId,
        names: &[String],
    ) -> Result<Vec<String>> {
        let record = self.metadata.get_by_id(id).await?;

        let txn = self.storage.begin().await?;
        let removed = match self
            .metadata
            .drop_collections(Some(txn.session()), id, names)
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                self.abort(txn).await;
                self.metadata.invalidate(id, &record.database_name);
                return Err(e);
            }
        };
        txn.commit().await?;
        self.metadata.invalidate(id, &record.database_name);

        let mut orphaned = Vec::new();
        let mut last_error = None;
        for name in &removed {
            match self.storage.drop_collection(&record.database_name, name).await {
                Ok(()) | Err(Error::NamespaceNotFound(_)) => {}
                Err(e) => {
                    orphaned.push(name.clone());
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            counter!(PARTIAL_DROPS).increment(1);
            error!(
                database = %record.database_name,
                orphaned = ?orphaned,
                error = %e,
                "Collections removed from catalog but physical drop failed"
            );
            return Err(Error::PartialDrop {
                database: record.database_name,
                orphaned,
                detail: e.to_string(),
            });
        }

        info!(database = %record.database_name, count = removed.len(), "Collections dropped");
        Ok(removed)
    }

    /// Adds a large number of collections in chunks, one catalog
    /// transaction per chunk.
    ///
    /// `checkpoint` records how far the run got. Calling again with the same
    /// specs and checkpoint after a failure resumes at the failed chunk;
    /// definitions already committed by an interrupted run are recognized
    /// and skipped. On a fresh run any name already in the catalog is a
    /// `DuplicateCollection`, even with an identical definition.
    #[instrument(skip(self, specs, checkpoint), fields(collections = specs.len()))]
    pub async fn add_collections_bulk(
        &self,
        id: &DocumentId,
        specs: &[CollectionSpec],
        checkpoint: &mut ProvisionCheckpoint,
    ) -> Result<Vec<ProvisionedCollection>> {
        let defs = self.validator.collections(specs)?;
        let record = self.metadata.get_by_id(id).await?;

        // A fresh run rejects every existing name. A resumed run accepts
        // identical definitions, which an interrupted chunk may have committed.
        let resuming = checkpoint.next_index > 0;
        let conflicts: Vec<String> = defs
            .iter()
            .skip(checkpoint.next_index)
            .filter(|d| {
                record
                    .collection(&d.name)
                    .is_some_and(|existing| !resuming || existing != *d)
            })
            .map(|d| d.name.clone())
            .collect();
        if !conflicts.is_empty() {
            return Err(Error::DuplicateCollection(conflicts));
        }

        let database = record.database_name.clone();
        let mut provisioned = Vec::new();
        while !checkpoint.is_complete(defs.len()) {
            let start = checkpoint.next_index;
            let end = (start + self.bulk_chunk_size).min(defs.len());
            let current = self.metadata.get_by_id(id).await?;
            let pending: Vec<CollectionDef> = defs[start..end]
                .iter()
                .filter(|d| current.collection(&d.name).is_none())
                .cloned()
                .collect();

            let txn = self.storage.begin().await?;
            if !pending.is_empty() {
                if let Err(e) = self
                    .metadata
                    .add_collections(Some(txn.session()), id, pending.clone())
                    .await
                {
                    self.abort(txn).await;
                    self.metadata.invalidate(id, &database);
                    return Err(e);
                }
            }

            let mut next = *checkpoint;
            let chunk = match self
                .provisioner
                .create_chunked(&database, &defs, self.bulk_chunk_size, &mut next)
                .await
            {
                Ok(chunk) => chunk,
                Err(failure) => return Err(self.roll_back(txn, &current, failure).await),
            };

            if let Err(e) = txn.commit().await {
                let created: Vec<String> = pending.iter().map(|d| d.name.clone()).collect();
                let err = self.compensate(&database, &created, e).await;
                self.metadata.invalidate(id, &database);
                return Err(err);
            }
            self.metadata.invalidate(id, &database);

            *checkpoint = next;
            provisioned.extend(chunk);
        }

        info!(database = %database, count = provisioned.len(), "Bulk provisioning complete");
        Ok(provisioned)
    }

    // ===== Rollback helpers =====

    async fn abort(&self, txn: Transaction) {
        let session = *txn.session();
        if let Err(e) = txn.abort().await {
            warn!(%session, error = %e, "Transaction abort failed");
        }
    }

    /// Compensates physical effects of a failed provisioning sequence, then
    /// aborts the catalog transaction.
    async fn roll_back(
        &self,
        txn: Transaction,
        record: &CatalogRecord,
        failure: ProvisionFailure,
    ) -> Error {
        let err = self
            .compensate(&record.database_name, &failure.created, failure.error)
            .await;
        self.abort(txn).await;
        self.metadata.invalidate(&record.id, &record.database_name);
        err
    }

    /// Drops `created` again. Returns `cause` unless compensation itself
    /// failed, in which case the compensation error wins since it names the
    /// collections left behind.
    async fn compensate(&self, database: &str, created: &[String], cause: Error) -> Error {
        warn!(database, error = %cause, count = created.len(), "Compensating provisioning");
        match self.provisioner.compensate(database, created).await {
            Ok(()) => cause,
            Err(compensation) => compensation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogLocation, FieldSpec};
    use crate::error::ErrorKind;
    use crate::storage::{MemoryDriver, StorageDriver};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> Result<(MemoryDriver, DatabaseLifecycleManager)> {
        let driver = MemoryDriver::new();
        let storage = Storage::new(Arc::new(driver.clone()), Duration::from_secs(5));
        let metadata = MetadataService::new(storage, CatalogLocation::default());
        metadata.init().await?;
        Ok((
            driver,
            DatabaseLifecycleManager::new(metadata, SchemaValidator::strict()).with_bulk_chunk_size(2),
        ))
    }

    fn spec(name: &str) -> CollectionSpec {
        CollectionSpec::new(name, vec![FieldSpec::new("v", "number")])
    }

    #[tokio::test]
    async fn test_create_reaches_committed() -> Result<()> {
        let (driver, manager) = setup().await?;
        let created = manager
            .create_database_with_collections("Shop", &[spec("orders")], None)
            .await?;
        assert_eq!(created.state, CreateState::Committed);
        assert_eq!(created.record.database_name, "shop");
        assert_eq!(driver.document_count("shop", "orders"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() -> Result<()> {
        let (driver, manager) = setup().await?;
        let bad = CollectionSpec::new("orders", vec![FieldSpec::new("v", "money")]);
        let err = manager
            .create_database_with_collections("shop", &[bad], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidType);
        assert!(!manager.metadata().exists("shop").await?);
        assert_eq!(driver.list_database_names().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_resumes_after_failure() -> Result<()> {
        let (driver, manager) = setup().await?;
        let created = manager
            .create_database_with_collections("lab", &[spec("base")], None)
            .await?;
        let id = created.record.id;

        let specs: Vec<CollectionSpec> = (0..5).map(|i| spec(&format!("c{}", i))).collect();
        let mut checkpoint = ProvisionCheckpoint::default();

        driver.fail_collection("c3");
        let err = manager
            .add_collections_bulk(&id, &specs, &mut checkpoint)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProvisioningError);
        assert_eq!(checkpoint.next_index, 2);
        let partial = manager.metadata().get_by_id(&id).await?;
        assert_eq!(partial.collection_names(), vec!["base", "c0", "c1"]);

        driver.clear_faults();
        manager.add_collections_bulk(&id, &specs, &mut checkpoint).await?;
        let record = manager.metadata().get_by_id(&id).await?;
        assert_eq!(record.number_of_collections, 6);
        assert!(record.counters_consistent());
        assert_eq!(driver.list_collection_names("lab").await?.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_bulk_run_rejects_existing_names() -> Result<()> {
        let (driver, manager) = setup().await?;
        let created = manager
            .create_database_with_collections("lab", &[spec("base")], None)
            .await?;
        let id = created.record.id;

        let mut checkpoint = ProvisionCheckpoint::default();
        let err = manager
            .add_collections_bulk(&id, &[spec("base"), spec("c0")], &mut checkpoint)
            .await
            .unwrap_err();
        assert_eq!(err, Error::DuplicateCollection(vec!["base".to_string()]));
        assert_eq!(checkpoint.next_index, 0);
        assert_eq!(driver.list_collection_names("lab").await?, vec!["base".to_string()]);

        // A resumed run tolerates the same definition committed earlier.
        let mut resumed = ProvisionCheckpoint { next_index: 1 };
        let specs = [spec("c0"), spec("c0b"), spec("base")];
        manager.add_collections_bulk(&id, &specs, &mut resumed).await?;
        let record = manager.metadata().get_by_id(&id).await?;
        assert_eq!(record.collection_names(), vec!["base", "c0b"]);
        Ok(())
    }
}
