//! Collection provisioning
//!
//! Creates the physical collection behind each catalog definition and seeds
//! it with one placeholder document whose keys are the declared field names
//! (all `null`), so a fresh collection is non-empty and its shape is
//! discoverable from storage alone.
//!
//! Collection DDL is not transactional in the storage engine. When a
//! sequence fails part-way the caller gets back the names created so far
//! and must run [`CollectionProvisioner::compensate`] before reporting the
//! error.

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CollectionDef, FieldDef};
use crate::error::{Error, Result};
use crate::metrics::{COLLECTIONS_PROVISIONED, PROVISIONING_COMPENSATIONS};
use crate::storage::{Document, DocumentId, Filter, FindOptions, Storage};

/// A physical collection created for a catalog definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedCollection {
    pub name: String,
    /// Engine id of the seed document.
    pub seed_id: DocumentId,
    pub fields: Vec<FieldDef>,
}

/// A provisioning sequence that stopped part-way.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionFailure {
    /// Collections created by this sequence before it failed, in creation
    /// order. These must be compensated.
    pub created: Vec<String>,
    pub error: Error,
}

impl ProvisionFailure {
    fn new(created: Vec<String>, error: Error) -> Self {
        Self { created, error }
    }
}

/// Progress of a chunked provisioning run.
///
/// Persist it between calls to resume where a failed or interrupted run
/// stopped. Everything before `next_index` is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionCheckpoint {
    pub next_index: usize,
}

impl ProvisionCheckpoint {
    pub fn is_complete(&self, total: usize) -> bool {
        self.next_index >= total
    }
}

/// Storage-side half of collection lifecycle.
#[derive(Debug, Clone)]
pub struct CollectionProvisioner {
    storage: Storage,
}

impl CollectionProvisioner {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Creates each collection with its seed document, in order, stopping
    /// at the first failure.
    #[instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn create(
        &self,
        database: &str,
        defs: &[CollectionDef],
    ) -> std::result::Result<Vec<ProvisionedCollection>, ProvisionFailure> {
        let mut created = Vec::with_capacity(defs.len());
        let mut provisioned = Vec::with_capacity(defs.len());

        for def in defs {
            if let Err(e) = self.storage.create_collection(database, &def.name).await {
                return Err(ProvisionFailure::new(created, physical_error(&def.name, e)));
            }
            created.push(def.name.clone());

            match self.seed(database, def).await {
                Ok(collection) => provisioned.push(collection),
                Err(e) => return Err(ProvisionFailure::new(created, e)),
            }
        }

        counter!(COLLECTIONS_PROVISIONED).increment(provisioned.len() as u64);
        debug!(database, count = provisioned.len(), "Collections provisioned");
        Ok(provisioned)
    }

    /// Like [`create`](Self::create), but adopts collections that already
    /// exist physically instead of failing on them. Only collections this
    /// call created are reported in a failure.
    pub async fn create_idempotent(
        &self,
        database: &str,
        defs: &[CollectionDef],
    ) -> std::result::Result<Vec<ProvisionedCollection>, ProvisionFailure> {
        let existing: HashSet<String> = self
            .storage
            .list_collection_names(database)
            .await
            .map_err(|e| {
                let name = defs.first().map(|d| d.name.as_str()).unwrap_or_default();
                ProvisionFailure::new(Vec::new(), physical_error(name, e))
            })?
            .into_iter()
            .collect();

        let (adopt, fresh): (Vec<CollectionDef>, Vec<CollectionDef>) = defs
            .iter()
            .cloned()
            .partition(|d| existing.contains(&d.name));

        let mut provisioned = Vec::with_capacity(defs.len());
        for def in &adopt {
            debug!(database, collection = %def.name, "Adopting existing collection");
            match self.adopt(database, def).await {
                Ok(collection) => provisioned.push(collection),
                Err(e) => return Err(ProvisionFailure::new(Vec::new(), e)),
            }
        }
        provisioned.extend(self.create(database, &fresh).await?);

        // Report in the caller's order.
        provisioned.sort_by_key(|p| defs.iter().position(|d| d.name == p.name));
        Ok(provisioned)
    }

    /// Provisions the chunk of `defs` starting at the checkpoint and
    /// advances the checkpoint on success. Re-entrant: collections left
    /// behind by an earlier attempt are adopted.
    pub async fn create_chunked(
        &self,
        database: &str,
        defs: &[CollectionDef],
        chunk_size: usize,
        checkpoint: &mut ProvisionCheckpoint,
    ) -> std::result::Result<Vec<ProvisionedCollection>, ProvisionFailure> {
        let start = checkpoint.next_index.min(defs.len());
        let end = start.saturating_add(chunk_size.max(1)).min(defs.len());
        let provisioned = self.create_idempotent(database, &defs[start..end]).await?;
        checkpoint.next_index = end;
        info!(database, start, end, total = defs.len(), "Provisioning chunk done");
        Ok(provisioned)
    }

    /// Drops the given collections again, newest first. Collections that are
    /// already gone count as dropped. Fails listing whatever could not be
    /// removed.
    #[instrument(skip(self))]
    pub async fn compensate(&self, database: &str, created: &[String]) -> Result<()> {
        if created.is_empty() {
            return Ok(());
        }
        counter!(PROVISIONING_COMPENSATIONS).increment(created.len() as u64);

        let mut orphaned = Vec::new();
        let mut last_error = None;
        for name in created.iter().rev() {
            match self.storage.drop_collection(database, name).await {
                Ok(()) | Err(Error::NamespaceNotFound(_)) => {
                    debug!(database, collection = %name, "Compensated collection");
                }
                Err(e) => {
                    error!(database, collection = %name, error = %e, "Compensation failed");
                    orphaned.push(name.clone());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => {
                warn!(database, count = created.len(), "Provisioning compensated");
                Ok(())
            }
            Some(e) => Err(Error::Provisioning {
                collection: orphaned.join(", "),
                detail: format!("compensation left orphaned collections: {}", e),
            }),
        }
    }

    async fn seed(&self, database: &str, def: &CollectionDef) -> Result<ProvisionedCollection> {
        let seed: Document = def
            .fields
            .iter()
            .map(|f| (f.name.clone(), Value::Null))
            .collect();
        let seed_id = self
            .storage
            .insert_one(None, database, &def.name, seed)
            .await
            .map_err(|e| physical_error(&def.name, e))?;
        Ok(ProvisionedCollection {
            name: def.name.clone(),
            seed_id,
            fields: def.fields.clone(),
        })
    }

    async fn adopt(&self, database: &str, def: &CollectionDef) -> Result<ProvisionedCollection> {
        let first = self
            .storage
            .find(None, database, &def.name, &Filter::all(), FindOptions::page(0, 1))
            .await
            .map_err(|e| physical_error(&def.name, e))?
            .into_iter()
            .next();
        match first {
            Some(doc) => Ok(ProvisionedCollection {
                name: def.name.clone(),
                seed_id: doc.id,
                fields: def.fields.clone(),
            }),
            None => self.seed(database, def).await,
        }
    }
}

/// Storage failures surface as provisioning errors, except timeouts which
/// keep their kind.
fn physical_error(collection: &str, e: Error) -> Error {
    match e {
        Error::StorageTimeout(_) | Error::Provisioning { .. } => e,
        other => Error::Provisioning {
            collection: collection.to_string(),
            detail: other.to_string(),
        },
    }
}
