//! Gateway assembly
//!
//! Wires the services together from one [`GatewayConfig`] and one storage
//! driver. The request-handling layer holds a [`Gateway`] and calls into
//! its services.

use std::sync::Arc;
use tracing::info;

use crate::catalog::MetadataService;
use crate::config::GatewayConfig;
use crate::documents::DocumentCrudEngine;
use crate::error::Result;
use crate::lifecycle::DatabaseLifecycleManager;
use crate::metrics::register_metrics;
use crate::reconcile::{AuditHandle, AuditLoop, AuditReport, DriftReporter};
use crate::storage::{Storage, StorageDriver};

/// All gateway services over one shared storage handle.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: GatewayConfig,
    metadata: MetadataService,
    lifecycle: DatabaseLifecycleManager,
    documents: DocumentCrudEngine,
    drift: DriftReporter,
}

impl Gateway {
    /// Builds the services. Call [`init`](Self::init) before serving.
    pub fn new(config: GatewayConfig, driver: Arc<dyn StorageDriver>) -> Self {
        let storage = Storage::new(driver, config.storage.timeout());
        let metadata = MetadataService::from_config(storage, &config);
        Self {
            lifecycle: DatabaseLifecycleManager::from_config(metadata.clone(), &config),
            documents: DocumentCrudEngine::new(metadata.clone()),
            drift: DriftReporter::new(metadata.clone()),
            metadata,
            config,
        }
    }

    /// Builds the services and prepares the catalog store.
    pub async fn open(config: GatewayConfig, driver: Arc<dyn StorageDriver>) -> Result<Self> {
        let gateway = Self::new(config, driver);
        gateway.init().await?;
        Ok(gateway)
    }

    pub async fn init(&self) -> Result<()> {
        register_metrics();
        self.metadata.init().await?;
        info!(
            timeout_ms = self.config.storage.timeout_ms,
            cache_capacity = self.config.catalog.cache_capacity,
            "Gateway ready"
        );
        Ok(())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataService {
        &self.metadata
    }

    pub fn lifecycle(&self) -> &DatabaseLifecycleManager {
        &self.lifecycle
    }

    pub fn documents(&self) -> &DocumentCrudEngine {
        &self.documents
    }

    pub fn drift(&self) -> &DriftReporter {
        &self.drift
    }

    /// Starts periodic audits at the configured interval.
    pub fn spawn_audit<F>(&self, on_report: F) -> AuditHandle
    where
        F: FnMut(&AuditReport) + Send + 'static,
    {
        AuditLoop::new(self.drift.clone(), self.config.audit.interval()).spawn(on_report)
    }
}
