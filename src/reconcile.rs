//! Drift detection between the catalog and physical storage.
//!
//! Read-only: drift is reported, never repaired. Listing collections for
//! every database is too costly for request paths, so this runs from audits
//! ([`DriftReporter::audit_all`], [`AuditLoop`]) rather than inline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CatalogRecord, MetadataService};
use crate::error::Result;
use crate::metrics::record_drift_issues;
use crate::storage::{DocumentId, Storage};

// ============================================================================
// Reports
// ============================================================================

/// Catalog versus storage for one logical database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub database_id: DocumentId,
    pub database_name: String,
    /// Declared in the catalog, absent from storage.
    pub missing_in_storage: BTreeSet<String>,
    /// Present in storage, not declared in the catalog.
    pub extra_in_storage: BTreeSet<String>,
    pub checked_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_in_storage.is_empty() && self.extra_in_storage.is_empty()
    }
}

/// Result of auditing every catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub checked_at: DateTime<Utc>,
    pub databases_checked: usize,
    pub issues: Vec<DriftIssue>,
    /// Physical databases with no catalog record.
    pub orphaned_databases: Vec<String>,
}

impl AuditReport {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn issues_of_type(&self, issue_type: IssueType) -> Vec<&DriftIssue> {
        self.issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }
}

/// One drift finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftIssue {
    pub issue_type: IssueType,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Declared collection with no physical collection.
    MissingCollection,
    /// Physical collection the catalog does not declare.
    ExtraCollection,
    /// Physical database the catalog does not know.
    OrphanedDatabase,
}

impl IssueType {
    fn as_str(&self) -> &'static str {
        match self {
            IssueType::MissingCollection => "missing_collection",
            IssueType::ExtraCollection => "extra_collection",
            IssueType::OrphanedDatabase => "orphaned_database",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

// ============================================================================
// Reporter
// ============================================================================

/// Compares catalog declarations with live collection listings.
#[derive(Debug, Clone)]
pub struct DriftReporter {
    storage: Storage,
    metadata: MetadataService,
}

impl DriftReporter {
    pub fn new(metadata: MetadataService) -> Self {
        Self {
            storage: metadata.storage().clone(),
            metadata,
        }
    }

    /// Drift for one database. Reads the catalog record fresh.
    #[instrument(skip(self))]
    pub async fn diff(&self, database_id: &DocumentId) -> Result<DriftReport> {
        let record = self.metadata.reload(database_id).await?;
        self.diff_record(&record).await
    }

    /// Drift for every catalog record plus physical databases the catalog
    /// does not know about. The catalog's own database is never reported.
    #[instrument(skip(self))]
    pub async fn audit_all(&self) -> Result<AuditReport> {
        let records = self.metadata.all_records().await?;
        let mut issues = Vec::new();

        for record in &records {
            let drift = self.diff_record(record).await?;
            issues.extend(drift.missing_in_storage.iter().map(|name| DriftIssue {
                issue_type: IssueType::MissingCollection,
                database: record.database_name.clone(),
                collection: Some(name.clone()),
                description: format!(
                    "collection '{}' is declared but does not exist in storage",
                    name
                ),
                severity: Severity::Error,
            }));
            issues.extend(drift.extra_in_storage.iter().map(|name| DriftIssue {
                issue_type: IssueType::ExtraCollection,
                database: record.database_name.clone(),
                collection: Some(name.clone()),
                description: format!("collection '{}' exists in storage but is not declared", name),
                severity: Severity::Warning,
            }));
        }

        let known: HashSet<&str> = records.iter().map(|r| r.database_name.as_str()).collect();
        let catalog_db = self.metadata.location().database.as_str();
        let orphaned_databases: Vec<String> = self
            .storage
            .list_database_names()
            .await?
            .into_iter()
            .filter(|name| name != catalog_db && !known.contains(name.as_str()))
            .collect();
        issues.extend(orphaned_databases.iter().map(|name| DriftIssue {
            issue_type: IssueType::OrphanedDatabase,
            database: name.clone(),
            collection: None,
            description: format!("database '{}' exists in storage without a catalog record", name),
            severity: Severity::Warning,
        }));

        for issue_type in [
            IssueType::MissingCollection,
            IssueType::ExtraCollection,
            IssueType::OrphanedDatabase,
        ] {
            let count = issues.iter().filter(|i| i.issue_type == issue_type).count();
            record_drift_issues(issue_type.as_str(), count as u64);
        }

        let report = AuditReport {
            checked_at: Utc::now(),
            databases_checked: records.len(),
            issues,
            orphaned_databases,
        };
        if report.has_issues() {
            warn!(
                databases = report.databases_checked,
                issues = report.issues.len(),
                "Audit found drift"
            );
        } else {
            info!(databases = report.databases_checked, "Audit clean");
        }
        Ok(report)
    }

    async fn diff_record(&self, record: &CatalogRecord) -> Result<DriftReport> {
        let physical: BTreeSet<String> = self
            .storage
            .list_collection_names(&record.database_name)
            .await?
            .into_iter()
            .collect();
        let declared: BTreeSet<String> = record
            .collections
            .iter()
            .map(|c| c.name.clone())
            .collect();

        let report = DriftReport {
            database_id: record.id,
            database_name: record.database_name.clone(),
            missing_in_storage: declared.difference(&physical).cloned().collect(),
            extra_in_storage: physical.difference(&declared).cloned().collect(),
            checked_at: Utc::now(),
        };
        debug!(
            database = %record.database_name,
            missing = report.missing_in_storage.len(),
            extra = report.extra_in_storage.len(),
            "Drift checked"
        );
        Ok(report)
    }
}

// ============================================================================
// Periodic audit
// ============================================================================

/// Runs [`DriftReporter::audit_all`] on a fixed interval until shut down.
pub struct AuditLoop {
    reporter: DriftReporter,
    interval: Duration,
}

/// Handle to a running [`AuditLoop`].
pub struct AuditHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AuditHandle {
    /// Stops the loop and waits for the in-flight audit, if any.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Audit loop task failed");
        }
    }
}

impl AuditLoop {
    pub fn new(reporter: DriftReporter, interval: Duration) -> Self {
        Self { reporter, interval }
    }

    /// Spawns the loop on the current runtime. The first audit runs
    /// immediately; each report is passed to `on_report`.
    pub fn spawn<F>(self, mut on_report: F) -> AuditHandle
    where
        F: FnMut(&AuditReport) + Send + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(interval_secs = self.interval.as_secs(), "Audit loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reporter.audit_all().await {
                            Ok(report) => on_report(&report),
                            Err(e) => error!(error = %e, "Audit failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Audit loop stopped");
        });
        AuditHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogLocation, CollectionDef};
    use crate::storage::{MemoryDriver, StorageDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn setup() -> Result<(MemoryDriver, MetadataService)> {
        let driver = MemoryDriver::new();
        let storage = Storage::new(Arc::new(driver.clone()), Duration::from_secs(5));
        let metadata = MetadataService::new(storage, CatalogLocation::default());
        metadata.init().await?;
        Ok((driver, metadata))
    }

    #[tokio::test]
    async fn test_diff_reports_both_directions() -> Result<()> {
        let (driver, metadata) = setup().await?;
        let record = metadata
            .create(
                None,
                "shop",
                vec![
                    CollectionDef::new("orders", vec![]),
                    CollectionDef::new("users", vec![]),
                ],
                None,
            )
            .await?;
        driver.create_collection("shop", "orders").await?;
        driver.create_collection("shop", "scratch").await?;

        let report = DriftReporter::new(metadata).diff(&record.id).await?;
        assert!(!report.is_clean());
        assert_eq!(report.missing_in_storage, BTreeSet::from(["users".to_string()]));
        assert_eq!(report.extra_in_storage, BTreeSet::from(["scratch".to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_finds_orphaned_databases() -> Result<()> {
        let (driver, metadata) = setup().await?;
        driver.create_collection("stray", "things").await?;

        let report = DriftReporter::new(metadata).audit_all().await?;
        assert_eq!(report.orphaned_databases, vec!["stray".to_string()]);
        assert_eq!(report.issues_of_type(IssueType::OrphanedDatabase).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_loop_runs_and_stops() -> Result<()> {
        let (_driver, metadata) = setup().await?;
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();

        let handle = AuditLoop::new(DriftReporter::new(metadata), Duration::from_millis(10))
            .spawn(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert!(runs.load(Ordering::SeqCst) >= 1);
        Ok(())
    }
}
