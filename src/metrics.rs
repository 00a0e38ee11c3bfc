//! Gateway metrics.
//!
//! Counters are emitted through the `metrics` facade. The core never installs
//! a recorder; the embedding process decides where they go.

use metrics::{counter, describe_counter};

pub const DATABASES_CREATED: &str = "docgate_databases_created_total";
pub const DATABASES_DROPPED: &str = "docgate_databases_dropped_total";
pub const COLLECTIONS_PROVISIONED: &str = "docgate_collections_provisioned_total";
pub const PROVISIONING_COMPENSATIONS: &str = "docgate_provisioning_compensations_total";
pub const PARTIAL_DROPS: &str = "docgate_partial_drops_total";
pub const CATALOG_CAS_RETRY: &str = "docgate_catalog_cas_retry_total";
pub const DOCUMENTS_WRITTEN: &str = "docgate_documents_written_total";
pub const DRIFT_ISSUES: &str = "docgate_drift_issues_total";

/// Registers all metric descriptions.
///
/// Call once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(DATABASES_CREATED, "Logical databases committed");
    describe_counter!(DATABASES_DROPPED, "Logical databases removed from the catalog");
    describe_counter!(COLLECTIONS_PROVISIONED, "Physical collections created with a seed document");
    describe_counter!(
        PROVISIONING_COMPENSATIONS,
        "Collections dropped again after a failed provisioning sequence"
    );
    describe_counter!(PARTIAL_DROPS, "Catalog removals whose physical drop failed");
    describe_counter!(CATALOG_CAS_RETRY, "Optimistic catalog update retries");
    describe_counter!(DOCUMENTS_WRITTEN, "Documents inserted, updated or deleted");
    describe_counter!(DRIFT_ISSUES, "Catalog/storage drift issues reported by audits");
}

pub fn record_documents_written(operation: &'static str, count: u64) {
    counter!(DOCUMENTS_WRITTEN, "operation" => operation).increment(count);
}

pub fn record_drift_issues(kind: &'static str, count: u64) {
    if count > 0 {
        counter!(DRIFT_ISSUES, "kind" => kind).increment(count);
    }
}
