//! Drift reporting across the gateway

use docgate::catalog::{CollectionSpec, FieldSpec};
use docgate::error::{ErrorKind, Result};
use docgate::reconcile::IssueType;
use docgate::storage::StorageDriver;
use docgate::{Gateway, GatewayConfig, MemoryDriver};
use std::collections::BTreeSet;
use std::sync::Arc;

async fn gateway_with_shop(driver: &MemoryDriver) -> Result<(Gateway, docgate::storage::DocumentId)> {
    let gateway = Gateway::open(GatewayConfig::default(), Arc::new(driver.clone())).await?;
    let created = gateway
        .lifecycle()
        .create_database_with_collections(
            "shop",
            &[
                CollectionSpec::new("orders", vec![FieldSpec::new("total", "number")]),
                CollectionSpec::new("users", vec![FieldSpec::new("email", "string")]),
            ],
            None,
        )
        .await?;
    Ok((gateway, created.record.id))
}

#[tokio::test]
async fn test_fresh_gateway_audits_clean() -> Result<()> {
    let driver = MemoryDriver::new();
    let (gateway, id) = gateway_with_shop(&driver).await?;

    assert!(gateway.drift().diff(&id).await?.is_clean());
    let report = gateway.drift().audit_all().await?;
    assert_eq!(report.databases_checked, 1);
    assert!(!report.has_issues());
    Ok(())
}

#[tokio::test]
async fn test_out_of_band_changes_are_reported() -> Result<()> {
    let driver = MemoryDriver::new();
    let (gateway, id) = gateway_with_shop(&driver).await?;

    driver.drop_collection("shop", "users").await?;
    driver.create_collection("shop", "scratch").await?;

    let drift = gateway.drift().diff(&id).await?;
    assert_eq!(drift.missing_in_storage, BTreeSet::from(["users".to_string()]));
    assert_eq!(drift.extra_in_storage, BTreeSet::from(["scratch".to_string()]));

    let report = gateway.drift().audit_all().await?;
    assert_eq!(report.issues_of_type(IssueType::MissingCollection).len(), 1);
    assert_eq!(report.issues_of_type(IssueType::ExtraCollection).len(), 1);

    // Reporting never repairs.
    assert!(!gateway.drift().diff(&id).await?.is_clean());
    Ok(())
}

#[tokio::test]
async fn test_failed_physical_drop_leaves_orphan() -> Result<()> {
    let driver = MemoryDriver::new();
    let (gateway, id) = gateway_with_shop(&driver).await?;

    driver.fail_drop_database(true);
    let err = gateway
        .lifecycle()
        .drop_database_and_collections(&id, "shop")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialDrop);
    driver.clear_faults();

    let report = gateway.drift().audit_all().await?;
    assert_eq!(report.databases_checked, 0);
    assert_eq!(report.orphaned_databases, vec!["shop".to_string()]);
    assert_eq!(report.issues_of_type(IssueType::OrphanedDatabase).len(), 1);
    Ok(())
}
