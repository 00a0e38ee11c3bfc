// docgate - metadata-governed document database gateway
// Catalog, provisioning and CRUD over a shared document store

#![warn(rust_2018_idioms)]

pub mod catalog;
pub mod config;
pub mod documents;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod page;
pub mod provision;
pub mod reconcile;
pub mod storage;

// Re-exports for convenience
pub use catalog::{CatalogRecord, CollectionDef, FieldDef, FieldType, MetadataService};
pub use config::GatewayConfig;
pub use documents::DocumentCrudEngine;
pub use gateway::Gateway;
pub use lifecycle::DatabaseLifecycleManager;
pub use reconcile::DriftReporter;
pub use storage::{MemoryDriver, Storage, StorageDriver};

/// Gateway error types
///
/// Every error carries a stable [`ErrorKind`](error::ErrorKind) plus a
/// human-readable detail. Callers should branch on the kind only; the detail
/// text is not a contract.
pub mod error {
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum Error {
        // ===== Validation =====
        #[error("Invalid name: {0}")]
        InvalidName(String),

        #[error("Invalid field type: {0}")]
        InvalidType(String),

        #[error("Duplicate name: {0}")]
        DuplicateName(String),

        // ===== Catalog =====
        #[error("Database already exists: {0}")]
        DuplicateDatabase(String),

        #[error("Database not found: {0}")]
        DatabaseNotFound(String),

        #[error("Collection not found: {0}")]
        CollectionNotFound(String),

        #[error("Collection already exists: {}", .0.join(", "))]
        DuplicateCollection(Vec<String>),

        #[error("Unknown collection: {}", .0.join(", "))]
        UnknownCollection(Vec<String>),

        #[error("Catalog record {0} was modified concurrently")]
        CatalogConflict(String),

        // ===== Storage =====
        #[error("Provisioning of collection '{collection}' failed: {detail}")]
        Provisioning { collection: String, detail: String },

        #[error(
            "Database '{database}' removed from catalog but physical drop failed ({}): {detail}",
            .orphaned.join(", ")
        )]
        PartialDrop {
            database: String,
            orphaned: Vec<String>,
            detail: String,
        },

        #[error("Storage timeout: {0}")]
        StorageTimeout(String),

        #[error("Storage unavailable: {0}")]
        StorageUnavailable(String),

        #[error("Duplicate key on unique index '{index}': {value}")]
        DuplicateKey { index: String, value: String },

        #[error("Namespace not found: {0}")]
        NamespaceNotFound(String),

        #[error("Namespace already exists: {0}")]
        NamespaceExists(String),

        // ===== Operation =====
        #[error("Update data cannot be empty")]
        EmptyUpdate,

        #[error("Invalid identifier: {0}")]
        InvalidIdentifier(String),

        #[error("Confirmation does not match the name of database '{0}'")]
        ConfirmationMismatch(String),

        #[error("Field '{field}' is not declared on collection '{collection}'")]
        UndeclaredField { collection: String, field: String },

        // ===== Ambient =====
        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    /// Stable error classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ErrorKind {
        InvalidName,
        InvalidType,
        DuplicateName,
        DuplicateDatabase,
        DatabaseNotFound,
        CollectionNotFound,
        DuplicateCollection,
        UnknownCollection,
        CatalogConflict,
        ProvisioningError,
        PartialDrop,
        StorageTimeout,
        StorageUnavailable,
        DuplicateKey,
        NamespaceNotFound,
        NamespaceExists,
        EmptyUpdate,
        InvalidIdentifier,
        ConfirmationMismatch,
        UndeclaredField,
        Serialization,
        Config,
        Internal,
    }

    impl Error {
        pub fn kind(&self) -> ErrorKind {
            match self {
                Error::InvalidName(_) => ErrorKind::InvalidName,
                Error::InvalidType(_) => ErrorKind::InvalidType,
                Error::DuplicateName(_) => ErrorKind::DuplicateName,
                Error::DuplicateDatabase(_) => ErrorKind::DuplicateDatabase,
                Error::DatabaseNotFound(_) => ErrorKind::DatabaseNotFound,
                Error::CollectionNotFound(_) => ErrorKind::CollectionNotFound,
                Error::DuplicateCollection(_) => ErrorKind::DuplicateCollection,
                Error::UnknownCollection(_) => ErrorKind::UnknownCollection,
                Error::CatalogConflict(_) => ErrorKind::CatalogConflict,
                Error::Provisioning { .. } => ErrorKind::ProvisioningError,
                Error::PartialDrop { .. } => ErrorKind::PartialDrop,
                Error::StorageTimeout(_) => ErrorKind::StorageTimeout,
                Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
                Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
                Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
                Error::NamespaceExists(_) => ErrorKind::NamespaceExists,
                Error::EmptyUpdate => ErrorKind::EmptyUpdate,
                Error::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
                Error::ConfirmationMismatch(_) => ErrorKind::ConfirmationMismatch,
                Error::UndeclaredField { .. } => ErrorKind::UndeclaredField,
                Error::Serialization(_) => ErrorKind::Serialization,
                Error::Config(_) => ErrorKind::Config,
                Error::Internal(_) => ErrorKind::Internal,
            }
        }

        /// Errors raised by the storage engine itself, as opposed to the
        /// catalog or request validation.
        pub fn is_storage(&self) -> bool {
            matches!(
                self.kind(),
                ErrorKind::StorageTimeout
                    | ErrorKind::StorageUnavailable
                    | ErrorKind::NamespaceNotFound
                    | ErrorKind::NamespaceExists
                    | ErrorKind::DuplicateKey
            )
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::Serialization(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::{Error, ErrorKind};
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            Error::Provisioning {
                collection: "orders".into(),
                detail: "boom".into()
            }
            .kind(),
            ErrorKind::ProvisioningError
        );
        assert_eq!(Error::EmptyUpdate.kind(), ErrorKind::EmptyUpdate);
        assert!(Error::StorageTimeout("find".into()).is_storage());
        assert!(!Error::DatabaseNotFound("x".into()).is_storage());
    }

    #[test]
    fn test_error_detail_lists_names() {
        let err = Error::UnknownCollection(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Unknown collection: a, b");
    }
}
