//! Gateway configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `DOCGATE__*` environment variables
//! (`DOCGATE__STORAGE__TIMEOUT_MS=2000`).
//!
//! ```toml
//! [storage]
//! timeout_ms = 5000
//!
//! [catalog]
//! database = "__docgate"
//! collection = "databases"
//! cache_capacity = 1024
//! cache_ttl_ms = 30000
//!
//! [validation]
//! lenient_field_types = false
//! ```

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub pagination: PaginationConfig,
    pub provisioning: ProvisioningConfig,
    pub validation: ValidationConfig,
    pub audit: AuditConfig,
}

impl GatewayConfig {
    /// Loads configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("DOCGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<GatewayConfig>())
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Upper bound for every storage driver call.
    pub timeout_ms: u64,
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Physical database holding the catalog collection.
    pub database: String,
    /// Collection holding one record per logical database.
    pub collection: String,
    /// Maximum number of cached catalog lookups. 0 disables the cache.
    pub cache_capacity: usize,
    /// How long a cached lookup may be served without re-reading the store.
    pub cache_ttl_ms: u64,
    /// Attempts for optimistic catalog record updates.
    pub cas_retries: u32,
}

impl CatalogConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database: "__docgate".to_string(),
            collection: "databases".to_string(),
            cache_capacity: 1024,
            cache_ttl_ms: 30_000,
            cas_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Collections committed per catalog transaction during bulk provisioning.
    pub bulk_chunk_size: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            bulk_chunk_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Map missing or unknown field types to `string` instead of rejecting
    /// them. Off unless a deployment still sends legacy schemas.
    pub lenient_field_types: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub interval_secs: u64,
}

impl AuditConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.storage.timeout(), Duration::from_secs(5));
        assert_eq!(config.catalog.database, "__docgate");
        assert_eq!(config.pagination.default_page_size, 10);
        assert!(!config.validation.lenient_field_types);
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("docgate_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| Error::Internal(e.to_string()))?;
        let path = dir.join("docgate.toml");
        std::fs::write(
            &path,
            "[catalog]\ncache_capacity = 8\n\n[validation]\nlenient_field_types = true\n",
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let config = GatewayConfig::load(Some(&path))?;
        assert_eq!(config.catalog.cache_capacity, 8);
        assert_eq!(config.catalog.collection, "databases");
        assert!(config.validation.lenient_field_types);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() -> Result<()> {
        let config = GatewayConfig::load(Some(Path::new("/nonexistent/docgate.toml")))?;
        assert_eq!(config.provisioning.bulk_chunk_size, 100);
        Ok(())
    }
}
