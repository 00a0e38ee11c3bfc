//! Catalog of logical databases.
//!
//! # Overview
//!
//! The catalog is one collection of [`CatalogRecord`] documents, one per
//! logical database:
//!
//! ```text
//! CatalogRecord (database_name, owner, counters, revision)
//!   └─→ CollectionDef (name, creation order)
//!        └─→ FieldDef (name, FieldType)
//! ```
//!
//! Each collection named by a record corresponds to one physical collection
//! in the physical database of the same name. The [`MetadataService`] is the
//! only writer of catalog records.
//!
//! # Examples
//!
//! ```rust
//! use docgate::catalog::{CatalogRecord, CollectionDef, FieldDef, FieldType};
//!
//! let orders = CollectionDef::new(
//!     "orders",
//!     vec![
//!         FieldDef::new("order_id", FieldType::String),
//!         FieldDef::new("total", FieldType::Number),
//!     ],
//! );
//! let record = CatalogRecord::new("shop", vec![orders], None);
//! assert_eq!(record.number_of_collections, 1);
//! assert_eq!(record.number_of_fields, 2);
//! assert!(record.counters_consistent());
//! ```

pub mod cache;
pub mod metadata;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::storage::{Document, DocumentId, StoredDocument};

pub use cache::{CacheStats, CatalogCache, LruCatalogCache, NoCache};
pub use metadata::{CatalogLocation, MetadataService};
pub use validate::{
    validate_field_type, validate_identifier, validate_unique, CollectionSpec, FieldSpec,
    SchemaValidator, MAX_NAME_LEN,
};

/// Declared type of a collection field.
///
/// The set is fixed. Unrecognized type names are rejected with
/// `InvalidType` unless lenient validation is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Object,
    Array,
    Boolean,
    Date,
    Null,
    Binary,
    ObjectId,
    Decimal128,
    Regex,
    Timestamp,
}

impl FieldType {
    pub const ALL: [FieldType; 12] = [
        FieldType::String,
        FieldType::Number,
        FieldType::Object,
        FieldType::Array,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Null,
        FieldType::Binary,
        FieldType::ObjectId,
        FieldType::Decimal128,
        FieldType::Regex,
        FieldType::Timestamp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Null => "null",
            FieldType::Binary => "binary",
            FieldType::ObjectId => "objectid",
            FieldType::Decimal128 => "decimal128",
            FieldType::Regex => "regex",
            FieldType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        FieldType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::InvalidType(format!("'{}' is not a supported field type", s)))
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A declared collection and its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// One logical database as recorded in the catalog.
///
/// `number_of_collections` and `number_of_fields` are derived from
/// `collections`; every mutation goes through [`recount`](Self::recount).
/// `revision` increases by one on every stored mutation and guards
/// concurrent read-modify-write cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: DocumentId,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub collections: Vec<CollectionDef>,
    pub number_of_collections: u64,
    pub number_of_fields: u64,
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogRecord {
    /// Builds a fresh record. The id is a placeholder until the catalog
    /// store assigns one.
    pub fn new(
        database_name: impl Into<String>,
        collections: Vec<CollectionDef>,
        owner: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let mut record = Self {
            id: DocumentId::new(),
            database_name: database_name.into(),
            owner,
            collections,
            number_of_collections: 0,
            number_of_fields: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        record.recount();
        record
    }

    /// Recomputes the derived counters from `collections`.
    pub fn recount(&mut self) {
        self.number_of_collections = self.collections.len() as u64;
        self.number_of_fields = self.collections.iter().map(|c| c.fields.len() as u64).sum();
    }

    pub fn counters_consistent(&self) -> bool {
        self.number_of_collections == self.collections.len() as u64
            && self.number_of_fields
                == self
                    .collections
                    .iter()
                    .map(|c| c.fields.len() as u64)
                    .sum::<u64>()
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name.as_str()).collect()
    }

    /// Storage form: every field except the engine-held identity.
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(mut doc) => {
                doc.remove("id");
                Ok(doc)
            }
            other => Err(Error::Serialization(format!(
                "catalog record serialized to {}",
                other
            ))),
        }
    }

    pub fn from_stored(stored: StoredDocument) -> Result<Self> {
        let mut body = stored.body;
        body.insert("id".to_string(), serde_json::to_value(stored.id)?);
        Ok(serde_json::from_value(serde_json::Value::Object(body))?)
    }
}
