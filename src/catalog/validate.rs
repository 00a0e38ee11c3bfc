//! Name and field-type validation.
//!
//! Pure functions, no I/O. Everything here runs before the catalog or the
//! storage engine is touched, so a validation failure never leaves a
//! partial effect behind.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use super::{CollectionDef, FieldDef, FieldType};
use crate::error::{Error, Result};

/// Longest accepted database, collection or field name.
pub const MAX_NAME_LEN: usize = 100;

/// Validates a database, collection or field name.
///
/// # Rules
///
/// - Between 1 and [`MAX_NAME_LEN`] characters
/// - Only ASCII letters, digits and underscores
///
/// ```rust
/// use docgate::catalog::validate_identifier;
///
/// assert!(validate_identifier("orders_2024").is_ok());
/// assert!(validate_identifier("2024").is_ok());
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier("user-sessions").is_err());
/// assert!(validate_identifier(&"a".repeat(101)).is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("Name cannot be empty".to_string()));
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "'{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidName(format!(
            "'{}' may only contain letters, numbers, and underscores",
            name
        )));
    }

    Ok(())
}

/// Parses a field type name against the fixed set.
pub fn validate_field_type(type_name: &str) -> Result<FieldType> {
    type_name.parse()
}

/// Fails naming the first repeated name, scanning in input order.
pub fn validate_unique<'a, I>(names: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

/// Caller-supplied field declaration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: Some(field_type.into()),
        }
    }
}

/// Caller-supplied collection declaration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Turns raw collection declarations into catalog definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator {
    lenient_field_types: bool,
}

impl SchemaValidator {
    /// Strict validator: unknown or missing types are `InvalidType`.
    pub fn strict() -> Self {
        Self::default()
    }

    /// With `lenient_field_types`, unknown or missing types become
    /// `string` and a warning is logged.
    pub fn new(lenient_field_types: bool) -> Self {
        Self {
            lenient_field_types,
        }
    }

    pub fn collections(&self, specs: &[CollectionSpec]) -> Result<Vec<CollectionDef>> {
        for spec in specs {
            validate_identifier(&spec.name)?;
        }
        validate_unique(specs.iter().map(|s| s.name.as_str()))?;
        specs.iter().map(|spec| self.collection(spec)).collect()
    }

    fn collection(&self, spec: &CollectionSpec) -> Result<CollectionDef> {
        for field in &spec.fields {
            validate_identifier(&field.name)?;
        }
        validate_unique(spec.fields.iter().map(|f| f.name.as_str()))?;

        let fields = spec
            .fields
            .iter()
            .map(|field| {
                let field_type = self.field_type(&spec.name, field)?;
                Ok(FieldDef::new(field.name.clone(), field_type))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CollectionDef::new(spec.name.clone(), fields))
    }

    fn field_type(&self, collection: &str, field: &FieldSpec) -> Result<FieldType> {
        let parsed = match field.field_type.as_deref() {
            Some(raw) => validate_field_type(raw),
            None => Err(Error::InvalidType(format!(
                "field '{}' has no type",
                field.name
            ))),
        };
        match parsed {
            Err(e) if self.lenient_field_types => {
                warn!(
                    collection,
                    field = %field.name,
                    error = %e,
                    "Defaulting field type to string"
                );
                Ok(FieldType::String)
            }
            other => other,
        }
    }
}
