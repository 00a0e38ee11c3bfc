//! Document identity and representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Field under which the engine identity is rendered in output documents.
pub const ID_FIELD: &str = "_id";

/// Identifier aliases accepted from callers in filters and stripped on insert.
pub const ID_ALIASES: [&str; 2] = ["_id", "id"];

/// Schemaless document body.
pub type Document = Map<String, Value>;

/// Engine-assigned document identity.
///
/// Rendered as 32 lowercase hex digits. Parsing also accepts the hyphenated
/// UUID form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a caller-supplied identifier.
    pub fn parse_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidIdentifier(format!("'{}' is not a document id", s)))
    }

    /// Parses a JSON value holding an identifier string.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::parse_str(s),
            other => Err(Error::InvalidIdentifier(format!(
                "expected an id string, got {}",
                other
            ))),
        }
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

/// A document as held by the storage engine: identity kept apart from the
/// caller-defined body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub body: Document,
}

impl StoredDocument {
    pub fn new(id: DocumentId, body: Document) -> Self {
        Self { id, body }
    }

    /// Body with the identity rendered as a string under `_id`.
    pub fn render(self) -> Document {
        let mut out = Document::with_capacity(self.body.len() + 1);
        out.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        out.extend(self.body);
        out
    }
}

/// Removes caller-supplied identity fields; the engine assigns identity.
pub fn strip_identity(doc: &mut Document) {
    for alias in ID_ALIASES {
        doc.remove(alias);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_display_round_trips() -> Result<()> {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse()?;
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 32);
        Ok(())
    }

    #[test]
    fn test_document_id_accepts_hyphenated() -> Result<()> {
        let id = DocumentId::parse_str("550e8400-e29b-41d4-a716-446655440000")?;
        assert_eq!(id.to_string(), "550e8400e29b41d4a716446655440000");
        Ok(())
    }

    #[test]
    fn test_document_id_rejects_garbage() {
        let err = DocumentId::parse_str("not-an-id").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidIdentifier);
        assert!(DocumentId::from_value(&json!(42)).is_err());
    }

    #[test]
    fn test_render_includes_string_id() {
        let id = DocumentId::new();
        let body = json!({"name": "Alice"}).as_object().cloned().unwrap_or_default();
        let rendered = StoredDocument::new(id, body).render();
        assert_eq!(rendered.get(ID_FIELD), Some(&json!(id.to_string())));
        assert_eq!(rendered.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn test_strip_identity() {
        let mut doc = json!({"_id": "x", "id": 3, "name": "a"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        strip_identity(&mut doc);
        assert_eq!(doc.len(), 1);
        assert!(doc.contains_key("name"));
    }
}
