//! Document CRUD engine
//!
//! Every operation resolves the database and collection against the live
//! catalog before storage is touched. Filters arrive as plain JSON objects;
//! top-level `id`/`_id` keys are turned into typed identity clauses and
//! everything else is passed through as field predicates.
//!
//! Soft-deleted documents (`is_deleted: true`) are hidden from reads unless
//! the filter mentions `is_deleted` itself.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::catalog::{CatalogRecord, CollectionDef, MetadataService};
use crate::config::PaginationConfig;
use crate::error::{Error, Result};
use crate::metrics::record_documents_written;
use crate::page::{Page, PageRequest};
use crate::storage::{
    strip_identity, Document, DocumentId, Filter, FindOptions, IdClause, Storage, Update,
    ID_ALIASES,
};

/// Soft-delete flag.
pub const IS_DELETED: &str = "is_deleted";
/// Soft-delete timestamp, RFC 3339.
pub const DELETED_AT: &str = "deleted_at";

/// Fields every document may carry whether declared or not.
const STATUS_FIELDS: [&str; 2] = [IS_DELETED, DELETED_AT];

/// One document or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentInput {
    Many(Vec<Document>),
    One(Document),
}

impl DocumentInput {
    fn into_vec(self) -> Vec<Document> {
        match self {
            DocumentInput::Many(docs) => docs,
            DocumentInput::One(doc) => vec![doc],
        }
    }
}

impl From<Document> for DocumentInput {
    fn from(doc: Document) -> Self {
        DocumentInput::One(doc)
    }
}

impl From<Vec<Document>> for DocumentInput {
    fn from(docs: Vec<Document>) -> Self {
        DocumentInput::Many(docs)
    }
}

/// Data-plane operations on catalog-governed collections.
#[derive(Debug, Clone)]
pub struct DocumentCrudEngine {
    storage: Storage,
    metadata: MetadataService,
    pagination: PaginationConfig,
}

impl DocumentCrudEngine {
    pub fn new(metadata: MetadataService) -> Self {
        Self {
            storage: metadata.storage().clone(),
            pagination: metadata.pagination().clone(),
            metadata,
        }
    }

    /// Inserts documents, returning their engine-assigned ids in input
    /// order. Caller-supplied `id`/`_id` fields are dropped; any other
    /// field must be declared on the collection.
    #[instrument(skip(self, input))]
    pub async fn create_documents(
        &self,
        database_id: &DocumentId,
        collection: &str,
        input: impl Into<DocumentInput>,
    ) -> Result<Vec<DocumentId>> {
        let (record, def) = self.metadata.collection(database_id, collection).await?;

        let mut docs = input.into().into_vec();
        for doc in &mut docs {
            strip_identity(doc);
            check_declared(&def, doc)?;
        }
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .storage
            .insert_many(None, &record.database_name, collection, docs)
            .await?;
        record_documents_written("insert", ids.len() as u64);
        debug!(database = %record.database_name, collection, count = ids.len(), "Documents inserted");
        Ok(ids)
    }

    /// Matching documents, one page at a time, with identities rendered as
    /// strings under `_id`.
    #[instrument(skip(self, filter))]
    pub async fn list_documents(
        &self,
        database_id: &DocumentId,
        collection: &str,
        filter: Document,
        page: PageRequest,
    ) -> Result<Page<Document>> {
        let filter = build_filter(filter, true)?;
        let record = self.resolve(database_id, collection).await?;
        let page = page.normalized(&self.pagination);
        let db = &record.database_name;

        let total = self
            .storage
            .count_documents(None, db, collection, &filter)
            .await?;
        let items = self
            .storage
            .find(
                None,
                db,
                collection,
                &filter,
                FindOptions::page(page.skip(), page.page_size),
            )
            .await?;

        Ok(Page {
            total,
            page: page.page,
            page_size: page.page_size,
            items,
        }
        .map(|doc| doc.render()))
    }

    /// Partial update of every match, returning the number of documents
    /// that changed.
    ///
    /// Only fields a document already has are updated. A key in `update`
    /// that a matched document lacks stays absent on that document, so
    /// ad-hoc updates cannot grow new fields.
    #[instrument(skip(self, filter, update))]
    pub async fn update_documents(
        &self,
        database_id: &DocumentId,
        collection: &str,
        filter: Document,
        mut update: Document,
    ) -> Result<u64> {
        strip_identity(&mut update);
        if update.is_empty() {
            return Err(Error::EmptyUpdate);
        }
        let filter = build_filter(filter, false)?;
        let record = self.resolve(database_id, collection).await?;

        let result = self
            .storage
            .update_many(
                None,
                &record.database_name,
                collection,
                &filter,
                &Update::SetExisting(update),
            )
            .await?;
        record_documents_written("update", result.modified_count);
        Ok(result.modified_count)
    }

    /// Soft delete flags matches with `is_deleted`/`deleted_at` and returns
    /// how many were newly flagged. Hard delete removes them and returns
    /// how many were removed.
    #[instrument(skip(self, filter))]
    pub async fn delete_documents(
        &self,
        database_id: &DocumentId,
        collection: &str,
        filter: Document,
        soft: bool,
    ) -> Result<u64> {
        let filter = build_filter(filter, soft)?;
        let record = self.resolve(database_id, collection).await?;
        let db = &record.database_name;

        let count = if soft {
            let mut flags = Document::new();
            flags.insert(IS_DELETED.to_string(), Value::Bool(true));
            flags.insert(DELETED_AT.to_string(), json!(Utc::now().to_rfc3339()));
            self.storage
                .update_many(None, db, collection, &filter, &Update::Set(flags))
                .await?
                .modified_count
        } else {
            self.storage.delete_many(None, db, collection, &filter).await?
        };

        record_documents_written(if soft { "soft_delete" } else { "delete" }, count);
        Ok(count)
    }

    async fn resolve(&self, database_id: &DocumentId, collection: &str) -> Result<CatalogRecord> {
        Ok(self.metadata.collection(database_id, collection).await?.0)
    }
}

fn check_declared(def: &CollectionDef, doc: &Document) -> Result<()> {
    match doc
        .keys()
        .find(|key| !def.declares(key) && !STATUS_FIELDS.contains(&key.as_str()))
    {
        Some(field) => Err(Error::UndeclaredField {
            collection: def.name.clone(),
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

/// Splits a caller filter into identity clauses and field predicates.
/// With `hide_deleted`, soft-deleted documents are excluded unless the
/// filter constrains `is_deleted` itself.
fn build_filter(raw: Document, hide_deleted: bool) -> Result<Filter> {
    let mut filter = Filter::all();
    for (key, value) in raw {
        if ID_ALIASES.contains(&key.as_str()) {
            filter.ids.extend(id_clauses(&value)?);
        } else {
            filter.fields.insert(key, value);
        }
    }
    if hide_deleted && !filter.has_field(IS_DELETED) {
        filter = filter.field(IS_DELETED, json!({"$ne": true}));
    }
    Ok(filter)
}

/// `"<id>"`, `{"$eq": "<id>"}`, `{"$ne": "<id>"}` or `{"$in": ["<id>", ...]}`.
/// An empty operator object is rejected rather than read as "any id";
/// `{"$in": []}` is accepted and matches nothing.
fn id_clauses(value: &Value) -> Result<Vec<IdClause>> {
    let Value::Object(ops) = value else {
        return Ok(vec![IdClause::Eq(DocumentId::from_value(value)?)]);
    };
    if ops.is_empty() {
        return Err(Error::InvalidIdentifier(
            "identifier filter has no operator".to_string(),
        ));
    }
    ops.iter()
        .map(|(op, operand)| match op.as_str() {
            "$eq" => Ok(IdClause::Eq(DocumentId::from_value(operand)?)),
            "$ne" => Ok(IdClause::Ne(DocumentId::from_value(operand)?)),
            "$in" => operand
                .as_array()
                .ok_or_else(|| Error::InvalidIdentifier("$in expects an array of ids".to_string()))?
                .iter()
                .map(DocumentId::from_value)
                .collect::<Result<Vec<_>>>()
                .map(IdClause::In),
            other => Err(Error::InvalidIdentifier(format!(
                "operator {} is not supported on identifiers",
                other
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_filter_hides_soft_deleted_by_default() -> Result<()> {
        let filter = build_filter(doc(json!({"name": "a"})), true)?;
        assert_eq!(filter.fields.get(IS_DELETED), Some(&json!({"$ne": true})));

        let explicit = build_filter(doc(json!({"is_deleted": true})), true)?;
        assert_eq!(explicit.fields.get(IS_DELETED), Some(&json!(true)));

        let raw = build_filter(doc(json!({"name": "a"})), false)?;
        assert!(!raw.has_field(IS_DELETED));
        Ok(())
    }

    #[test]
    fn test_identifier_normalization() -> Result<()> {
        let a = DocumentId::new();
        let b = DocumentId::new();

        let filter = build_filter(doc(json!({"id": a.to_string()})), false)?;
        assert_eq!(filter.ids, vec![IdClause::Eq(a)]);
        assert!(filter.fields.is_empty());

        let filter = build_filter(
            doc(json!({"_id": {"$in": [a.to_string(), b.to_string()]}})),
            false,
        )?;
        assert_eq!(filter.ids, vec![IdClause::In(vec![a, b])]);

        let none = build_filter(doc(json!({"_id": {"$in": []}})), false)?;
        assert_eq!(none.ids, vec![IdClause::In(vec![])]);
        assert!(!none.matches(&a, &Document::new()));
        Ok(())
    }

    #[test]
    fn test_bad_identifiers() {
        for bad in [
            json!({"_id": "nope"}),
            json!({"id": 7}),
            json!({"_id": {"$gt": "x"}}),
            json!({"_id": {"$in": "x"}}),
            json!({"_id": {}}),
            json!({"id": {}}),
        ] {
            let err = build_filter(doc(bad), true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);
        }
    }

    #[test]
    fn test_declared_fields() {
        let def = CollectionDef::new(
            "users",
            vec![crate::catalog::FieldDef::new(
                "username",
                crate::catalog::FieldType::String,
            )],
        );
        assert!(check_declared(&def, &doc(json!({"username": "a", "is_deleted": false}))).is_ok());
        let err = check_declared(&def, &doc(json!({"username": "a", "bio": "x"}))).unwrap_err();
        assert_eq!(
            err,
            Error::UndeclaredField {
                collection: "users".into(),
                field: "bio".into()
            }
        );
    }

    #[test]
    fn test_document_input_accepts_one_or_many() -> Result<()> {
        let one: DocumentInput = serde_json::from_value(json!({"a": 1}))?;
        assert_eq!(one.into_vec().len(), 1);
        let many: DocumentInput = serde_json::from_value(json!([{"a": 1}, {"a": 2}]))?;
        assert_eq!(many.into_vec().len(), 2);
        Ok(())
    }
}
