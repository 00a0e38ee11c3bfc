//! Structured predicates and update operations understood by the
//! storage driver.
//!
//! A [`Filter`] has two parts: typed identity clauses, compared against the
//! engine's native [`DocumentId`], and field predicates over the document
//! body. Field predicates follow the usual document-store conventions:
//!
//! ```text
//! {"status": "open"}                      equality (missing field == null)
//! {"profile.age": {"$gte": 18}}           dotted path into nested objects
//! {"tags": "rust"}                        array fields match any element
//! {"$or": [{"a": 1}, {"b": {"$ne": 2}}]}  logical combinators
//! ```
//!
//! Supported operators: `$eq $ne $gt $gte $lt $lte $in $nin $exists`.
//! Unknown operators never match.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::document::{Document, DocumentId};

/// Predicate on the engine-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdClause {
    Eq(DocumentId),
    Ne(DocumentId),
    In(Vec<DocumentId>),
}

impl IdClause {
    fn matches(&self, id: &DocumentId) -> bool {
        match self {
            IdClause::Eq(expected) => expected == id,
            IdClause::Ne(excluded) => excluded != id,
            IdClause::In(ids) => ids.contains(id),
        }
    }
}

/// Structured predicate over stored documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub ids: Vec<IdClause>,
    pub fields: Document,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: DocumentId) -> Self {
        Self {
            ids: vec![IdClause::Eq(id)],
            fields: Document::new(),
        }
    }

    /// Field predicates only; no identity normalization is applied.
    pub fn from_fields(fields: Document) -> Self {
        Self {
            ids: Vec::new(),
            fields,
        }
    }

    pub fn with_id(mut self, clause: IdClause) -> Self {
        self.ids.push(clause);
        self
    }

    pub fn field(mut self, path: impl Into<String>, condition: impl Into<Value>) -> Self {
        self.fields.insert(path.into(), condition.into());
        self
    }

    pub fn has_field(&self, path: &str) -> bool {
        self.fields.contains_key(path)
    }

    pub fn matches(&self, id: &DocumentId, body: &Document) -> bool {
        self.ids.iter().all(|clause| clause.matches(id)) && predicates_match(&self.fields, body)
    }
}

fn predicates_match(predicates: &Document, body: &Document) -> bool {
    predicates.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_predicates(condition).all(|p| predicates_match(p, body)),
        "$or" => sub_predicates(condition).any(|p| predicates_match(p, body)),
        "$nor" => !sub_predicates(condition).any(|p| predicates_match(p, body)),
        path => condition_matches(lookup(body, path), condition),
    })
}

fn sub_predicates(condition: &Value) -> impl Iterator<Item = &Document> {
    condition
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// Resolves a dotted path into nested objects.
pub fn lookup<'a>(body: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = body.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn condition_matches(value: Option<&Value>, condition: &Value) -> bool {
    if let Value::Object(ops) = condition {
        if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| operator_matches(value, op, operand));
        }
    }
    equals(value, condition)
}

fn operator_matches(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => compare(value, operand).is_some_and(|o| o == Ordering::Greater),
        "$gte" => compare(value, operand).is_some_and(|o| o != Ordering::Less),
        "$lt" => compare(value, operand).is_some_and(|o| o == Ordering::Less),
        "$lte" => compare(value, operand).is_some_and(|o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| equals(value, c))),
        "$nin" => operand
            .as_array()
            .is_some_and(|candidates| !candidates.iter().any(|c| equals(value, c))),
        "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
        _ => false,
    }
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|i| i == expected),
        Some(Value::Number(a)) => match expected {
            Value::Number(b) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        Some(actual) => actual == expected,
    }
}

fn compare(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (value?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Partial update applied to every matched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    /// Set the named top-level fields, creating them when absent.
    Set(Document),
    /// Remove the named top-level fields.
    Unset(Vec<String>),
    /// For each named field: set it when it already exists on the document,
    /// otherwise remove it. Keeps ad-hoc updates from growing new fields.
    SetExisting(Document),
}

impl Update {
    pub fn is_empty(&self) -> bool {
        match self {
            Update::Set(fields) | Update::SetExisting(fields) => fields.is_empty(),
            Update::Unset(names) => names.is_empty(),
        }
    }

    /// Applies the update in place, returning whether the body changed.
    pub fn apply(&self, body: &mut Document) -> bool {
        let mut changed = false;
        match self {
            Update::Set(fields) => {
                for (key, value) in fields {
                    if body.get(key) != Some(value) {
                        body.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
            }
            Update::Unset(names) => {
                for name in names {
                    changed |= body.remove(name).is_some();
                }
            }
            Update::SetExisting(fields) => {
                for (key, value) in fields {
                    match body.get_mut(key) {
                        Some(current) if current != value => {
                            *current = value.clone();
                            changed = true;
                        }
                        Some(_) => {}
                        // Absent: the REMOVE branch is a no-op on this body.
                        None => {}
                    }
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_equality_and_missing_fields() {
        let id = DocumentId::new();
        let body = doc(json!({"name": "a", "age": 30}));

        assert!(Filter::all().matches(&id, &body));
        assert!(Filter::all().field("name", "a").matches(&id, &body));
        assert!(!Filter::all().field("name", "b").matches(&id, &body));
        assert!(Filter::all().field("missing", Value::Null).matches(&id, &body));
        assert!(Filter::all().field("age", 30.0).matches(&id, &body));
    }

    #[test]
    fn test_operators() {
        let id = DocumentId::new();
        let body = doc(json!({"age": 30, "tags": ["x", "y"], "is_deleted": true}));

        let matches = |cond: Value| Filter::from_fields(doc(cond)).matches(&id, &body);
        assert!(matches(json!({"age": {"$gte": 30, "$lt": 40}})));
        assert!(!matches(json!({"age": {"$gt": 30}})));
        assert!(matches(json!({"age": {"$in": [1, 30]}})));
        assert!(matches(json!({"age": {"$nin": [1, 2]}})));
        assert!(matches(json!({"tags": "y"})));
        assert!(matches(json!({"missing": {"$exists": false}})));
        assert!(!matches(json!({"is_deleted": {"$ne": true}})));
        assert!(!matches(json!({"age": {"$regex": "3"}})));
    }

    #[test]
    fn test_ne_true_matches_absent_flag() {
        let id = DocumentId::new();
        let live = doc(json!({"name": "a"}));
        let filter = Filter::all().field("is_deleted", json!({"$ne": true}));
        assert!(filter.matches(&id, &live));
    }

    #[test]
    fn test_nested_paths_and_combinators() {
        let id = DocumentId::new();
        let body = doc(json!({"profile": {"city": "Berlin", "age": 41}}));

        assert!(Filter::all().field("profile.city", "Berlin").matches(&id, &body));
        assert!(!Filter::all().field("profile.zip", "1").matches(&id, &body));

        let either = Filter::from_fields(doc(json!({
            "$or": [{"profile.city": "Paris"}, {"profile.age": {"$gt": 40}}]
        })));
        assert!(either.matches(&id, &body));
    }

    #[test]
    fn test_id_clauses() {
        let id = DocumentId::new();
        let other = DocumentId::new();
        let body = Document::new();

        assert!(Filter::by_id(id).matches(&id, &body));
        assert!(!Filter::by_id(other).matches(&id, &body));
        assert!(Filter::all()
            .with_id(IdClause::In(vec![other, id]))
            .matches(&id, &body));
        assert!(!Filter::all().with_id(IdClause::Ne(id)).matches(&id, &body));
    }

    #[test]
    fn test_set_existing_only_touches_present_fields() {
        let mut body = doc(json!({"username": "a"}));
        let update = Update::SetExisting(doc(json!({"username": "c", "bio": "x"})));

        assert!(update.apply(&mut body));
        assert_eq!(body, doc(json!({"username": "c"})));
        assert!(!update.apply(&mut body));
    }

    #[test]
    fn test_set_and_unset() {
        let mut body = doc(json!({"a": 1}));
        assert!(Update::Set(doc(json!({"b": 2}))).apply(&mut body));
        assert!(!Update::Set(doc(json!({"b": 2}))).apply(&mut body));
        assert!(Update::Unset(vec!["a".into()]).apply(&mut body));
        assert_eq!(body, doc(json!({"b": 2})));
    }
}
