//! Per-collection index catalog: registration, maintenance and access-path
//! selection

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::document::{Document, DocumentId};
use super::index::{DocumentIndex, IndexSpec, IndexStats};
use super::query::DocumentQuery;
use super::DocumentStoreError;

/// Name of the index every collection carries on `_id`
pub const ID_INDEX: &str = "_id_";

/// Result of registering an index specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// The index was built
    Created,
    /// An identical specification was already registered
    AlreadyExists,
}

/// How a scan reached its candidate documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPath {
    /// Prefix lookup on the named index
    Index(String),
    /// Every document in the collection
    FullScan,
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(name) => write!(f, "index:{}", name),
            Self::FullScan => write!(f, "full-scan"),
        }
    }
}

/// A selected index and the equality values bound to its leading keys
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChoice {
    /// Index name
    pub name: String,
    /// Values for the leading key fields, in key order
    pub prefix: Vec<serde_json::Value>,
}

/// The indexes declared on one collection
#[derive(Debug, Clone)]
pub struct IndexCatalog {
    collection: String,
    indexes: BTreeMap<String, DocumentIndex>,
}

impl IndexCatalog {
    /// Create a catalog holding only the `_id` index
    pub fn new(collection: &str) -> Result<Self, DocumentStoreError> {
        let mut indexes = BTreeMap::new();
        let id_index =
            DocumentIndex::new(IndexSpec::new(collection, ID_INDEX).asc("_id").unique())?;
        indexes.insert(ID_INDEX.to_string(), id_index);

        Ok(Self {
            collection: collection.to_string(),
            indexes,
        })
    }

    /// Register an index and build it over `documents`
    ///
    /// Identical re-registration is a no-op. The same key pattern and partial
    /// filter under a second name is an `IndexError`. A unique index that the
    /// existing documents already violate is rejected and leaves the catalog
    /// untouched.
    pub fn register<'a>(
        &mut self,
        spec: IndexSpec,
        documents: impl IntoIterator<Item = &'a Document>,
    ) -> Result<RegisterOutcome, DocumentStoreError> {
        if spec.collection != self.collection {
            return Err(DocumentStoreError::IndexError(format!(
                "index {} targets collection {} but was registered on {}",
                spec.name, spec.collection, self.collection
            )));
        }

        if let Some(existing) = self.indexes.get(&spec.name) {
            if existing.spec() == &spec {
                debug!(
                    collection = %self.collection,
                    index = %spec.name,
                    "index already registered"
                );
                return Ok(RegisterOutcome::AlreadyExists);
            }
            return Err(DocumentStoreError::IndexError(format!(
                "index {} already exists on {} with a different definition",
                spec.name, self.collection
            )));
        }

        if let Some(existing) = self.indexes.values().find(|index| {
            index.spec().keys == spec.keys && index.spec().partial_filter == spec.partial_filter
        }) {
            return Err(DocumentStoreError::IndexError(format!(
                "index {} on {} duplicates the keys of index {}",
                spec.name,
                self.collection,
                existing.name()
            )));
        }

        let mut index = DocumentIndex::new(spec)?;
        for doc in documents {
            index.check_unique(doc)?;
            index.insert(doc);
        }

        debug!(
            collection = %self.collection,
            index = %index.name(),
            entries = index.stats().entry_count,
            "index built"
        );
        self.indexes.insert(index.name().to_string(), index);
        Ok(RegisterOutcome::Created)
    }

    /// Pick the index whose leading keys are bound by the most equality
    /// conditions of `query`
    ///
    /// Ties prefer the index with fewer keys, then the smaller name. Partial
    /// indexes qualify only when the query restates their filter.
    pub fn choose_index(&self, query: &DocumentQuery) -> Result<IndexChoice, DocumentStoreError> {
        let equalities: BTreeMap<String, serde_json::Value> = query
            .equality_fields()
            .into_iter()
            .filter(|(_, value)| !value.is_array() && !value.is_object())
            .collect();

        let mut best: Option<(&DocumentIndex, Vec<serde_json::Value>)> = None;

        for index in self.indexes.values() {
            if !Self::partial_filter_implied(index, &equalities) {
                continue;
            }

            let prefix: Vec<serde_json::Value> = index
                .spec()
                .fields()
                .map_while(|field| equalities.get(field).cloned())
                .collect();
            if prefix.is_empty() {
                continue;
            }

            let better = match &best {
                None => true,
                Some((current, current_prefix)) => {
                    (Reverse(prefix.len()), index.spec().keys.len(), index.name())
                        < (
                            Reverse(current_prefix.len()),
                            current.spec().keys.len(),
                            current.name(),
                        )
                }
            };
            if better {
                best = Some((index, prefix));
            }
        }

        match best {
            Some((index, prefix)) => {
                debug!(
                    collection = %self.collection,
                    index = %index.name(),
                    bound_keys = prefix.len(),
                    "index selected"
                );
                Ok(IndexChoice {
                    name: index.name().to_string(),
                    prefix,
                })
            }
            None => Err(DocumentStoreError::NoIndexAvailable(format!(
                "no index on {} matches fields {:?}",
                self.collection,
                equalities.keys().collect::<Vec<_>>()
            ))),
        }
    }

    fn partial_filter_implied(
        index: &DocumentIndex,
        equalities: &BTreeMap<String, serde_json::Value>,
    ) -> bool {
        let Some(filter) = index.partial_filter() else {
            return true;
        };
        let required = filter.equality_fields();
        // Non-equality partial conditions cannot be proven from the query
        required.len() == filter.get_fields().len()
            && required
                .iter()
                .all(|(field, value)| equalities.get(field) == Some(value))
    }

    /// Candidate document ids for a chosen index, in index order
    pub fn lookup(&self, choice: &IndexChoice) -> Vec<DocumentId> {
        self.indexes
            .get(&choice.name)
            .map(|index| index.lookup_prefix(&choice.prefix))
            .unwrap_or_default()
    }

    /// Check every unique index for `doc`
    pub fn check_unique(&self, doc: &Document) -> Result<(), DocumentStoreError> {
        for index in self.indexes.values() {
            index.check_unique(doc)?;
        }
        Ok(())
    }

    /// Add a document to every index
    pub fn insert(&mut self, doc: &Document) {
        for index in self.indexes.values_mut() {
            index.insert(doc);
        }
    }

    /// Remove a document from every index
    pub fn remove(&mut self, doc: &Document) {
        for index in self.indexes.values_mut() {
            index.remove(doc);
        }
    }

    /// Registered specifications, ordered by name
    pub fn list(&self) -> Vec<IndexSpec> {
        self.indexes.values().map(|i| i.spec().clone()).collect()
    }

    /// Statistics for one index
    pub fn stats(&self, name: &str) -> Option<IndexStats> {
        self.indexes.get(name).map(DocumentIndex::stats)
    }

    /// Number of registered indexes, `_id` included
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Always false: the `_id` index cannot be removed
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages_catalog() -> IndexCatalog {
        let mut catalog = IndexCatalog::new("messages").unwrap();
        let specs = [
            IndexSpec::new("messages", "chat-timeline").asc("chat_id").asc("timestamp"),
            IndexSpec::new("messages", "private-thread")
                .asc("chat_id")
                .asc("type")
                .asc("sender")
                .asc("recipient"),
            IndexSpec::new("messages", "sender-per-chat").asc("chat_id").asc("sender"),
        ];
        for spec in specs {
            catalog.register(spec, std::iter::empty()).unwrap();
        }
        catalog
    }

    #[test]
    fn test_choose_longest_prefix() {
        let catalog = messages_catalog();

        let query = DocumentQuery::new().eq("chat_id", "c1").eq("type", "private");
        assert_eq!(catalog.choose_index(&query).unwrap().name, "private-thread");

        let query = DocumentQuery::new().eq("chat_id", "c1").eq("sender", "Ana");
        assert_eq!(catalog.choose_index(&query).unwrap().name, "sender-per-chat");
    }

    #[test]
    fn test_choose_tie_prefers_fewer_keys_then_name() {
        let catalog = messages_catalog();
        let choice = catalog.choose_index(&DocumentQuery::new().eq("chat_id", "c1")).unwrap();
        assert_eq!(choice.name, "chat-timeline");
        assert_eq!(choice.prefix, vec![json!("c1")]);
    }

    #[test]
    fn test_no_index_available() {
        let catalog = messages_catalog();
        let query = DocumentQuery::from_json(json!({ "timestamp": { "$gte": 3 } })).unwrap();
        assert!(matches!(
            catalog.choose_index(&query),
            Err(DocumentStoreError::NoIndexAvailable(_))
        ));
    }

    #[test]
    fn test_partial_index_requires_filter_in_query() {
        let mut catalog = IndexCatalog::new("chats").unwrap();
        catalog
            .register(
                IndexSpec::new("chats", "active-participants")
                    .asc("participants.alias")
                    .partial(json!({ "participants.active": true })),
                std::iter::empty(),
            )
            .unwrap();

        let only_alias = DocumentQuery::new().eq("participants.alias", "Ana");
        assert!(catalog.choose_index(&only_alias).is_err());

        let with_filter = only_alias.eq("participants.active", true);
        assert_eq!(catalog.choose_index(&with_filter).unwrap().name, "active-participants");
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut catalog = messages_catalog();
        let before = catalog.len();
        let outcome = catalog
            .register(
                IndexSpec::new("messages", "chat-timeline").asc("chat_id").asc("timestamp"),
                std::iter::empty(),
            )
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyExists);
        assert_eq!(catalog.len(), before);
    }

    #[test]
    fn test_register_conflicting_definition() {
        let mut catalog = messages_catalog();
        let result = catalog.register(
            IndexSpec::new("messages", "chat-timeline").asc("chat_id").desc("timestamp"),
            std::iter::empty(),
        );
        assert!(matches!(result, Err(DocumentStoreError::IndexError(_))));
    }

    #[test]
    fn test_register_same_keys_under_new_name() {
        let mut catalog = messages_catalog();
        let before = catalog.len();

        let result = catalog.register(
            IndexSpec::new("messages", "timeline-again").asc("chat_id").asc("timestamp"),
            std::iter::empty(),
        );
        assert!(matches!(result, Err(DocumentStoreError::IndexError(_))));
        assert!(catalog.stats("timeline-again").is_none());

        // A different direction is a different key pattern
        let outcome = catalog
            .register(
                IndexSpec::new("messages", "timeline-desc").asc("chat_id").desc("timestamp"),
                std::iter::empty(),
            )
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);
        assert_eq!(catalog.len(), before + 1);
    }

    #[test]
    fn test_register_unique_over_violating_documents() {
        let mut catalog = IndexCatalog::new("messages").unwrap();
        let docs = vec![
            Document::from_json(json!({ "_id": "m1", "sender": "Ana" })).unwrap(),
            Document::from_json(json!({ "_id": "m2", "sender": "Ana" })).unwrap(),
        ];
        let spec = IndexSpec::new("messages", "one-per-sender").asc("sender").unique();
        let result = catalog.register(spec, &docs);
        assert!(matches!(result, Err(DocumentStoreError::ValidationError(_))));
        assert!(catalog.stats("one-per-sender").is_none());
    }
}
