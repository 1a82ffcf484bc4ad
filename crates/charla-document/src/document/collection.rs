//! Collection management for document store

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::catalog::{AccessPath, IndexCatalog, RegisterOutcome};
use super::document::{unix_now, Document, DocumentId};
use super::index::{IndexSpec, IndexStats};
use super::query::DocumentQuery;
use super::schema::CollectionSchema;
use super::update::UpdateOperation;
use super::DocumentStoreError;

/// Size and shape limits applied to every stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentLimits {
    /// Maximum encoded size in bytes
    pub max_document_size: usize,
    /// Maximum nesting depth
    pub max_nesting_depth: usize,
}

impl Default for DocumentLimits {
    fn default() -> Self {
        Self {
            max_document_size: 16 * 1024 * 1024, // 16MB like MongoDB
            max_nesting_depth: 100,
        }
    }
}

impl DocumentLimits {
    /// Validate a document against the limits
    pub fn check(&self, doc: &serde_json::Value) -> Result<(), DocumentStoreError> {
        let doc_size = serde_json::to_vec(doc)
            .map_err(|e| DocumentStoreError::InvalidDocument(e.to_string()))?
            .len();

        if doc_size > self.max_document_size {
            return Err(DocumentStoreError::DocumentTooLarge {
                size: doc_size,
                max: self.max_document_size,
            });
        }

        let depth = Self::calculate_depth(doc);
        if depth > self.max_nesting_depth {
            return Err(DocumentStoreError::NestingTooDeep {
                depth,
                max: self.max_nesting_depth,
            });
        }

        Ok(())
    }

    /// Calculate nesting depth of a JSON value
    fn calculate_depth(value: &serde_json::Value) -> usize {
        match value {
            serde_json::Value::Object(map) => {
                1 + map.values().map(Self::calculate_depth).max().unwrap_or(0)
            }
            serde_json::Value::Array(arr) => {
                1 + arr.iter().map(Self::calculate_depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Point-in-time view of the documents a scan may return
///
/// Holds shared references only; iterating it takes no lock.
#[derive(Debug, Clone)]
pub struct Snapshot {
    candidates: Vec<Arc<Document>>,
    filter: DocumentQuery,
    access_path: AccessPath,
}

impl Snapshot {
    /// Build a snapshot from candidate documents and the filter they must pass
    pub fn new(
        candidates: Vec<Arc<Document>>,
        filter: DocumentQuery,
        access_path: AccessPath,
    ) -> Self {
        Self {
            candidates,
            filter,
            access_path,
        }
    }

    /// How the candidates were located
    pub fn access_path(&self) -> &AccessPath {
        &self.access_path
    }

    /// Number of candidates before filtering
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Lazily yield the candidates that satisfy the scan filter
    pub fn into_matches(self) -> impl Iterator<Item = Arc<Document>> {
        let filter = self.filter;
        self.candidates
            .into_iter()
            .filter(move |doc| filter.matches_document(doc))
    }
}

#[derive(Debug)]
struct CollectionState {
    documents: BTreeMap<DocumentId, Arc<Document>>,
    catalog: IndexCatalog,
}

/// A collection of documents
///
/// Each collection owns its lock. Writers hold it only while validating and
/// swapping a single document; readers only while copying out `Arc`s.
#[derive(Debug)]
pub struct Collection {
    name: String,
    schema: CollectionSchema,
    limits: DocumentLimits,
    state: RwLock<CollectionState>,
}

impl Collection {
    /// Create a new collection
    pub fn new(
        name: &str,
        schema: CollectionSchema,
        limits: DocumentLimits,
    ) -> Result<Self, DocumentStoreError> {
        Ok(Self {
            name: name.to_string(),
            schema,
            limits,
            state: RwLock::new(CollectionState {
                documents: BTreeMap::new(),
                catalog: IndexCatalog::new(name)?,
            }),
        })
    }

    /// Get collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the collection schema
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Get document count
    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    /// Whether the collection holds no documents
    pub fn is_empty(&self) -> bool {
        self.state.read().documents.is_empty()
    }

    /// Insert a document
    ///
    /// Every check runs before the document becomes visible.
    pub fn insert(&self, doc: Document) -> Result<DocumentId, DocumentStoreError> {
        self.limits.check(&doc.data)?;
        self.schema.validate(&doc)?;

        let mut state = self.state.write();

        if state.documents.contains_key(&doc.id) {
            return Err(DocumentStoreError::ValidationError(format!(
                "duplicate _id {} in {}",
                doc.id, self.name
            )));
        }
        state.catalog.check_unique(&doc)?;

        state.catalog.insert(&doc);
        let id = doc.id.clone();
        state.documents.insert(id.clone(), Arc::new(doc));

        Ok(id)
    }

    /// Get a document by id
    pub fn get(&self, id: &DocumentId) -> Option<Arc<Document>> {
        self.state.read().documents.get(id).cloned()
    }

    /// Snapshot the documents that may satisfy `filter`
    pub fn scan(&self, filter: &DocumentQuery) -> Snapshot {
        let state = self.state.read();

        let (candidates, access_path) = match state.catalog.choose_index(filter) {
            Ok(choice) => {
                let candidates = state
                    .catalog
                    .lookup(&choice)
                    .iter()
                    .filter_map(|id| state.documents.get(id).cloned())
                    .collect();
                (candidates, AccessPath::Index(choice.name))
            }
            Err(_) => (state.documents.values().cloned().collect(), AccessPath::FullScan),
        };

        Snapshot::new(candidates, filter.clone(), access_path)
    }

    /// Count documents matching a query
    pub fn count(&self, filter: &DocumentQuery) -> usize {
        if filter.is_empty() {
            return self.len();
        }
        self.scan(filter).into_matches().count()
    }

    /// Apply an update to one document
    ///
    /// The update runs on a copy; on any failure the stored document and its
    /// index entries are unchanged.
    pub fn update(
        &self,
        id: &DocumentId,
        update: &UpdateOperation,
    ) -> Result<Arc<Document>, DocumentStoreError> {
        let mut state = self.state.write();

        let current = state
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| DocumentStoreError::DocumentNotFound(id.to_string()))?;

        let mut next = Document::clone(&current);
        update.apply(&mut next.data)?;
        self.limits.check(&next.data)?;
        self.schema.validate(&next)?;
        state.catalog.check_unique(&next)?;

        next.version += 1;
        next.updated_at = unix_now();

        state.catalog.remove(&current);
        state.catalog.insert(&next);

        let next = Arc::new(next);
        state.documents.insert(id.clone(), Arc::clone(&next));
        Ok(next)
    }

    /// Register an index, building it over the current documents
    pub fn create_index(&self, spec: IndexSpec) -> Result<RegisterOutcome, DocumentStoreError> {
        let mut state = self.state.write();
        let CollectionState { documents, catalog } = &mut *state;
        catalog.register(spec, documents.values().map(|doc| &**doc))
    }

    /// Registered index specifications
    pub fn list_indexes(&self) -> Vec<IndexSpec> {
        self.state.read().catalog.list()
    }

    /// Statistics for every registered index
    pub fn index_stats(&self) -> Vec<IndexStats> {
        let state = self.state.read();
        state
            .catalog
            .list()
            .iter()
            .filter_map(|spec| state.catalog.stats(&spec.name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chats() -> Collection {
        let collection = Collection::new(
            "chats",
            CollectionSchema::new(["created_at", "participants.alias"], &["created_at"]),
            DocumentLimits::default(),
        )
        .unwrap();
        collection
            .create_index(
                IndexSpec::new("chats", "unique-participant")
                    .asc("_id")
                    .asc("participants.alias")
                    .unique(),
            )
            .unwrap();
        collection
    }

    fn chat(id: &str, aliases: &[&str]) -> Document {
        let participants: Vec<_> = aliases.iter().map(|a| json!({ "alias": a })).collect();
        Document::from_json(json!({ "_id": id, "created_at": 1, "participants": participants }))
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let collection = chats();
        let id = collection.insert(chat("c1", &["Ana"])).unwrap();
        assert_eq!(collection.get(&id).unwrap().id, id);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let collection = chats();
        collection.insert(chat("c1", &["Ana"])).unwrap();
        assert!(matches!(
            collection.insert(chat("c1", &["Leo"])),
            Err(DocumentStoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let collection = chats();
        let doc = Document::from_json(json!({ "_id": "c1" })).unwrap();
        assert!(matches!(
            collection.insert(doc),
            Err(DocumentStoreError::ValidationError(_))
        ));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_update_violating_unique_leaves_document() {
        let collection = chats();
        let id = collection.insert(chat("c1", &["Ana"])).unwrap();

        let result = collection.update(
            &id,
            &UpdateOperation::new().push("participants", json!({ "alias": "Ana" })),
        );
        assert!(matches!(result, Err(DocumentStoreError::ValidationError(_))));

        let stored = collection.get(&id).unwrap();
        assert_eq!(stored.data["participants"].as_array().unwrap().len(), 1);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_update_reindexes() {
        let collection = chats();
        collection
            .create_index(IndexSpec::new("chats", "aliases").asc("participants.alias"))
            .unwrap();
        let id = collection.insert(chat("c1", &["Ana"])).unwrap();

        collection
            .update(&id, &UpdateOperation::new().push("participants", json!({ "alias": "Leo" })))
            .unwrap();

        let snapshot = collection.scan(&DocumentQuery::new().eq("participants.alias", "Leo"));
        assert_eq!(snapshot.access_path(), &AccessPath::Index("aliases".into()));
        assert_eq!(snapshot.into_matches().count(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let collection = chats();
        let id = collection.insert(chat("c1", &["Ana"])).unwrap();
        let snapshot = collection.scan(&DocumentQuery::new());

        collection
            .update(&id, &UpdateOperation::new().push("participants", json!({ "alias": "Leo" })))
            .unwrap();

        let docs: Vec<_> = snapshot.into_matches().collect();
        assert_eq!(docs[0].data["participants"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_full_scan_when_no_index_matches() {
        let collection = chats();
        collection.insert(chat("c1", &["Ana"])).unwrap();
        let since = DocumentQuery::from_json(json!({ "created_at": { "$gte": 0 } })).unwrap();
        let snapshot = collection.scan(&since);
        assert_eq!(snapshot.access_path(), &AccessPath::FullScan);
        assert_eq!(collection.count(&since), 1);
    }

    #[test]
    fn test_document_size_limit() {
        let collection = Collection::new(
            "test",
            CollectionSchema::default(),
            DocumentLimits {
                max_document_size: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let large_doc = Document::from_json(json!({ "data": "x".repeat(200) })).unwrap();
        assert!(matches!(
            collection.insert(large_doc),
            Err(DocumentStoreError::DocumentTooLarge { .. })
        ));
    }
}
