//! JSON Document Store - indexed collections with aggregation pipelines
//!
//! This module provides an in-memory document database supporting:
//! - JSON document storage with per-collection schemas
//! - MongoDB-style filter predicates
//! - Secondary indexes (compound, multi-key, partial, unique)
//! - Aggregation pipelines validated before execution
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Document Store                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐      ┌──────────────────────┐     │
//! │  │ Collection  chats    │      │ Collection  messages │     │
//! │  │ RwLock<docs+catalog> │      │ RwLock<docs+catalog> │     │
//! │  └──────────────────────┘      └──────────────────────┘     │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Index Catalog (per collection, choose_index)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │      Aggregation Engine (lazy stages over a snapshot)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use charla_document::document::{
//!     aggregate, AggregateOptions, AggregationPipeline, CollectionSchema, DocumentStore,
//!     DocumentStoreConfig,
//! };
//! use serde_json::json;
//!
//! let store = DocumentStore::new(DocumentStoreConfig::default());
//! store.create_collection("messages", CollectionSchema::default()).await?;
//! store.insert("messages", json!({ "chat_id": "c1", "sender": "Ana" })).await?;
//!
//! let pipeline = AggregationPipeline::from_json(vec![
//!     json!({ "$match": { "chat_id": "c1" } }),
//!     json!({ "$group": { "_id": "$sender", "count": { "$sum": 1 } } }),
//!     json!({ "$sort": { "count": -1, "_id": 1 } }),
//! ])?;
//! let results = aggregate(&store, "messages", &pipeline, &AggregateOptions::default()).await?;
//! ```

pub mod aggregation;
pub mod backend;
pub mod catalog;
pub mod collection;
#[allow(clippy::module_inception)]
pub mod document;
pub mod index;
pub mod query;
pub mod schema;
pub mod update;

pub use aggregation::{
    aggregate, Accumulator, AggregateOptions, AggregationPipeline, CancellationHandle, Expression,
    GroupSpec, PipelineStage, ProjectSpec, SortDirection,
};
pub use backend::{with_timeout, DocumentBackend};
pub use catalog::{AccessPath, IndexCatalog, IndexChoice, RegisterOutcome, ID_INDEX};
pub use collection::{Collection, DocumentLimits, Snapshot};
pub use document::{Document, DocumentId};
pub use index::{Direction, DocumentIndex, IndexField, IndexSpec, IndexStats};
pub use query::{DocumentQuery, QueryOperator};
pub use schema::{CollectionSchema, FieldSchema};
pub use update::UpdateOperation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Document store configuration
#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    /// Maximum document size in bytes
    pub max_document_size: usize,
    /// Maximum nesting depth for documents
    pub max_nesting_depth: usize,
    /// Log a warning when a filtered scan cannot use an index
    pub warn_on_full_scan: bool,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        let limits = DocumentLimits::default();
        Self {
            max_document_size: limits.max_document_size,
            max_nesting_depth: limits.max_nesting_depth,
            warn_on_full_scan: true,
        }
    }
}

/// Document store metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentStoreMetrics {
    /// Total collections
    pub total_collections: u64,
    /// Insert operations
    pub inserts: u64,
    /// Update operations
    pub updates: u64,
    /// Scan operations
    pub scans: u64,
    /// Scans served by an index
    pub index_scans: u64,
    /// Scans that visited every document
    pub collection_scans: u64,
}

/// In-memory document store engine
///
/// Collections are independent: each has its own lock, and the registry lock
/// is held only to look a collection up.
pub struct DocumentStore {
    /// Collections by name
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    /// Configuration
    config: DocumentStoreConfig,
    /// Metrics
    metrics: RwLock<DocumentStoreMetrics>,
}

impl DocumentStore {
    /// Create a new document store
    pub fn new(config: DocumentStoreConfig) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            config,
            metrics: RwLock::new(DocumentStoreMetrics::default()),
        }
    }

    /// List all collections
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a collection
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, DocumentStoreError> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DocumentStoreError::CollectionNotFound(name.to_string()))
    }

    /// Get metrics
    pub fn metrics(&self) -> DocumentStoreMetrics {
        self.metrics.read().clone()
    }

    fn limits(&self) -> DocumentLimits {
        DocumentLimits {
            max_document_size: self.config.max_document_size,
            max_nesting_depth: self.config.max_nesting_depth,
        }
    }
}

#[async_trait]
impl DocumentBackend for DocumentStore {
    async fn create_collection(
        &self,
        name: &str,
        schema: CollectionSchema,
    ) -> Result<(), DocumentStoreError> {
        let mut collections = self.collections.write();

        if collections.contains_key(name) {
            return Err(DocumentStoreError::CollectionExists(name.to_string()));
        }

        let collection = Collection::new(name, schema, self.limits())?;
        collections.insert(name.to_string(), Arc::new(collection));
        self.metrics.write().total_collections += 1;

        info!(collection = name, "collection created");
        Ok(())
    }

    async fn schema(&self, collection: &str) -> Result<CollectionSchema, DocumentStoreError> {
        Ok(self.collection(collection)?.schema().clone())
    }

    async fn insert(
        &self,
        collection: &str,
        document: serde_json::Value,
    ) -> Result<DocumentId, DocumentStoreError> {
        let coll = self.collection(collection)?;
        let doc = Document::from_json(document)?;
        let id = coll.insert(doc)?;

        self.metrics.write().inserts += 1;
        debug!(collection, id = %id, "document inserted");
        Ok(id)
    }

    async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Arc<Document>>, DocumentStoreError> {
        Ok(self.collection(collection)?.get(id))
    }

    async fn scan(
        &self,
        collection: &str,
        filter: &DocumentQuery,
    ) -> Result<Snapshot, DocumentStoreError> {
        let snapshot = self.collection(collection)?.scan(filter);

        let mut metrics = self.metrics.write();
        metrics.scans += 1;
        match snapshot.access_path() {
            AccessPath::Index(name) => {
                metrics.index_scans += 1;
                debug!(
                    collection,
                    index = %name,
                    candidates = snapshot.candidate_count(),
                    "index scan"
                );
            }
            AccessPath::FullScan => {
                metrics.collection_scans += 1;
                if self.config.warn_on_full_scan && !filter.is_empty() {
                    warn!(
                        collection,
                        fields = ?filter.get_fields(),
                        candidates = snapshot.candidate_count(),
                        "no index available, falling back to full collection scan"
                    );
                }
            }
        }

        Ok(snapshot)
    }

    async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        update: &UpdateOperation,
    ) -> Result<Arc<Document>, DocumentStoreError> {
        let doc = self.collection(collection)?.update(id, update)?;
        self.metrics.write().updates += 1;
        Ok(doc)
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<RegisterOutcome, DocumentStoreError> {
        let coll = self.collection(&spec.collection)?;
        let name = spec.name.clone();
        let outcome = coll.create_index(spec)?;
        if outcome == RegisterOutcome::Created {
            info!(collection = coll.name(), index = %name, "index registered");
        }
        Ok(outcome)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, DocumentStoreError> {
        Ok(self.collection(collection)?.list_indexes())
    }

    async fn index_stats(&self, collection: &str) -> Result<Vec<IndexStats>, DocumentStoreError> {
        Ok(self.collection(collection)?.index_stats())
    }

    async fn count(
        &self,
        collection: &str,
        filter: &DocumentQuery,
    ) -> Result<usize, DocumentStoreError> {
        Ok(self.collection(collection)?.count(filter))
    }
}

/// Document store errors
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    /// Collection already exists
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    /// Collection not found
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Invalid document
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Document too large
    #[error("Document too large: {size} bytes (max: {max} bytes)")]
    DocumentTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Nesting too deep
    #[error("Document nesting too deep: {depth} levels (max: {max} levels)")]
    NestingTooDeep {
        /// Actual depth
        depth: usize,
        /// Maximum allowed depth
        max: usize,
    },

    /// Invalid query
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid update
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Malformed pipeline or reference to a field the input does not carry
    #[error("Invalid aggregation pipeline: {0}")]
    PipelineError(String),

    /// No index serves the query; callers fall back to a full scan
    #[error("No index available: {0}")]
    NoIndexAvailable(String),

    /// Index error
    #[error("Index error: {0}")]
    IndexError(String),

    /// Uniqueness or required-field violation, rejected before persistence
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation cancelled through its cancellation handle
    #[error("Operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_messages() -> DocumentStore {
        let store = DocumentStore::new(DocumentStoreConfig::default());
        store
            .create_collection("messages", CollectionSchema::default())
            .await
            .unwrap();
        store
            .create_index(
                IndexSpec::new("messages", "chat-timeline")
                    .asc("chat_id")
                    .asc("timestamp"),
            )
            .await
            .unwrap();
        let messages = [
            ("m1", "c1", "Ana", 2),
            ("m2", "c1", "Seba", 1),
            ("m3", "c2", "Ana", 3),
        ];
        for (id, chat, sender, ts) in messages {
            let data = json!({ "_id": id, "chat_id": chat, "sender": sender, "timestamp": ts });
            store.insert("messages", data).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_create_collection() {
        let store = DocumentStore::new(DocumentStoreConfig::default());

        store.create_collection("test", CollectionSchema::default()).await.unwrap();

        assert_eq!(store.list_collections(), vec!["test".to_string()]);
        assert!(matches!(
            store.create_collection("test", CollectionSchema::default()).await,
            Err(DocumentStoreError::CollectionExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let store = DocumentStore::new(DocumentStoreConfig::default());
        assert!(matches!(
            store.insert("nope", json!({})).await,
            Err(DocumentStoreError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_uses_index_and_tracks_metrics() {
        let store = store_with_messages().await;

        let snapshot = store
            .scan("messages", &DocumentQuery::new().eq("chat_id", "c1"))
            .await
            .unwrap();
        assert_eq!(snapshot.access_path(), &AccessPath::Index("chat-timeline".into()));
        assert_eq!(snapshot.into_matches().count(), 2);

        store
            .scan("messages", &DocumentQuery::new().eq("sender", "Ana"))
            .await
            .unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.inserts, 3);
        assert_eq!(metrics.index_scans, 1);
        assert_eq!(metrics.collection_scans, 1);
    }

    #[tokio::test]
    async fn test_aggregate_most_active() {
        let store = store_with_messages().await;
        let pipeline = AggregationPipeline::from_json(vec![
            json!({ "$match": { "chat_id": "c1" } }),
            json!({ "$group": { "_id": "$sender", "count": { "$sum": 1 } } }),
            json!({ "$sort": { "count": -1, "_id": 1 } }),
            json!({ "$limit": 1 }),
        ])
        .unwrap();

        let results = aggregate(&store, "messages", &pipeline, &AggregateOptions::default())
            .await
            .unwrap();
        assert_eq!(results, vec![json!({ "_id": "Ana", "count": 1 })]);
    }

    #[tokio::test]
    async fn test_aggregate_unknown_chat_is_empty() {
        let store = store_with_messages().await;
        let pipeline = AggregationPipeline::new().filter(DocumentQuery::new().eq("chat_id", "zzz"));
        let results = aggregate(&store, "messages", &pipeline, &AggregateOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let store = store_with_messages().await;
        let id = DocumentId::from("m1");
        let like = UpdateOperation::new().add_to_set("interactions.likes", "Seba");
        store.update("messages", &id, &like).await.unwrap();

        let doc = store.get("messages", &id).await.unwrap().unwrap();
        assert_eq!(doc.data["interactions"]["likes"], json!(["Seba"]));
        assert_eq!(doc.version, 2);
        let in_c1 = DocumentQuery::new().eq("chat_id", "c1");
        assert_eq!(store.count("messages", &in_c1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_document_size_limit() {
        let config = DocumentStoreConfig {
            max_document_size: 100,
            ..Default::default()
        };
        let store = DocumentStore::new(config);
        store.create_collection("test", CollectionSchema::default()).await.unwrap();

        let large_doc = json!({
            "data": "x".repeat(200)
        });

        let result = store.insert("test", large_doc).await;
        assert!(matches!(
            result,
            Err(DocumentStoreError::DocumentTooLarge { .. })
        ));
    }
}
