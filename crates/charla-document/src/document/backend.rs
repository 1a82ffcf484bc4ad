//! Storage collaborator seam

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::catalog::RegisterOutcome;
use super::collection::Snapshot;
use super::document::{Document, DocumentId};
use super::index::{IndexSpec, IndexStats};
use super::query::DocumentQuery;
use super::schema::CollectionSchema;
use super::update::UpdateOperation;
use super::DocumentStoreError;

/// Indexed collection storage
///
/// Calls may suspend. Implementations own their documents exclusively and
/// keep index entries consistent with every accepted write.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Create a collection with a declared schema
    async fn create_collection(
        &self,
        name: &str,
        schema: CollectionSchema,
    ) -> Result<(), DocumentStoreError>;

    /// Schema of a collection
    async fn schema(&self, collection: &str) -> Result<CollectionSchema, DocumentStoreError>;

    /// Insert a document, returning its id
    async fn insert(
        &self,
        collection: &str,
        document: serde_json::Value,
    ) -> Result<DocumentId, DocumentStoreError>;

    /// Fetch a document by id
    async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Arc<Document>>, DocumentStoreError>;

    /// Snapshot the documents matching `filter`
    async fn scan(
        &self,
        collection: &str,
        filter: &DocumentQuery,
    ) -> Result<Snapshot, DocumentStoreError>;

    /// Apply a single-document update
    async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        update: &UpdateOperation,
    ) -> Result<Arc<Document>, DocumentStoreError>;

    /// Register an index
    async fn create_index(&self, spec: IndexSpec) -> Result<RegisterOutcome, DocumentStoreError>;

    /// Registered index specifications of a collection
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, DocumentStoreError>;

    /// Index statistics of a collection
    async fn index_stats(&self, collection: &str) -> Result<Vec<IndexStats>, DocumentStoreError>;

    /// Count documents matching `filter`
    async fn count(
        &self,
        collection: &str,
        filter: &DocumentQuery,
    ) -> Result<usize, DocumentStoreError> {
        Ok(self.scan(collection, filter).await?.into_matches().count())
    }
}

/// Run `fut`, failing with `Timeout` once `limit` elapses
///
/// The future is dropped on expiry, so no partial result escapes.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, DocumentStoreError>
where
    F: Future<Output = Result<T, DocumentStoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "operation timed out");
            Err(DocumentStoreError::Timeout(limit))
        }
    }
}
