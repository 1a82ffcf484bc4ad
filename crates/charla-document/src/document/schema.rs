//! Collection schemas: the known field paths of a collection and the fields
//! every document must carry

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::document::Document;
use super::DocumentStoreError;

/// Set of field paths available on a record stream
///
/// A path is known when it is declared, when it is a prefix of a declared
/// path (`content` given `content.text`), or when it descends into a declared
/// path whose sub-fields are not enumerated (`interactions.reports.reason`
/// given only `interactions.reports`). An empty schema accepts every path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    paths: BTreeSet<String>,
}

impl FieldSchema {
    /// Create a schema from field paths
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a field path
    pub fn insert(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    /// Declared paths
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Whether `path` can be resolved against records of this schema
    pub fn contains(&self, path: &str) -> bool {
        // Schemaless collections accept any path
        if self.paths.is_empty() || self.paths.contains(path) {
            return true;
        }

        let as_prefix = format!("{}.", path);
        if self.paths.iter().any(|p| p.starts_with(&as_prefix)) {
            return true;
        }

        // Descending into a leaf whose children are not enumerated
        self.paths.iter().any(|declared| {
            let declared_prefix = format!("{}.", declared);
            path.starts_with(&declared_prefix)
                && !self.paths.iter().any(|p| p.starts_with(&declared_prefix))
        })
    }
}

/// Schema of a stored collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Known field paths
    pub fields: FieldSchema,
    /// Paths that must be present and non-null on every document
    pub required: Vec<String>,
}

impl CollectionSchema {
    /// Create a schema with known fields and required fields
    pub fn new<I, S>(fields: I, required: &[&str]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = FieldSchema::new(fields);
        fields.insert("_id");
        Self {
            fields,
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Reject documents missing a required field
    pub fn validate(&self, doc: &Document) -> Result<(), DocumentStoreError> {
        for field in &self.required {
            match doc.get_field(field) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(DocumentStoreError::ValidationError(format!(
                        "document {} is missing required field '{}'",
                        doc.id, field
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_fields() -> FieldSchema {
        FieldSchema::new([
            "chat_id",
            "content.kind",
            "content.text",
            "interactions.likes",
            "interactions.reports",
        ])
    }

    #[test]
    fn test_contains_declared_and_prefix_paths() {
        let schema = message_fields();
        assert!(schema.contains("chat_id"));
        assert!(schema.contains("content"));
        assert!(schema.contains("interactions"));
        assert!(!schema.contains("remitente"));
    }

    #[test]
    fn test_contains_descends_only_into_leaves() {
        let schema = message_fields();
        assert!(schema.contains("interactions.reports.reporter"));
        assert!(!schema.contains("content.payload"));
    }

    #[test]
    fn test_required_fields() {
        let schema = CollectionSchema::new(["chat_id", "sender"], &["chat_id", "sender"]);
        let ok = Document::from_json(json!({ "chat_id": "c1", "sender": "Ana" })).unwrap();
        assert!(schema.validate(&ok).is_ok());

        let missing = Document::from_json(json!({ "chat_id": "c1", "sender": null })).unwrap();
        assert!(matches!(
            schema.validate(&missing),
            Err(DocumentStoreError::ValidationError(_))
        ));
    }
}
