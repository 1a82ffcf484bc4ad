//! Document indexing for efficient queries

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::document::{Document, DocumentId};
use super::query::DocumentQuery;
use super::DocumentStoreError;

/// Key direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

/// One component of an index key specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexField {
    /// Field path (dot notation, multi-key over arrays)
    pub field: String,
    /// Sort direction
    #[serde(default)]
    pub direction: Direction,
}

/// Persisted index specification
///
/// Specifications are configuration data: re-applying an identical spec is a
/// no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique per collection
    pub name: String,
    /// Collection the index belongs to
    pub collection: String,
    /// Ordered key fields
    pub keys: Vec<IndexField>,
    /// Unique constraint
    #[serde(default)]
    pub unique: bool,
    /// Only documents matching this filter are indexed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter: Option<serde_json::Value>,
}

impl IndexSpec {
    /// Start a specification for `collection`
    pub fn new(collection: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            keys: Vec::new(),
            unique: false,
            partial_filter: None,
        }
    }

    /// Add ascending field
    pub fn asc(mut self, field: &str) -> Self {
        self.keys.push(IndexField {
            field: field.to_string(),
            direction: Direction::Asc,
        });
        self
    }

    /// Add descending field
    pub fn desc(mut self, field: &str) -> Self {
        self.keys.push(IndexField {
            field: field.to_string(),
            direction: Direction::Desc,
        });
        self
    }

    /// Set unique constraint
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Restrict the index to documents matching `filter`
    pub fn partial(mut self, filter: serde_json::Value) -> Self {
        self.partial_filter = Some(filter);
        self
    }

    /// Indexed field paths in key order
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.field.as_str())
    }
}

/// Individual index value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexValue {
    /// Null or missing value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value (stored as bits for ordering)
    Float(u64),
    /// String value (objects are indexed by their serialization)
    String(String),
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        // Type ordering: Null < Bool < Int/Float < String
        let type_order = |v: &IndexValue| -> u8 {
            match v {
                IndexValue::Null => 0,
                IndexValue::Bool(_) => 1,
                IndexValue::Int(_) | IndexValue::Float(_) => 2,
                IndexValue::String(_) => 3,
            }
        };

        let t1 = type_order(self);
        let t2 = type_order(other);

        if t1 != t2 {
            return t1.cmp(&t2);
        }

        match (self, other) {
            (IndexValue::Bool(a), IndexValue::Bool(b)) => a.cmp(b),
            (IndexValue::Int(a), IndexValue::Int(b)) => a.cmp(b),
            (IndexValue::String(a), IndexValue::String(b)) => a.cmp(b),
            (a, b) => {
                let fa = a.as_f64().unwrap_or(0.0);
                let fb = b.as_f64().unwrap_or(0.0);
                fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
            }
        }
    }
}

impl IndexValue {
    /// Create index value from a scalar JSON value
    ///
    /// Integral floats collapse to `Int` so `1` and `1.0` share a key.
    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => IndexValue::Null,
            serde_json::Value::Bool(b) => IndexValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        IndexValue::Int(f as i64)
                    } else {
                        IndexValue::Float(f.to_bits())
                    }
                } else {
                    IndexValue::Null
                }
            }
            serde_json::Value::String(s) => IndexValue::String(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                IndexValue::String(serde_json::to_string(value).unwrap_or_default())
            }
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            IndexValue::Int(i) => Some(*i as f64),
            IndexValue::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

/// One component of an index key, ordered by its field direction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyPart {
    value: IndexValue,
    descending: bool,
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ord = self.value.cmp(&other.value);
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Index key (comparable and hashable)
///
/// A key prefix sorts directly before all keys that extend it, which is what
/// prefix lookups rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    parts: Vec<KeyPart>,
}

impl IndexKey {
    fn starts_with(&self, prefix: &IndexKey) -> bool {
        self.parts.len() >= prefix.parts.len()
            && self
                .parts
                .iter()
                .zip(prefix.parts.iter())
                .all(|(a, b)| a.value == b.value)
    }
}

/// A maintained secondary index over one collection
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    spec: IndexSpec,
    partial: Option<DocumentQuery>,
    entries: BTreeMap<IndexKey, BTreeSet<DocumentId>>,
}

impl DocumentIndex {
    /// Create an empty index from its specification
    pub fn new(spec: IndexSpec) -> Result<Self, DocumentStoreError> {
        if spec.name.is_empty() {
            return Err(DocumentStoreError::IndexError("index name is empty".into()));
        }
        if spec.keys.is_empty() {
            return Err(DocumentStoreError::IndexError(format!(
                "index {} has no key fields",
                spec.name
            )));
        }

        let partial = spec
            .partial_filter
            .clone()
            .map(DocumentQuery::from_json)
            .transpose()?;

        Ok(Self {
            spec,
            partial,
            entries: BTreeMap::new(),
        })
    }

    /// Get index name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Get the specification
    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    /// Partial filter, if any
    pub fn partial_filter(&self) -> Option<&DocumentQuery> {
        self.partial.as_ref()
    }

    /// Whether the document falls inside this index
    pub fn covers(&self, doc: &Document) -> bool {
        self.partial
            .as_ref()
            .map(|filter| filter.matches_document(doc))
            .unwrap_or(true)
    }

    /// Extract every key the document contributes, duplicates included
    ///
    /// Arrays anywhere along a key path expand into one key per element.
    fn extract_keys(&self, doc: &Document) -> Vec<IndexKey> {
        if !self.covers(doc) {
            return Vec::new();
        }

        let mut results: Vec<Vec<KeyPart>> = vec![vec![]];

        for key in &self.spec.keys {
            let descending = key.direction == Direction::Desc;
            let mut values: Vec<IndexValue> = Vec::new();
            for value in doc.values_at(&key.field) {
                match value {
                    serde_json::Value::Array(items) => {
                        values.extend(items.iter().map(IndexValue::from_json))
                    }
                    other => values.push(IndexValue::from_json(other)),
                }
            }
            if values.is_empty() {
                values.push(IndexValue::Null);
            }

            let mut expanded = Vec::with_capacity(results.len() * values.len());
            for existing in &results {
                for value in &values {
                    let mut parts = existing.clone();
                    parts.push(KeyPart {
                        value: value.clone(),
                        descending,
                    });
                    expanded.push(parts);
                }
            }
            results = expanded;
        }

        results.into_iter().map(|parts| IndexKey { parts }).collect()
    }

    /// Check the unique constraint for a document about to be stored
    ///
    /// Keys must be distinct within the document and must not belong to any
    /// other document already in the index.
    pub fn check_unique(&self, doc: &Document) -> Result<(), DocumentStoreError> {
        if !self.spec.unique {
            return Ok(());
        }

        let keys = self.extract_keys(doc);
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key) {
                return Err(DocumentStoreError::ValidationError(format!(
                    "duplicate key on unique index {}: repeated within document {}",
                    self.spec.name, doc.id
                )));
            }
            if let Some(owners) = self.entries.get(key) {
                if owners.iter().any(|owner| owner != &doc.id) {
                    return Err(DocumentStoreError::ValidationError(format!(
                        "duplicate key on unique index {} for document {}",
                        self.spec.name, doc.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Insert a document into the index
    pub fn insert(&mut self, doc: &Document) {
        for key in self.extract_keys(doc) {
            self.entries.entry(key).or_default().insert(doc.id.clone());
        }
    }

    /// Remove a document from the index
    pub fn remove(&mut self, doc: &Document) {
        for key in self.extract_keys(doc) {
            if let Some(set) = self.entries.get_mut(&key) {
                set.remove(&doc.id);
                if set.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Documents whose leading key components equal `prefix`, in index order
    pub fn lookup_prefix(&self, prefix: &[serde_json::Value]) -> Vec<DocumentId> {
        let start = IndexKey {
            parts: prefix
                .iter()
                .zip(self.spec.keys.iter())
                .map(|(value, key)| KeyPart {
                    value: IndexValue::from_json(value),
                    descending: key.direction == Direction::Desc,
                })
                .collect(),
        };

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for (_, ids) in self
            .entries
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
        {
            for id in ids {
                if seen.insert(id) {
                    result.push(id.clone());
                }
            }
        }

        result
    }

    /// Get index statistics
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            name: self.spec.name.clone(),
            fields: self.spec.fields().map(String::from).collect(),
            unique: self.spec.unique,
            partial: self.partial.is_some(),
            key_count: self.entries.len(),
            entry_count: self.entries.values().map(BTreeSet::len).sum(),
        }
    }
}

/// Index statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Index name
    pub name: String,
    /// Indexed fields
    pub fields: Vec<String>,
    /// Unique constraint
    pub unique: bool,
    /// Partial index
    pub partial: bool,
    /// Number of distinct keys
    pub key_count: usize,
    /// Number of (key, document) entries
    pub entry_count: usize,
}
