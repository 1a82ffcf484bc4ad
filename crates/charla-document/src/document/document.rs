//! Document types and field-path access

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::DocumentStoreError;

/// Document identifier, taken from the `_id` field
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DocumentId {
    /// Integer ID
    Integer(i64),
    /// String ID
    String(String),
}

impl DocumentId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }

    /// Create from JSON value
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DocumentStoreError> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Ok(Self::String(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Self::Integer).ok_or_else(|| {
                DocumentStoreError::InvalidDocument("Document ID must be integer, not float".into())
            }),
            _ => Err(DocumentStoreError::InvalidDocument(
                "_id must be a non-empty string or an integer".into(),
            )),
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Integer(i) => serde_json::Value::Number((*i).into()),
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
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A JSON document with metadata
///
/// `data` always carries the `_id` field, so field paths and pipelines can
/// address the identifier like any other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document ID
    pub id: DocumentId,
    /// Document data
    pub data: serde_json::Value,
    /// Version, bumped on every applied update
    pub version: u64,
    /// Last update timestamp (unix seconds)
    pub updated_at: u64,
}

impl Document {
    /// Create a new document from JSON, generating an `_id` when absent
    pub fn from_json(mut value: serde_json::Value) -> Result<Self, DocumentStoreError> {
        let obj = value.as_object_mut().ok_or_else(|| {
            DocumentStoreError::InvalidDocument("Document must be an object".into())
        })?;

        let id = match obj.get("_id") {
            Some(id_value) => DocumentId::from_json(id_value)?,
            None => {
                let id = DocumentId::new();
                obj.insert("_id".to_string(), id.to_json());
                id
            }
        };

        Ok(Self {
            id,
            data: value,
            version: 1,
            updated_at: unix_now(),
        })
    }

    /// Convert document to JSON
    pub fn to_json(&self) -> serde_json::Value {
        self.data.clone()
    }

    /// Get a field value by path (supports dot notation and array indexes)
    pub fn get_field(&self, path: &str) -> Option<&serde_json::Value> {
        get_path(&self.data, path)
    }

    /// Collect every value reachable by `path`, fanning out over arrays
    pub fn values_at(&self, path: &str) -> Vec<&serde_json::Value> {
        values_at(&self.data, path)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolve a dotted path inside a JSON value
pub fn get_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;

    for part in path.split('.') {
        match current {
            serde_json::Value::Object(map) => {
                current = map.get(part)?;
            }
            serde_json::Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Resolve a dotted path, descending into every element of intermediate arrays
///
/// `participants.alias` on `{participants: [{alias: a}, {alias: b}]}` yields
/// `[a, b]`. A terminal array is returned as a single value.
pub fn values_at<'a>(value: &'a serde_json::Value, path: &str) -> Vec<&'a serde_json::Value> {
    let mut current = vec![value];

    for part in path.split('.') {
        let mut next = Vec::new();
        for v in current {
            match v {
                serde_json::Value::Object(map) => {
                    if let Some(child) = map.get(part) {
                        next.push(child);
                    }
                }
                serde_json::Value::Array(arr) => {
                    if let Ok(index) = part.parse::<usize>() {
                        if let Some(child) = arr.get(index) {
                            next.push(child);
                        }
                    } else {
                        for item in arr {
                            if let Some(child) = item.as_object().and_then(|m| m.get(part)) {
                                next.push(child);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }

    current
}

/// Mutable access to a dotted path, creating intermediate objects
pub fn get_path_mut_or_insert<'a>(
    value: &'a mut serde_json::Value,
    path: &str,
) -> Result<&'a mut serde_json::Value, DocumentStoreError> {
    let mut current = value;

    for part in path.split('.') {
        if current.is_null() {
            *current = serde_json::Value::Object(serde_json::Map::new());
        }
        current = match current {
            serde_json::Value::Object(map) => map
                .entry(part.to_string())
                .or_insert(serde_json::Value::Null),
            serde_json::Value::Array(arr) => {
                let index: usize = part.parse().map_err(|_| {
                    DocumentStoreError::InvalidUpdate(format!(
                        "cannot address array with non-numeric segment '{}' in {}",
                        part, path
                    ))
                })?;
                arr.get_mut(index).ok_or_else(|| {
                    DocumentStoreError::InvalidUpdate(format!(
                        "index {} out of bounds in {}",
                        index, path
                    ))
                })?
            }
            _ => {
                return Err(DocumentStoreError::InvalidUpdate(format!(
                    "cannot create field '{}' inside a scalar in {}",
                    part, path
                )))
            }
        };
    }

    Ok(current)
}

/// Set a dotted path, creating intermediate objects
pub fn set_path(
    value: &mut serde_json::Value,
    path: &str,
    new_value: serde_json::Value,
) -> Result<(), DocumentStoreError> {
    *get_path_mut_or_insert(value, path)? = new_value;
    Ok(())
}

/// Remove a dotted path, returning the removed value
pub fn remove_path(value: &mut serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (get_path_mut(value, parent)?, last),
        None => (value, path),
    };
    parent.as_object_mut()?.remove(last)
}

fn get_path_mut<'a>(
    value: &'a mut serde_json::Value,
    path: &str,
) -> Option<&'a mut serde_json::Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get_mut(part)?,
            serde_json::Value::Array(arr) => arr.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Total order over JSON values used by sorting and range comparisons
///
/// Type order: missing < null < bool < number < string < array < object.
pub fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => compare_json(va, vb),
    }
}

fn type_rank(value: &serde_json::Value) -> u8 {
    match value {
        serde_json::Value::Null => 0,
        serde_json::Value::Bool(_) => 1,
        serde_json::Value::Number(_) => 2,
        serde_json::Value::String(_) => 3,
        serde_json::Value::Array(_) => 4,
        serde_json::Value::Object(_) => 5,
    }
}

fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (serde_json::Value::Bool(x), serde_json::Value::Bool(y)) => x.cmp(y),
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(ix), Some(iy)) => ix.cmp(&iy),
                _ => {
                    let fx = x.as_f64().unwrap_or(0.0);
                    let fy = y.as_f64().unwrap_or(0.0);
                    fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
                }
            }
        }
        (serde_json::Value::String(x), serde_json::Value::String(y)) => x.cmp(y),
        (serde_json::Value::Array(x), serde_json::Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let cmp = compare_json(ex, ey);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        (serde_json::Value::Object(x), serde_json::Value::Object(y)) => {
            // Objects compare by their canonical serialization
            let sx = serde_json::to_string(x).unwrap_or_default();
            let sy = serde_json::to_string(y).unwrap_or_default();
            sx.cmp(&sy)
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generates_id_when_missing() {
        let doc = Document::from_json(json!({ "alias": "Ana" })).unwrap();
        assert_eq!(doc.get_field("_id"), Some(&doc.id.to_json()));
    }

    #[test]
    fn test_keeps_explicit_id() {
        let doc = Document::from_json(json!({ "_id": "PARTIDA_1" })).unwrap();
        assert_eq!(doc.id, DocumentId::from("PARTIDA_1"));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            Document::from_json(json!([1, 2])),
            Err(DocumentStoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_values_at_fans_out_over_arrays() {
        let value = json!({
            "participants": [
                { "alias": "Ana", "active": true },
                { "alias": "Seba", "active": false }
            ]
        });
        let aliases = values_at(&value, "participants.alias");
        assert_eq!(aliases, vec![&json!("Ana"), &json!("Seba")]);
        assert_eq!(get_path(&value, "participants.1.alias"), Some(&json!("Seba")));
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut value = json!({ "chat_id": "c1" });
        set_path(&mut value, "interactions.likes", json!(["Ana"])).unwrap();
        assert_eq!(get_path(&value, "interactions.likes"), Some(&json!(["Ana"])));

        assert_eq!(remove_path(&mut value, "interactions.likes"), Some(json!(["Ana"])));
        assert_eq!(get_path(&value, "interactions.likes"), None);
    }

    #[test]
    fn test_compare_values_type_order() {
        assert_eq!(compare_values(None, Some(&json!(null))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(1.5)), Some(&json!(1))), Ordering::Greater);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!(3))), Ordering::Greater);
    }
}
