//! Field-level update operations applied to a single document

use std::cmp::Ordering;

use super::document::{compare_values, get_path, get_path_mut_or_insert, remove_path, set_path};
use super::DocumentStoreError;

/// One field-level modification
#[derive(Debug, Clone, PartialEq)]
enum FieldUpdate {
    /// Replace the value at a path
    Set {
        /// Field path
        path: String,
        /// New value
        value: serde_json::Value,
    },
    /// Remove a path
    Unset {
        /// Field path
        path: String,
    },
    /// Append to an array, creating it when missing
    Push {
        /// Array path
        path: String,
        /// Appended value
        value: serde_json::Value,
    },
    /// Append to an array unless an equal element is present
    AddToSet {
        /// Array path
        path: String,
        /// Added value
        value: serde_json::Value,
    },
    /// Keep the greater of the stored and given values
    Max {
        /// Field path
        path: String,
        /// Candidate value
        value: serde_json::Value,
    },
    /// Add to a number, treating a missing field as zero
    Inc {
        /// Field path
        path: String,
        /// Increment
        by: serde_json::Number,
    },
    /// Abort the whole update unless the stored value equals `value`
    Require {
        /// Field path
        path: String,
        /// Required current value (null matches a missing field)
        value: serde_json::Value,
    },
    /// Set a field of the array element whose key field equals a value
    SetWhere {
        /// Array path
        array: String,
        /// Key field inside each element
        key: String,
        /// Key value identifying the element
        equals: serde_json::Value,
        /// Field inside the element to set
        field: String,
        /// New value
        value: serde_json::Value,
    },
}

impl FieldUpdate {
    fn paths(&self) -> Vec<&str> {
        match self {
            Self::Set { path, .. }
            | Self::Unset { path }
            | Self::Push { path, .. }
            | Self::AddToSet { path, .. }
            | Self::Max { path, .. }
            | Self::Inc { path, .. } => vec![path.as_str()],
            Self::Require { .. } => vec![],
            Self::SetWhere { array, .. } => vec![array.as_str()],
        }
    }
}

/// An ordered list of field updates applied atomically to one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOperation {
    ops: Vec<FieldUpdate>,
}

impl UpdateOperation {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field
    pub fn set(mut self, path: &str, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(FieldUpdate::Set {
            path: path.to_string(),
            value: value.into(),
        });
        self
    }

    /// Remove a field
    pub fn unset(mut self, path: &str) -> Self {
        self.ops.push(FieldUpdate::Unset {
            path: path.to_string(),
        });
        self
    }

    /// Append to an array
    pub fn push(mut self, path: &str, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(FieldUpdate::Push {
            path: path.to_string(),
            value: value.into(),
        });
        self
    }

    /// Set-union a value into an array
    pub fn add_to_set(mut self, path: &str, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(FieldUpdate::AddToSet {
            path: path.to_string(),
            value: value.into(),
        });
        self
    }

    /// Keep the maximum
    pub fn max(mut self, path: &str, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(FieldUpdate::Max {
            path: path.to_string(),
            value: value.into(),
        });
        self
    }

    /// Increment a number
    pub fn inc(mut self, path: &str, by: impl Into<serde_json::Number>) -> Self {
        self.ops.push(FieldUpdate::Inc {
            path: path.to_string(),
            by: by.into(),
        });
        self
    }

    /// Require the current value of a field, making the update conditional
    pub fn require(mut self, path: &str, value: impl Into<serde_json::Value>) -> Self {
        self.ops.push(FieldUpdate::Require {
            path: path.to_string(),
            value: value.into(),
        });
        self
    }

    /// Set `field` on the element of `array` whose `key` equals `equals`
    pub fn set_where(
        mut self,
        array: &str,
        key: &str,
        equals: impl Into<serde_json::Value>,
        field: &str,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.ops.push(FieldUpdate::SetWhere {
            array: array.to_string(),
            key: key.to_string(),
            equals: equals.into(),
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Apply every field update to `data`
    ///
    /// Applies to a working copy: an error leaves `data` in an unspecified
    /// state, so callers update a clone and swap it in on success.
    pub fn apply(&self, data: &mut serde_json::Value) -> Result<(), DocumentStoreError> {
        for op in &self.ops {
            if op.paths().iter().any(|p| *p == "_id" || p.starts_with("_id.")) {
                return Err(DocumentStoreError::InvalidUpdate(
                    "the _id field is immutable".into(),
                ));
            }
            Self::apply_one(op, data)?;
        }
        Ok(())
    }

    fn apply_one(op: &FieldUpdate, data: &mut serde_json::Value) -> Result<(), DocumentStoreError> {
        match op {
            FieldUpdate::Set { path, value } => set_path(data, path, value.clone()),
            FieldUpdate::Unset { path } => {
                remove_path(data, path);
                Ok(())
            }
            FieldUpdate::Push { path, value } => {
                Self::array_at(data, path)?.push(value.clone());
                Ok(())
            }
            FieldUpdate::AddToSet { path, value } => {
                let array = Self::array_at(data, path)?;
                if !array.contains(value) {
                    array.push(value.clone());
                }
                Ok(())
            }
            FieldUpdate::Max { path, value } => {
                if compare_values(Some(value), get_path(data, path)) == Ordering::Greater {
                    set_path(data, path, value.clone())?;
                }
                Ok(())
            }
            FieldUpdate::Inc { path, by } => {
                let target = get_path_mut_or_insert(data, path)?;
                let current = match target {
                    serde_json::Value::Null => serde_json::Number::from(0),
                    serde_json::Value::Number(n) => n.clone(),
                    _ => {
                        return Err(DocumentStoreError::InvalidUpdate(format!(
                            "cannot increment non-numeric field {}",
                            path
                        )))
                    }
                };
                *target = Self::add_numbers(&current, by);
                Ok(())
            }
            FieldUpdate::Require { path, value } => {
                let current = get_path(data, path).unwrap_or(&serde_json::Value::Null);
                if current == value {
                    Ok(())
                } else {
                    Err(DocumentStoreError::ValidationError(format!(
                        "expected {} = {}, found {}",
                        path, value, current
                    )))
                }
            }
            FieldUpdate::SetWhere {
                array,
                key,
                equals,
                field,
                value,
            } => {
                let items = match get_path_mut_or_insert(data, array)? {
                    serde_json::Value::Array(items) => items,
                    _ => {
                        return Err(DocumentStoreError::InvalidUpdate(format!(
                            "{} is not an array",
                            array
                        )))
                    }
                };
                let element = items
                    .iter_mut()
                    .find(|item| get_path(&**item, key) == Some(equals))
                    .ok_or_else(|| {
                        DocumentStoreError::InvalidUpdate(format!(
                            "no element of {} has {} = {}",
                            array, key, equals
                        ))
                    })?;
                set_path(element, field, value.clone())
            }
        }
    }

    fn array_at<'a>(
        data: &'a mut serde_json::Value,
        path: &str,
    ) -> Result<&'a mut Vec<serde_json::Value>, DocumentStoreError> {
        let target = get_path_mut_or_insert(data, path)?;
        if target.is_null() {
            *target = serde_json::Value::Array(Vec::new());
        }
        target.as_array_mut().ok_or_else(|| {
            DocumentStoreError::InvalidUpdate(format!("{} is not an array", path))
        })
    }

    fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> serde_json::Value {
        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            if let Some(sum) = x.checked_add(y) {
                return serde_json::Value::from(sum);
            }
        }
        let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
        serde_json::Value::from(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_to_set_is_idempotent() {
        let mut data = json!({ "_id": "m1" });
        let update = UpdateOperation::new().add_to_set("interactions.likes", "Ana");

        update.apply(&mut data).unwrap();
        update.apply(&mut data).unwrap();

        assert_eq!(data["interactions"]["likes"], json!(["Ana"]));
    }

    #[test]
    fn test_max_keeps_greatest() {
        let mut data = json!({ "stats": { "last_message": 10 } });
        UpdateOperation::new().max("stats.last_message", 5).apply(&mut data).unwrap();
        assert_eq!(data["stats"]["last_message"], json!(10));

        UpdateOperation::new().max("stats.last_message", 12).apply(&mut data).unwrap();
        assert_eq!(data["stats"]["last_message"], json!(12));
    }

    #[test]
    fn test_inc_missing_field_starts_at_zero() {
        let mut data = json!({});
        UpdateOperation::new()
            .inc("stats.total_messages", 1)
            .inc("stats.total_messages", 1)
            .apply(&mut data)
            .unwrap();
        assert_eq!(data["stats"]["total_messages"], json!(2));
    }

    #[test]
    fn test_set_where_targets_matching_element() {
        let mut data = json!({
            "participants": [
                { "alias": "Ana", "active": true },
                { "alias": "Seba", "active": true }
            ]
        });
        UpdateOperation::new()
            .set_where("participants", "alias", "Seba", "active", false)
            .apply(&mut data)
            .unwrap();

        assert_eq!(data["participants"][0]["active"], json!(true));
        assert_eq!(data["participants"][1]["active"], json!(false));
    }

    #[test]
    fn test_set_where_unknown_element() {
        let mut data = json!({ "participants": [] });
        let result = UpdateOperation::new()
            .set_where("participants", "alias", "Leo", "active", false)
            .apply(&mut data);
        assert!(matches!(result, Err(DocumentStoreError::InvalidUpdate(_))));
    }

    #[test]
    fn test_require_guards_update() {
        let mut data = json!({ "state": "removed" });
        let result = UpdateOperation::new()
            .require("state", "active")
            .set("state", "moderated")
            .apply(&mut data);
        assert!(matches!(result, Err(DocumentStoreError::ValidationError(_))));

        let mut data = json!({ "state": "active" });
        UpdateOperation::new()
            .require("state", "active")
            .set("state", "moderated")
            .apply(&mut data)
            .unwrap();
        assert_eq!(data["state"], json!("moderated"));
    }

    #[test]
    fn test_id_is_immutable() {
        let mut data = json!({ "_id": "c1" });
        let result = UpdateOperation::new().set("_id", "c2").apply(&mut data);
        assert!(matches!(result, Err(DocumentStoreError::InvalidUpdate(_))));
    }
}
