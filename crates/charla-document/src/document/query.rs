//! MongoDB-style filter predicates

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use super::document::{compare_values, values_at, Document};
use super::DocumentStoreError;

/// Query operator types
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    /// Equal
    Eq(serde_json::Value),
    /// Not equal
    Ne(serde_json::Value),
    /// Greater than
    Gt(serde_json::Value),
    /// Greater than or equal
    Gte(serde_json::Value),
    /// Less than
    Lt(serde_json::Value),
    /// Less than or equal
    Lte(serde_json::Value),
    /// In array
    In(Vec<serde_json::Value>),
    /// Not in array
    Nin(Vec<serde_json::Value>),
    /// Field exists
    Exists(bool),
    /// Array size
    Size(usize),

    /// Logical AND
    And(Vec<DocumentQuery>),
    /// Logical OR
    Or(Vec<DocumentQuery>),
    /// Logical NOR
    Nor(Vec<DocumentQuery>),
}

/// A field condition in a query
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    /// Field path (dot notation supported)
    pub field: String,
    /// Operator to apply
    pub operator: QueryOperator,
}

/// A document query
///
/// All field conditions and logical operators must hold for a record to match.
/// Paths that cross arrays match when any element satisfies the condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    conditions: Vec<FieldCondition>,
    logical_ops: Vec<QueryOperator>,
}

impl DocumentQuery {
    /// Create an empty query (matches all)
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if query is empty (matches all)
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.logical_ops.is_empty()
    }

    /// Add equality condition
    pub fn eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.push(field, QueryOperator::Eq(value.into()));
        self
    }

    /// Add a disjunction of sub-queries
    pub fn or(mut self, queries: Vec<DocumentQuery>) -> Self {
        self.logical_ops.push(QueryOperator::Or(queries));
        self
    }

    fn push(&mut self, field: &str, operator: QueryOperator) {
        self.conditions.push(FieldCondition {
            field: field.to_string(),
            operator,
        });
    }

    /// Parse query from JSON
    pub fn from_json(value: serde_json::Value) -> Result<Self, DocumentStoreError> {
        let mut query = DocumentQuery::new();

        let obj = match value.as_object() {
            Some(obj) => obj,
            None if value.is_null() => return Ok(query),
            None => {
                return Err(DocumentStoreError::InvalidQuery(
                    "Query must be an object".into(),
                ))
            }
        };

        for (key, value) in obj {
            if key.starts_with('$') {
                let op = Self::parse_logical_operator(key, value)?;
                query.logical_ops.push(op);
            } else {
                let conditions = Self::parse_field_condition(key, value)?;
                query.conditions.extend(conditions);
            }
        }

        Ok(query)
    }

    fn parse_logical_operator(
        op: &str,
        value: &serde_json::Value,
    ) -> Result<QueryOperator, DocumentStoreError> {
        let arr = value
            .as_array()
            .ok_or_else(|| DocumentStoreError::InvalidQuery(format!("{} requires an array", op)))?;
        let queries = arr
            .iter()
            .map(|v| DocumentQuery::from_json(v.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        match op {
            "$and" => Ok(QueryOperator::And(queries)),
            "$or" => Ok(QueryOperator::Or(queries)),
            "$nor" => Ok(QueryOperator::Nor(queries)),
            _ => Err(DocumentStoreError::InvalidQuery(format!(
                "Unknown operator: {}",
                op
            ))),
        }
    }

    fn parse_field_condition(
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<FieldCondition>, DocumentStoreError> {
        let mut conditions = Vec::new();

        match value {
            serde_json::Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => {
                for (op, op_value) in obj {
                    let operator = Self::parse_comparison_operator(op, op_value)?;
                    conditions.push(FieldCondition {
                        field: field.to_string(),
                        operator,
                    });
                }
            }
            // Scalars, arrays and nested documents are equality matches
            _ => conditions.push(FieldCondition {
                field: field.to_string(),
                operator: QueryOperator::Eq(value.clone()),
            }),
        }

        Ok(conditions)
    }

    fn parse_comparison_operator(
        op: &str,
        value: &serde_json::Value,
    ) -> Result<QueryOperator, DocumentStoreError> {
        match op {
            "$eq" => Ok(QueryOperator::Eq(value.clone())),
            "$ne" => Ok(QueryOperator::Ne(value.clone())),
            "$gt" => Ok(QueryOperator::Gt(value.clone())),
            "$gte" => Ok(QueryOperator::Gte(value.clone())),
            "$lt" => Ok(QueryOperator::Lt(value.clone())),
            "$lte" => Ok(QueryOperator::Lte(value.clone())),
            "$in" | "$nin" => {
                let arr = value.as_array().ok_or_else(|| {
                    DocumentStoreError::InvalidQuery(format!("{} requires an array", op))
                })?;
                if op == "$in" {
                    Ok(QueryOperator::In(arr.clone()))
                } else {
                    Ok(QueryOperator::Nin(arr.clone()))
                }
            }
            "$exists" => {
                let exists = value.as_bool().ok_or_else(|| {
                    DocumentStoreError::InvalidQuery("$exists requires a boolean".into())
                })?;
                Ok(QueryOperator::Exists(exists))
            }
            "$size" => {
                let size = value.as_u64().ok_or_else(|| {
                    DocumentStoreError::InvalidQuery("$size requires an integer".into())
                })? as usize;
                Ok(QueryOperator::Size(size))
            }
            _ => Err(DocumentStoreError::InvalidQuery(format!(
                "Unknown operator: {}",
                op
            ))),
        }
    }

    /// Check if a stored document matches this query
    pub fn matches_document(&self, doc: &Document) -> bool {
        self.matches(&doc.data)
    }

    /// Check if a JSON record matches this query
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        self.conditions
            .iter()
            .all(|c| Self::matches_operator(&values_at(record, &c.field), &c.operator))
            && self
                .logical_ops
                .iter()
                .all(|op| Self::matches_logical_op(record, op))
    }

    /// Check candidate values against an operator
    fn matches_operator(values: &[&serde_json::Value], op: &QueryOperator) -> bool {
        match op {
            QueryOperator::Eq(expected) => {
                if values.is_empty() {
                    return expected.is_null();
                }
                values.iter().any(|v| Self::value_equals(v, expected))
            }
            QueryOperator::Ne(expected) => {
                !Self::matches_operator(values, &QueryOperator::Eq(expected.clone()))
            }
            QueryOperator::Gt(expected) => {
                Self::any_compares(values, expected, |o| o == Ordering::Greater)
            }
            QueryOperator::Gte(expected) => {
                Self::any_compares(values, expected, |o| o != Ordering::Less)
            }
            QueryOperator::Lt(expected) => {
                Self::any_compares(values, expected, |o| o == Ordering::Less)
            }
            QueryOperator::Lte(expected) => {
                Self::any_compares(values, expected, |o| o != Ordering::Greater)
            }
            QueryOperator::In(candidates) => candidates
                .iter()
                .any(|c| Self::matches_operator(values, &QueryOperator::Eq(c.clone()))),
            QueryOperator::Nin(candidates) => {
                !Self::matches_operator(values, &QueryOperator::In(candidates.clone()))
            }
            QueryOperator::Exists(should_exist) => !values.is_empty() == *should_exist,
            QueryOperator::Size(size) => values
                .iter()
                .any(|v| v.as_array().map(|a| a.len() == *size).unwrap_or(false)),
            QueryOperator::And(_) | QueryOperator::Or(_) | QueryOperator::Nor(_) => true,
        }
    }

    /// Equality with multi-key semantics: an array matches if it equals the
    /// expected value or contains it
    fn value_equals(value: &serde_json::Value, expected: &serde_json::Value) -> bool {
        if value == expected {
            return true;
        }
        match value {
            serde_json::Value::Array(items) => items.iter().any(|item| item == expected),
            serde_json::Value::Number(n) => expected
                .as_f64()
                .zip(n.as_f64())
                .map(|(a, b)| a == b)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Ordered comparisons only apply between values of the same JSON type
    fn any_compares(
        values: &[&serde_json::Value],
        expected: &serde_json::Value,
        accept: impl Fn(Ordering) -> bool,
    ) -> bool {
        let same_type = |a: &serde_json::Value| {
            std::mem::discriminant(a) == std::mem::discriminant(expected)
        };
        values.iter().any(|v| {
            let scalars: Vec<&serde_json::Value> = match v {
                serde_json::Value::Array(items) if !expected.is_array() => items.iter().collect(),
                _ => vec![*v],
            };
            scalars
                .into_iter()
                .filter(|s| same_type(*s))
                .any(|s| accept(compare_values(Some(s), Some(expected))))
        })
    }

    fn matches_logical_op(record: &serde_json::Value, op: &QueryOperator) -> bool {
        match op {
            QueryOperator::And(queries) => queries.iter().all(|q| q.matches(record)),
            QueryOperator::Or(queries) => queries.iter().any(|q| q.matches(record)),
            QueryOperator::Nor(queries) => !queries.iter().any(|q| q.matches(record)),
            _ => true,
        }
    }

    /// Get all fields used in the query
    pub fn get_fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields(&self, fields: &mut BTreeSet<String>) {
        for condition in &self.conditions {
            fields.insert(condition.field.clone());
        }
        for op in &self.logical_ops {
            if let QueryOperator::And(queries)
            | QueryOperator::Or(queries)
            | QueryOperator::Nor(queries) = op
            {
                for q in queries {
                    q.collect_fields(fields);
                }
            }
        }
    }

    /// Equality conditions that every match must satisfy
    ///
    /// Collected from top-level conditions and `$and` branches; `$or` and
    /// `$nor` branches constrain nothing for index selection.
    pub fn equality_fields(&self) -> BTreeMap<String, serde_json::Value> {
        let mut fields = BTreeMap::new();
        self.collect_equalities(&mut fields);
        fields
    }

    fn collect_equalities(&self, fields: &mut BTreeMap<String, serde_json::Value>) {
        for condition in &self.conditions {
            if let QueryOperator::Eq(value) = &condition.operator {
                fields.insert(condition.field.clone(), value.clone());
            }
        }
        for op in &self.logical_ops {
            if let QueryOperator::And(queries) = op {
                for q in queries {
                    q.collect_equalities(fields);
                }
            }
        }
    }
}
