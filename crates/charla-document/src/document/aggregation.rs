//! Aggregation pipeline implementation (MongoDB-compatible subset)
//!
//! Pipelines are validated against the field schema of their input before any
//! record is read, then run as a chain of lazy iterators. `$match`, `$project`
//! and `$limit` stream; `$group` and `$sort` materialise their input.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::backend::{with_timeout, DocumentBackend};
use super::document::{compare_values, get_path, remove_path, set_path, values_at};
use super::query::DocumentQuery;
use super::schema::FieldSchema;
use super::DocumentStoreError;

type RecordStream<'a> =
    Box<dyn Iterator<Item = Result<serde_json::Value, DocumentStoreError>> + 'a>;

/// Aggregation pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPipeline {
    /// Pipeline stages
    stages: Vec<PipelineStage>,
}

/// Pipeline stage types
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    /// Match documents
    Match(DocumentQuery),
    /// Project fields
    Project(ProjectSpec),
    /// Group documents
    Group(GroupSpec),
    /// Sort documents
    Sort(Vec<(String, SortDirection)>),
    /// Limit results
    Limit(usize),
}

impl PipelineStage {
    fn name(&self) -> &'static str {
        match self {
            Self::Match(_) => "$match",
            Self::Project(_) => "$project",
            Self::Group(_) => "$group",
            Self::Sort(_) => "$sort",
            Self::Limit(_) => "$limit",
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending
    Ascending,
    /// Descending
    Descending,
}

/// Project specification; output fields keep declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectSpec {
    fields: Vec<(String, ProjectValue)>,
}

/// Project value
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectValue {
    /// Include field
    Include,
    /// Exclude field
    Exclude,
    /// Computed expression
    Expression(Expression),
}

impl ProjectSpec {
    /// Create an empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a field through
    pub fn include(mut self, field: &str) -> Self {
        self.fields.push((field.to_string(), ProjectValue::Include));
        self
    }

    /// Drop a field
    pub fn exclude(mut self, field: &str) -> Self {
        self.fields.push((field.to_string(), ProjectValue::Exclude));
        self
    }

    /// Compute a field
    pub fn computed(mut self, field: &str, expr: Expression) -> Self {
        self.fields.push((field.to_string(), ProjectValue::Expression(expr)));
        self
    }

    fn is_inclusion(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, v)| matches!(v, ProjectValue::Include | ProjectValue::Expression(_)))
    }

    fn excludes_id(&self) -> bool {
        self.fields
            .iter()
            .any(|(f, v)| f == "_id" && matches!(v, ProjectValue::Exclude))
    }
}

/// Group specification
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    /// Group key
    pub id: Expression,
    /// Accumulators, in output order
    pub accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    /// Group by `id`
    pub fn new(id: Expression) -> Self {
        Self {
            id,
            accumulators: Vec::new(),
        }
    }

    /// Add an output field computed over each group
    pub fn accumulate(mut self, field: &str, accumulator: Accumulator) -> Self {
        self.accumulators.push((field.to_string(), accumulator));
        self
    }
}

/// Accumulator operators
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Sum
    Sum(Expression),
    /// Count
    Count,
    /// Min
    Min(Expression),
    /// Max
    Max(Expression),
    /// First
    First(Expression),
    /// Last
    Last(Expression),
    /// Push to array
    Push(Expression),
    /// Add to set
    AddToSet(Expression),
}

impl Accumulator {
    fn expression(&self) -> Option<&Expression> {
        match self {
            Self::Count => None,
            Self::Sum(e)
            | Self::Min(e)
            | Self::Max(e)
            | Self::First(e)
            | Self::Last(e)
            | Self::Push(e)
            | Self::AddToSet(e) => Some(e),
        }
    }
}

/// Expression for computed fields
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Literal value
    Literal(serde_json::Value),
    /// Field reference (`$field`)
    Field(String),
    /// Array of expressions
    Array(Vec<Expression>),
    /// Object with expression values
    Object(Vec<(String, Expression)>),
    /// Array length
    Size(Box<Expression>),
    /// First expression unless null or missing, else the second
    IfNull(Box<Expression>, Box<Expression>),
}

impl Expression {
    /// Field reference
    pub fn field(path: &str) -> Self {
        Self::Field(path.to_string())
    }

    /// Literal value
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Array length
    pub fn size(inner: Expression) -> Self {
        Self::Size(Box::new(inner))
    }

    /// Null coalescing
    pub fn if_null(inner: Expression, replacement: Expression) -> Self {
        Self::IfNull(Box::new(inner), Box::new(replacement))
    }

    /// Number of elements of an array field, 0 when absent
    pub fn count_of(path: &str) -> Self {
        Self::size(Self::if_null(Self::field(path), Self::literal(serde_json::json!([]))))
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Field(path) => out.push(path),
            Self::Array(items) => items.iter().for_each(|e| e.collect_fields(out)),
            Self::Object(fields) => fields.iter().for_each(|(_, e)| e.collect_fields(out)),
            Self::Size(inner) => inner.collect_fields(out),
            Self::IfNull(inner, replacement) => {
                inner.collect_fields(out);
                replacement.collect_fields(out);
            }
        }
    }

    /// Evaluate against a record; `None` means the value is missing
    fn evaluate(
        &self,
        record: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, DocumentStoreError> {
        match self {
            Self::Literal(v) => Ok(Some(v.clone())),
            Self::Field(path) => {
                if let Some(value) = get_path(record, path) {
                    return Ok(Some(value.clone()));
                }
                // Paths that cross arrays resolve to the array of reachable values
                let reachable = values_at(record, path);
                if reachable.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::Value::Array(reachable.into_iter().cloned().collect())))
                }
            }
            Self::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(record)?.unwrap_or(serde_json::Value::Null));
                }
                Ok(Some(serde_json::Value::Array(values)))
            }
            Self::Object(fields) => {
                let mut obj = serde_json::Map::new();
                for (k, e) in fields {
                    if let Some(v) = e.evaluate(record)? {
                        obj.insert(k.clone(), v);
                    }
                }
                Ok(Some(serde_json::Value::Object(obj)))
            }
            Self::Size(inner) => match inner.evaluate(record)? {
                Some(serde_json::Value::Array(items)) => Ok(Some(serde_json::json!(items.len()))),
                other => Err(DocumentStoreError::PipelineError(format!(
                    "$size requires an array, got {}",
                    other.map(|v| v.to_string()).unwrap_or_else(|| "missing".into())
                ))),
            },
            Self::IfNull(inner, replacement) => match inner.evaluate(record)? {
                Some(v) if !v.is_null() => Ok(Some(v)),
                _ => replacement.evaluate(record),
            },
        }
    }
}

/// Cooperative cancellation flag for in-flight aggregations
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Create a handle that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Fail with `Cancelled` once cancellation was requested
    pub fn check(&self) -> Result<(), DocumentStoreError> {
        if self.is_cancelled() {
            Err(DocumentStoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-call aggregation options
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Abort with `Timeout` after this long
    pub timeout: Option<Duration>,
    /// Cancellation flag checked between stages and per record
    pub cancel: CancellationHandle,
}

impl AggregationPipeline {
    /// Create a new pipeline
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a `$match` stage
    pub fn filter(mut self, query: DocumentQuery) -> Self {
        self.stages.push(PipelineStage::Match(query));
        self
    }

    /// Append a `$project` stage
    pub fn project(mut self, spec: ProjectSpec) -> Self {
        self.stages.push(PipelineStage::Project(spec));
        self
    }

    /// Append a `$group` stage
    pub fn group(mut self, spec: GroupSpec) -> Self {
        self.stages.push(PipelineStage::Group(spec));
        self
    }

    /// Append a `$sort` stage
    pub fn sort(mut self, keys: &[(&str, SortDirection)]) -> Self {
        self.stages.push(PipelineStage::Sort(
            keys.iter().map(|(f, d)| (f.to_string(), *d)).collect(),
        ));
        self
    }

    /// Append a `$limit` stage
    pub fn limit(mut self, n: usize) -> Self {
        self.stages.push(PipelineStage::Limit(n));
        self
    }

    /// The leading `$match` predicate, usable as a scan filter
    pub fn leading_match(&self) -> Option<&DocumentQuery> {
        match self.stages.first() {
            Some(PipelineStage::Match(query)) => Some(query),
            _ => None,
        }
    }

    /// Parse pipeline from JSON
    pub fn from_json(stages: Vec<serde_json::Value>) -> Result<Self, DocumentStoreError> {
        let mut pipeline = Self::new();

        for stage_value in stages {
            let stage = Self::parse_stage(stage_value)?;
            pipeline.stages.push(stage);
        }

        Ok(pipeline)
    }

    /// Parse a single stage
    fn parse_stage(value: serde_json::Value) -> Result<PipelineStage, DocumentStoreError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentStoreError::PipelineError("Stage must be an object".into())
        })?;

        if obj.len() != 1 {
            return Err(DocumentStoreError::PipelineError(
                "Stage must have exactly one operator".into(),
            ));
        }

        let (op, val) = obj
            .iter()
            .next()
            .ok_or_else(|| DocumentStoreError::PipelineError("Empty stage operator".into()))?;

        match op.as_str() {
            "$match" => {
                let query = DocumentQuery::from_json(val.clone())
                    .map_err(|e| DocumentStoreError::PipelineError(format!("$match: {}", e)))?;
                Ok(PipelineStage::Match(query))
            }
            "$project" => Ok(PipelineStage::Project(Self::parse_project(val)?)),
            "$group" => Ok(PipelineStage::Group(Self::parse_group(val)?)),
            "$sort" => Ok(PipelineStage::Sort(Self::parse_sort(val)?)),
            "$limit" => {
                let limit = val.as_u64().filter(|n| *n > 0).ok_or_else(|| {
                    DocumentStoreError::PipelineError("$limit must be a positive integer".into())
                })? as usize;
                Ok(PipelineStage::Limit(limit))
            }
            _ => Err(DocumentStoreError::PipelineError(format!(
                "Unknown stage operator: {}",
                op
            ))),
        }
    }

    /// Parse project specification
    fn parse_project(value: &serde_json::Value) -> Result<ProjectSpec, DocumentStoreError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentStoreError::PipelineError("$project must be an object".into())
        })?;

        let mut spec = ProjectSpec::new();

        for (field, val) in obj {
            let pv = match val {
                serde_json::Value::Number(n) => {
                    if n.as_i64() == Some(0) {
                        ProjectValue::Exclude
                    } else {
                        ProjectValue::Include
                    }
                }
                serde_json::Value::Bool(b) => {
                    if *b {
                        ProjectValue::Include
                    } else {
                        ProjectValue::Exclude
                    }
                }
                _ => ProjectValue::Expression(Self::parse_expression(val)?),
            };
            spec.fields.push((field.clone(), pv));
        }

        let mixes_modes = spec.is_inclusion()
            && spec
                .fields
                .iter()
                .any(|(f, v)| f != "_id" && matches!(v, ProjectValue::Exclude));
        if mixes_modes {
            return Err(DocumentStoreError::PipelineError(
                "$project cannot mix inclusion and exclusion".into(),
            ));
        }

        Ok(spec)
    }

    /// Parse group specification
    fn parse_group(value: &serde_json::Value) -> Result<GroupSpec, DocumentStoreError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentStoreError::PipelineError("$group must be an object".into())
        })?;

        let id_val = obj
            .get("_id")
            .ok_or_else(|| DocumentStoreError::PipelineError("$group requires _id".into()))?;
        let mut spec = GroupSpec::new(Self::parse_expression(id_val)?);

        for (field, val) in obj {
            if field == "_id" {
                continue;
            }
            spec.accumulators
                .push((field.clone(), Self::parse_accumulator(val)?));
        }

        Ok(spec)
    }

    /// Parse accumulator
    fn parse_accumulator(value: &serde_json::Value) -> Result<Accumulator, DocumentStoreError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentStoreError::PipelineError("Accumulator must be an object".into())
        })?;

        if obj.len() != 1 {
            return Err(DocumentStoreError::PipelineError(
                "Accumulator must have exactly one operator".into(),
            ));
        }

        let (op, val) = obj.iter().next().ok_or_else(|| {
            DocumentStoreError::PipelineError("Empty accumulator operator".into())
        })?;

        match op.as_str() {
            "$sum" => Ok(Accumulator::Sum(Self::parse_expression(val)?)),
            "$min" => Ok(Accumulator::Min(Self::parse_expression(val)?)),
            "$max" => Ok(Accumulator::Max(Self::parse_expression(val)?)),
            "$first" => Ok(Accumulator::First(Self::parse_expression(val)?)),
            "$last" => Ok(Accumulator::Last(Self::parse_expression(val)?)),
            "$push" => Ok(Accumulator::Push(Self::parse_expression(val)?)),
            "$addToSet" => Ok(Accumulator::AddToSet(Self::parse_expression(val)?)),
            "$count" => Ok(Accumulator::Count),
            _ => Err(DocumentStoreError::PipelineError(format!(
                "Unknown accumulator: {}",
                op
            ))),
        }
    }

    /// Parse expression
    fn parse_expression(value: &serde_json::Value) -> Result<Expression, DocumentStoreError> {
        match value {
            serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
                Ok(Expression::Literal(value.clone()))
            }
            serde_json::Value::String(s) => {
                if let Some(stripped) = s.strip_prefix('$') {
                    if stripped.is_empty() {
                        return Err(DocumentStoreError::PipelineError(
                            "empty field reference".into(),
                        ));
                    }
                    Ok(Expression::Field(stripped.to_string()))
                } else {
                    Ok(Expression::Literal(value.clone()))
                }
            }
            serde_json::Value::Array(arr) => {
                let exprs: Result<Vec<_>, _> = arr.iter().map(Self::parse_expression).collect();
                Ok(Expression::Array(exprs?))
            }
            serde_json::Value::Object(obj) => {
                if let Some((op, val)) = obj.iter().next() {
                    if op.starts_with('$') && obj.len() == 1 {
                        return Self::parse_operator_expression(op, val);
                    }
                }

                let mut fields = Vec::with_capacity(obj.len());
                for (k, v) in obj {
                    fields.push((k.clone(), Self::parse_expression(v)?));
                }
                Ok(Expression::Object(fields))
            }
        }
    }

    /// Parse operator expression
    fn parse_operator_expression(
        op: &str,
        value: &serde_json::Value,
    ) -> Result<Expression, DocumentStoreError> {
        match op {
            "$literal" => Ok(Expression::Literal(value.clone())),
            "$size" => {
                // Accepts both {"$size": "$f"} and {"$size": ["$f"]}
                let inner = match value {
                    serde_json::Value::Array(args) if args.len() == 1 => &args[0],
                    other => other,
                };
                Ok(Expression::size(Self::parse_expression(inner)?))
            }
            "$ifNull" => {
                let args = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    DocumentStoreError::PipelineError("$ifNull requires two arguments".into())
                })?;
                Ok(Expression::if_null(
                    Self::parse_expression(&args[0])?,
                    Self::parse_expression(&args[1])?,
                ))
            }
            _ => Err(DocumentStoreError::PipelineError(format!(
                "Unknown expression operator: {}",
                op
            ))),
        }
    }

    /// Parse sort specification
    fn parse_sort(
        value: &serde_json::Value,
    ) -> Result<Vec<(String, SortDirection)>, DocumentStoreError> {
        let obj = value.as_object().ok_or_else(|| {
            DocumentStoreError::PipelineError("$sort must be an object".into())
        })?;

        if obj.is_empty() {
            return Err(DocumentStoreError::PipelineError(
                "$sort requires at least one key".into(),
            ));
        }

        let mut sort = Vec::new();

        for (field, dir) in obj {
            let direction = match dir.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => {
                    return Err(DocumentStoreError::PipelineError(
                        "Sort direction must be 1 or -1".into(),
                    ))
                }
            };
            sort.push((field.clone(), direction));
        }

        Ok(sort)
    }

    /// Check every field reference against the input schema
    ///
    /// Returns the schema of the pipeline output.
    pub fn validate(&self, input: &FieldSchema) -> Result<FieldSchema, DocumentStoreError> {
        let mut schema = input.clone();

        for (position, stage) in self.stages.iter().enumerate() {
            let require = |schema: &FieldSchema, field: &str| {
                if schema.contains(field) {
                    Ok(())
                } else {
                    Err(DocumentStoreError::PipelineError(format!(
                        "stage {} ({}) references unknown field '{}'",
                        position,
                        stage.name(),
                        field
                    )))
                }
            };

            schema = match stage {
                PipelineStage::Match(query) => {
                    for field in query.get_fields() {
                        require(&schema, &field)?;
                    }
                    schema
                }
                PipelineStage::Project(spec) => {
                    let mut refs = Vec::new();
                    for (field, value) in &spec.fields {
                        match value {
                            ProjectValue::Include => require(&schema, field)?,
                            ProjectValue::Expression(expr) => expr.collect_fields(&mut refs),
                            ProjectValue::Exclude => {}
                        }
                    }
                    for field in refs {
                        require(&schema, field)?;
                    }

                    if spec.is_inclusion() {
                        let mut output = FieldSchema::new(
                            spec.fields
                                .iter()
                                .filter(|(_, v)| !matches!(v, ProjectValue::Exclude))
                                .map(|(f, _)| f.clone()),
                        );
                        if !spec.excludes_id() {
                            output.insert("_id");
                        }
                        output
                    } else if schema.paths().next().is_none() {
                        schema
                    } else {
                        let excluded: Vec<&str> =
                            spec.fields.iter().map(|(f, _)| f.as_str()).collect();
                        FieldSchema::new(
                            schema
                                .paths()
                                .filter(|p| {
                                    !excluded
                                        .iter()
                                        .any(|e| p == e || p.starts_with(&format!("{}.", e)))
                                })
                                .map(String::from)
                                .collect::<Vec<_>>(),
                        )
                    }
                }
                PipelineStage::Group(spec) => {
                    let mut refs = Vec::new();
                    spec.id.collect_fields(&mut refs);
                    for (_, acc) in &spec.accumulators {
                        if let Some(expr) = acc.expression() {
                            expr.collect_fields(&mut refs);
                        }
                    }
                    for field in refs {
                        require(&schema, field)?;
                    }
                    let mut output =
                        FieldSchema::new(spec.accumulators.iter().map(|(f, _)| f.clone()));
                    output.insert("_id");
                    output
                }
                PipelineStage::Sort(keys) => {
                    for (field, _) in keys {
                        require(&schema, field)?;
                    }
                    schema
                }
                PipelineStage::Limit(0) => {
                    return Err(DocumentStoreError::PipelineError(format!(
                        "stage {} ($limit) must be positive",
                        position
                    )))
                }
                PipelineStage::Limit(_) => schema,
            };
        }

        Ok(schema)
    }

    /// Run every stage over `input`
    pub fn execute<'a, I>(
        &'a self,
        input: I,
        cancel: &'a CancellationHandle,
    ) -> Result<Vec<serde_json::Value>, DocumentStoreError>
    where
        I: IntoIterator<Item = serde_json::Value>,
        I::IntoIter: 'a,
    {
        Self::run_stages(&self.stages, input, cancel)
    }

    fn run_stages<'a, I>(
        stages: &'a [PipelineStage],
        input: I,
        cancel: &'a CancellationHandle,
    ) -> Result<Vec<serde_json::Value>, DocumentStoreError>
    where
        I: IntoIterator<Item = serde_json::Value>,
        I::IntoIter: 'a,
    {
        let mut stream = guarded(input.into_iter(), cancel);

        for stage in stages {
            cancel.check()?;
            stream = match stage {
                PipelineStage::Match(query) => Box::new(stream.filter(move |record| match record {
                    Ok(value) => query.matches(value),
                    Err(_) => true,
                })),
                PipelineStage::Project(spec) => Box::new(stream.map(move |record| {
                    record.and_then(|value| execute_project(spec, &value))
                })),
                PipelineStage::Group(spec) => {
                    let records = stream.collect::<Result<Vec<_>, _>>()?;
                    cancel.check()?;
                    guarded(execute_group(spec, records)?.into_iter(), cancel)
                }
                PipelineStage::Sort(keys) => {
                    let records = stream.collect::<Result<Vec<_>, _>>()?;
                    cancel.check()?;
                    guarded(execute_sort(keys, records).into_iter(), cancel)
                }
                PipelineStage::Limit(n) => Box::new(stream.take(*n)),
            };
        }

        let results = stream.collect::<Result<Vec<_>, _>>()?;
        cancel.check()?;
        Ok(results)
    }
}

/// Yield `Cancelled` in place of the next record once cancellation is requested
fn guarded<'a, I>(iter: I, cancel: &'a CancellationHandle) -> RecordStream<'a>
where
    I: Iterator<Item = serde_json::Value> + 'a,
{
    Box::new(iter.map(move |value| {
        cancel.check()?;
        Ok(value)
    }))
}

/// Execute project stage on one record
fn execute_project(
    spec: &ProjectSpec,
    record: &serde_json::Value,
) -> Result<serde_json::Value, DocumentStoreError> {
    if !spec.is_inclusion() {
        let mut out = record.clone();
        for (field, _) in &spec.fields {
            remove_path(&mut out, field);
        }
        return Ok(out);
    }

    let mut out = serde_json::Value::Object(serde_json::Map::new());

    if !spec.excludes_id() {
        if let Some(id) = record.get("_id") {
            set_path(&mut out, "_id", id.clone())?;
        }
    }

    for (field, value) in &spec.fields {
        let projected = match value {
            ProjectValue::Include => get_path(record, field).cloned(),
            ProjectValue::Expression(expr) => expr.evaluate(record)?,
            ProjectValue::Exclude => None,
        };
        if let Some(v) = projected {
            set_path(&mut out, field, v)?;
        }
    }

    Ok(out)
}

/// Execute group stage; groups are emitted in order of first appearance
fn execute_group(
    spec: &GroupSpec,
    records: Vec<serde_json::Value>,
) -> Result<Vec<serde_json::Value>, DocumentStoreError> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(serde_json::Value, Vec<serde_json::Value>)> = Vec::new();

    for record in records {
        let key = spec.id.evaluate(&record)?.unwrap_or(serde_json::Value::Null);
        let key_str = serde_json::to_string(&key).unwrap_or_default();
        match positions.get(&key_str) {
            Some(&idx) => groups[idx].1.push(record),
            None => {
                positions.insert(key_str, groups.len());
                groups.push((key, vec![record]));
            }
        }
    }

    let mut result = Vec::with_capacity(groups.len());

    for (key, members) in groups {
        let mut group_doc = serde_json::Map::new();
        group_doc.insert("_id".to_string(), key);

        for (field, acc) in &spec.accumulators {
            group_doc.insert(field.clone(), evaluate_accumulator(acc, &members)?);
        }

        result.push(serde_json::Value::Object(group_doc));
    }

    debug!(groups = result.len(), "group stage complete");
    Ok(result)
}

/// Execute sort stage; stable, so equal keys keep input order
fn execute_sort(
    keys: &[(String, SortDirection)],
    mut records: Vec<serde_json::Value>,
) -> Vec<serde_json::Value> {
    records.sort_by(|a, b| {
        for (field, direction) in keys {
            let cmp = compare_values(get_path(a, field), get_path(b, field));
            if cmp != Ordering::Equal {
                return match direction {
                    SortDirection::Ascending => cmp,
                    SortDirection::Descending => cmp.reverse(),
                };
            }
        }
        Ordering::Equal
    });
    records
}

/// Evaluate an accumulator over one group
fn evaluate_accumulator(
    acc: &Accumulator,
    records: &[serde_json::Value],
) -> Result<serde_json::Value, DocumentStoreError> {
    let values = |expr: &Expression| -> Result<Vec<serde_json::Value>, DocumentStoreError> {
        records
            .iter()
            .map(|r| Ok(expr.evaluate(r)?.unwrap_or(serde_json::Value::Null)))
            .collect()
    };

    match acc {
        Accumulator::Count => Ok(serde_json::json!(records.len())),
        Accumulator::Sum(expr) => {
            let mut int_sum: Option<i64> = Some(0);
            let mut float_sum = 0.0;
            for v in values(expr)? {
                if let serde_json::Value::Number(n) = v {
                    int_sum = int_sum.zip(n.as_i64()).and_then(|(a, b)| a.checked_add(b));
                    float_sum += n.as_f64().unwrap_or(0.0);
                }
            }
            Ok(match int_sum {
                Some(sum) => serde_json::json!(sum),
                None => serde_json::json!(float_sum),
            })
        }
        Accumulator::Min(expr) => Ok(values(expr)?
            .into_iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| compare_values(Some(a), Some(b)))
            .unwrap_or(serde_json::Value::Null)),
        Accumulator::Max(expr) => Ok(values(expr)?
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| compare_values(Some(a), Some(b)))
            .unwrap_or(serde_json::Value::Null)),
        Accumulator::First(expr) => match records.first() {
            Some(r) => Ok(expr.evaluate(r)?.unwrap_or(serde_json::Value::Null)),
            None => Ok(serde_json::Value::Null),
        },
        Accumulator::Last(expr) => match records.last() {
            Some(r) => Ok(expr.evaluate(r)?.unwrap_or(serde_json::Value::Null)),
            None => Ok(serde_json::Value::Null),
        },
        Accumulator::Push(expr) => Ok(serde_json::Value::Array(values(expr)?)),
        Accumulator::AddToSet(expr) => {
            let mut set: Vec<serde_json::Value> = Vec::new();
            for v in values(expr)? {
                if !set.contains(&v) {
                    set.push(v);
                }
            }
            Ok(serde_json::Value::Array(set))
        }
    }
}

/// Validate and run a pipeline against a backend collection
///
/// A leading `$match` becomes the scan predicate so the backend can pick an
/// index. The pipeline runs over a snapshot and never holds a collection lock.
pub async fn aggregate(
    backend: &dyn DocumentBackend,
    collection: &str,
    pipeline: &AggregationPipeline,
    options: &AggregateOptions,
) -> Result<Vec<serde_json::Value>, DocumentStoreError> {
    let run = async {
        let schema = backend.schema(collection).await?;
        pipeline.validate(&schema.fields)?;
        options.cancel.check()?;

        let (filter, rest) = match pipeline.leading_match() {
            Some(query) => (query.clone(), &pipeline.stages[1..]),
            None => (DocumentQuery::new(), &pipeline.stages[..]),
        };

        let snapshot = backend.scan(collection, &filter).await?;
        debug!(
            collection,
            access_path = %snapshot.access_path(),
            candidates = snapshot.candidate_count(),
            stages = pipeline.stages.len(),
            "running aggregation"
        );

        let records = snapshot.into_matches().map(|doc| doc.data.clone());
        AggregationPipeline::run_stages(rest, records, &options.cancel)
    };

    match options.timeout {
        Some(limit) => with_timeout(limit, run).await,
        None => run.await,
    }
}
