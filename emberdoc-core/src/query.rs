//! Query construction, parsing and traversal.
//!
//! Queries arrive either as JSON operator objects or are assembled in Rust with
//! [`Filter`]. Both produce the same [`Expr`] tree, which is walked by
//! implementations of [`QueryVisitor`] (the matcher and the index planner).
//!
//! # JSON syntax
//!
//! ```ignore
//! use serde_json::json;
//! use emberdoc::query::Query;
//!
//! // literal equality, operator objects and logical combinators
//! let query = Query::parse(&json!({
//!     "status": "active",
//!     "age": { "$gte": 18, "$lt": 65 },
//!     "$or": [ { "role": "admin" }, { "tags": { "$in": [["staff"], "owner"] } } ]
//! }))?;
//! ```
//!
//! Field operators: `$eq $ne $gt $gte $lt $lte $in $nin $regex $exists`
//! (`$regex` takes an optional sibling `$options`, and `$not` may wrap an
//! operator object). Logical operators: `$and $or $not`. The empty object
//! matches every document.
//!
//! # Builder API
//!
//! ```ignore
//! use emberdoc::query::Filter;
//!
//! let expr = Filter::eq("status", "active").and(Filter::gt("age", 18));
//! ```

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};
use std::{cmp::Ordering, fmt};

use crate::{
    document::{Document, ID_FIELD, compare_values},
    error::{DocumentStoreError, DocumentStoreResult},
};

/// Field comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// Equal to (deep equality).
    Eq,
    /// Not equal to. True for missing fields.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Equal to one of the listed values.
    In,
    /// Equal to none of the listed values. True for missing fields.
    Nin,
}

impl FieldOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::In => "$in",
            FieldOp::Nin => "$nin",
        }
    }

    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => FieldOp::Eq,
            "$ne" => FieldOp::Ne,
            "$gt" => FieldOp::Gt,
            "$gte" => FieldOp::Gte,
            "$lt" => FieldOp::Lt,
            "$lte" => FieldOp::Lte,
            "$in" => FieldOp::In,
            "$nin" => FieldOp::Nin,
            _ => return None,
        })
    }

    /// True for the ordering operators `$gt $gte $lt $lte`.
    pub fn is_range(&self) -> bool {
        matches!(self, FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte)
    }
}

/// A compiled regular expression predicate.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    options: String,
    regex: Regex,
}

impl Pattern {
    /// Compiles a pattern with optional `i`, `m`, `s` and `x` flags.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Query`] for an invalid pattern or unknown flag.
    pub fn new(source: impl Into<String>, options: impl Into<String>) -> DocumentStoreResult<Self> {
        let source = source.into();
        let options = options.into();
        let mut builder = RegexBuilder::new(&source);

        for flag in options.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => {
                    return Err(DocumentStoreError::Query(format!(
                        "unknown $regex option '{}'",
                        other
                    )));
                }
            };
        }

        let regex = builder
            .build()
            .map_err(|err| DocumentStoreError::Query(format!("invalid $regex '{}': {}", source, err)))?;

        Ok(Self { source, options, regex })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Returns the pattern itself when it is a plain alphanumeric literal
    /// without flags, i.e. it matches exactly the texts containing it.
    pub fn literal(&self) -> Option<&str> {
        let plain = !self.source.is_empty()
            && self.source.chars().all(char::is_alphanumeric)
            && self.options.is_empty();

        plain.then_some(self.source.as_str())
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("$regex".into(), Value::String(self.source.clone()));
        if !self.options.is_empty() {
            map.insert("$options".into(), Value::String(self.options.clone()));
        }
        Value::Object(map)
    }
}

/// A filter expression.
///
/// Expressions can be combined using logical operators (`And`, `Or`, `Not`)
/// to build complex filter predicates.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match, empty matches all).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match, empty matches none).
    Or(Vec<Expr>),
    /// Logical NOT of an expression.
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Regular expression over the stringified field value.
    Regex(String, Pattern),
    /// Field comparison expression.
    Field {
        /// The field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The operand. An array for `$in`/`$nin`.
        value: Value,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Value) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Renders the expression back to its canonical JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            Expr::And(list) if list.is_empty() => json!({}),
            Expr::And(list) => json!({ "$and": list.iter().map(Expr::to_value).collect::<Vec<_>>() }),
            Expr::Or(list) => json!({ "$or": list.iter().map(Expr::to_value).collect::<Vec<_>>() }),
            Expr::Not(inner) => json!({ "$not": inner.to_value() }),
            Expr::Exists(field, should_exist) => single(field, json!({ "$exists": should_exist })),
            Expr::Regex(field, pattern) => single(field, pattern.to_value()),
            Expr::Field { field, op, value } => single(field, single(op.as_str(), value.clone())),
        }
    }

    /// The id pinned by an `id` equality at the top of the tree (directly or
    /// as a conjunct), if any.
    pub(crate) fn id_equality(&self) -> Option<&str> {
        match self {
            Expr::Field { field, op: FieldOp::Eq, value: Value::String(id) } if field == ID_FIELD => Some(id),
            Expr::And(list) => list.iter().find_map(Expr::id_equality),
            _ => None,
        }
    }
}

fn single(field: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), value);
    Value::Object(map)
}

/// A parsed query.
///
/// The [`fingerprint`](Query::fingerprint) is the canonical JSON of the parsed
/// tree, so two spellings of the same query share one cache entry.
#[derive(Debug, Clone)]
pub struct Query {
    expr: Expr,
    fingerprint: String,
}

impl Query {
    /// The query matching every document.
    pub fn all() -> Self {
        Self::from(Expr::And(Vec::new()))
    }

    /// Parses a JSON query object.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Query`] for non-object queries, unknown
    /// operators, malformed operands or invalid regular expressions.
    pub fn parse(value: &Value) -> DocumentStoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from(parse_object(map)?)),
            Value::Null => Ok(Self::all()),
            other => Err(DocumentStoreError::Query(format!(
                "query must be an object, found {}",
                other
            ))),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Canonical JSON form of this query.
    pub fn to_value(&self) -> Value {
        self.expr.to_value()
    }

    /// Returns true for the match-everything query.
    pub fn is_empty(&self) -> bool {
        matches!(&self.expr, Expr::And(list) if list.is_empty())
    }

    /// Evaluates this query against a document.
    pub fn matches(&self, document: &Document) -> bool {
        crate::matcher::matches(document, self)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl From<Expr> for Query {
    fn from(expr: Expr) -> Self {
        let fingerprint = expr.to_value().to_string();
        Self { expr, fingerprint }
    }
}

impl From<Query> for Value {
    fn from(query: Query) -> Self {
        query.to_value()
    }
}

impl From<Expr> for Value {
    fn from(expr: Expr) -> Self {
        expr.to_value()
    }
}

impl TryFrom<Value> for Query {
    type Error = DocumentStoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Query::parse(&value)
    }
}

impl TryFrom<&Value> for Query {
    type Error = DocumentStoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Query::parse(value)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

fn parse_object(map: &Map<String, Value>) -> DocumentStoreResult<Expr> {
    let mut exprs = Vec::with_capacity(map.len());

    for (key, value) in map {
        let expr = match key.as_str() {
            "$and" => Expr::And(parse_list(key, value)?),
            "$or" => Expr::Or(parse_list(key, value)?),
            "$not" => match value {
                Value::Object(inner) => parse_object(inner)?.not(),
                _ => return Err(DocumentStoreError::Query("$not expects an object".into())),
            },
            op if op.starts_with('$') => {
                return Err(DocumentStoreError::Query(format!("unknown operator {}", op)));
            }
            field => parse_field(field, value)?,
        };
        exprs.push(expr);
    }

    Ok(flatten(exprs))
}

fn parse_list(op: &str, value: &Value) -> DocumentStoreResult<Vec<Expr>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(inner) => parse_object(inner),
                _ => Err(DocumentStoreError::Query(format!("{} expects an array of objects", op))),
            })
            .collect(),
        _ => Err(DocumentStoreError::Query(format!("{} expects an array", op))),
    }
}

fn parse_field(field: &str, value: &Value) -> DocumentStoreResult<Expr> {
    let operators = match value {
        Value::Object(map) if !map.is_empty() && map.keys().any(|k| k.starts_with('$')) => map,
        literal => return Ok(Expr::field(field.to_string(), FieldOp::Eq, literal.clone())),
    };

    if let Some(key) = operators.keys().find(|k| !k.starts_with('$')) {
        return Err(DocumentStoreError::Query(format!(
            "cannot mix operators and literal key '{}' on field '{}'",
            key, field
        )));
    }

    let mut exprs = Vec::with_capacity(operators.len());

    for (op, operand) in operators {
        let expr = match op.as_str() {
            "$exists" => match operand {
                Value::Bool(flag) => Expr::Exists(field.to_string(), *flag),
                _ => return Err(DocumentStoreError::Query("$exists expects a boolean".into())),
            },
            "$regex" => {
                let source = operand
                    .as_str()
                    .ok_or_else(|| DocumentStoreError::Query("$regex expects a string".into()))?;
                let options = match operators.get("$options") {
                    None => "",
                    Some(Value::String(options)) => options.as_str(),
                    Some(_) => return Err(DocumentStoreError::Query("$options expects a string".into())),
                };
                Expr::Regex(field.to_string(), Pattern::new(source, options)?)
            }
            "$options" if operators.contains_key("$regex") => continue,
            "$options" => return Err(DocumentStoreError::Query("$options requires $regex".into())),
            "$not" => match operand {
                Value::Object(_) => parse_field(field, operand)?.not(),
                _ => return Err(DocumentStoreError::Query("$not expects an operator object".into())),
            },
            other => match FieldOp::parse(other) {
                Some(op @ (FieldOp::In | FieldOp::Nin)) if !operand.is_array() => {
                    return Err(DocumentStoreError::Query(format!("{} expects an array", op.as_str())));
                }
                Some(op) => Expr::field(field.to_string(), op, operand.clone()),
                None => return Err(DocumentStoreError::Query(format!("unknown operator {}", other))),
            },
        };
        exprs.push(expr);
    }

    Ok(flatten(exprs))
}

fn flatten(mut exprs: Vec<Expr>) -> Expr {
    if exprs.len() == 1 {
        exprs.remove(0)
    } else {
        Expr::And(exprs)
    }
}

/// Helper struct for constructing filter expressions.
///
/// All methods accept field names as `Into<String>` and values as `Into<Value>`.
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the value.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field is missing or differs from the value.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents where the field equals any of the values.
    pub fn any_of(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Expr {
        let values = values.into_iter().map(Into::into).collect();
        Expr::field(field.into(), FieldOp::In, Value::Array(values))
    }

    /// Matches documents where the field equals none of the values.
    pub fn none_of(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Expr {
        let values = values.into_iter().map(Into::into).collect();
        Expr::field(field.into(), FieldOp::Nin, Value::Array(values))
    }

    /// Creates a regular expression filter.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Query`] if the pattern does not compile.
    pub fn regex(field: impl Into<String>, pattern: &str) -> DocumentStoreResult<Expr> {
        Ok(Expr::Regex(field.into(), Pattern::new(pattern, "")?))
    }

    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9).
    Asc,
    /// Descending order (Z to A, 9 to 0).
    Desc,
}

/// Sort specification for query results.
#[derive(Debug, Clone)]
pub struct Sort {
    /// The field path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

/// Result shaping applied after matching: sort, then skip, then limit.
///
/// Without a sort, results keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Optional sort specification.
    pub sort: Option<Sort>,
    /// Number of documents to skip.
    pub offset: Option<usize>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn builder() -> FindOptionsBuilder {
        FindOptionsBuilder::default()
    }

    /// Sorts, skips and truncates a result set. The sort is stable, documents
    /// missing the sort field come first in ascending order, and values of
    /// different kinds are ordered by kind.
    pub fn apply(&self, mut documents: Vec<Document>) -> Vec<Document> {
        if let Some(sort) = &self.sort {
            documents.sort_by(|a, b| {
                let ordering = compare_for_sort(a.get(&sort.field), b.get(&sort.field));
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }

        documents
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

fn compare_for_sort(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or_else(|| rank(a).cmp(&rank(b))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptionsBuilder {
    options: FindOptions,
}

impl FindOptionsBuilder {
    /// Sets the sort specification.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.options.sort = Some(Sort { field: field.into(), direction });
        self
    }

    /// Sets the number of documents to skip.
    pub fn offset(mut self, offset: usize) -> Self {
        self.options.offset = Some(offset);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn build(self) -> FindOptions {
        self.options
    }
}

/// Walks an [`Expr`] tree.
pub trait QueryVisitor {
    type Output;
    type Error: Into<DocumentStoreError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_regex(
        &mut self,
        field: &str,
        pattern: &Pattern,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: FieldOp,
        value: &Value,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Regex(field, pattern) => self.visit_regex(field, pattern),
            Expr::Field { field, op, value } => self.visit_field(field, *op, value),
        }
    }
}
