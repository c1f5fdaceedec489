//! Secondary indexes.
//!
//! Single, compound and unique indexes keep an ordered map from key tuple to
//! the set of ids carrying that tuple. Text indexes keep an inverted map from
//! lower-cased token to ids.
//!
//! Indexes only narrow the candidate set. [`IndexManager::lookup`] returns
//! `None` when no index applies, and callers always re-check candidates with
//! the matcher.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{self, Write as _},
    ops::Bound,
};

use crate::{
    document::{Document, Numeric, stringify},
    error::{DocumentStoreError, DocumentStoreResult},
    query::{Expr, FieldOp, Pattern, Query, QueryVisitor},
};

/// Set of document ids returned by index lookups.
pub type IdSet = BTreeSet<String>;

/// Kind of secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Single,
    Compound,
    Unique,
    Text,
}

/// Declares an index over one or more fields.
///
/// Deserializes from `{"name": "...", "fields": [...], "type": "unique"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(rename = "type")]
    pub kind: IndexKind,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>, kind: IndexKind) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            kind,
        }
    }

    pub fn single(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(name, [field.into()], IndexKind::Single)
    }

    pub fn compound(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(name, fields, IndexKind::Compound)
    }

    pub fn unique(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(name, fields, IndexKind::Unique)
    }

    pub fn text(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(name, fields, IndexKind::Text)
    }

    fn validate(&self) -> DocumentStoreResult<()> {
        if self.name.is_empty() {
            return Err(DocumentStoreError::InvalidIndex("index name cannot be empty".into()));
        }
        if self.fields.is_empty() || self.fields.iter().any(String::is_empty) {
            return Err(DocumentStoreError::InvalidIndex(format!(
                "index {} needs at least one non-empty field",
                self.name
            )));
        }
        if self.kind == IndexKind::Single && self.fields.len() != 1 {
            return Err(DocumentStoreError::InvalidIndex(format!(
                "single index {} must cover exactly one field",
                self.name
            )));
        }
        Ok(())
    }
}

/// One component of an index key.
///
/// Ordered by kind first (`Missing < Null < Bool < Number < String <
/// Composite`) and then by value, so every kind occupies one contiguous
/// range of the index.
#[derive(Debug, Clone)]
enum IndexValue {
    Missing,
    Null,
    Bool(bool),
    Number(Numeric),
    String(String),
    Composite(String),
}

impl IndexValue {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexValue::Null,
            Value::Bool(b) => IndexValue::Bool(*b),
            Value::Number(n) => IndexValue::Number(Numeric::of(n)),
            Value::String(s) => IndexValue::String(s.clone()),
            composite => {
                let mut out = String::new();
                write_canonical(&mut out, composite);
                IndexValue::Composite(out)
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexValue::Missing => 0,
            IndexValue::Null => 1,
            IndexValue::Bool(_) => 2,
            IndexValue::Number(_) => 3,
            IndexValue::String(_) => 4,
            IndexValue::Composite(_) => 5,
        }
    }

    /// Smallest value of the same kind, for kinds that support ranges.
    fn floor(&self) -> Option<IndexValue> {
        match self {
            IndexValue::Bool(_) => Some(IndexValue::Bool(false)),
            IndexValue::Number(_) => Some(IndexValue::Number(Numeric::Float(f64::NEG_INFINITY))),
            IndexValue::String(_) => Some(IndexValue::String(String::new())),
            _ => None,
        }
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Bool(a), IndexValue::Bool(b)) => a.cmp(b),
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::String(a), IndexValue::String(b)) => a.cmp(b),
            (IndexValue::Composite(a), IndexValue::Composite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Missing => f.write_str("<missing>"),
            IndexValue::Null => f.write_str("null"),
            IndexValue::Bool(b) => write!(f, "{}", b),
            IndexValue::Number(Numeric::Int(i)) => write!(f, "{}", i),
            IndexValue::Number(Numeric::Float(n)) => write!(f, "{}", n),
            IndexValue::String(s) => write!(f, "{:?}", s),
            IndexValue::Composite(c) => f.write_str(c),
        }
    }
}

/// Renders composites with numbers in one canonical form, so `[1]` and
/// `[1.0]` produce the same key.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Number(n) => {
            let number = Numeric::of(n);
            let _ = match (number.as_integer(), number) {
                (Some(i), _) => write!(out, "{}", i),
                (None, Numeric::Float(f)) => write!(out, "{}", f),
                (None, Numeric::Int(i)) => write!(out, "{}", i),
            };
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{:?}:", key);
                write_canonical(out, item);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey(Vec<IndexValue>);

impl IndexKey {
    fn for_document(fields: &[String], document: &Document) -> Self {
        IndexKey(
            fields
                .iter()
                .map(|field| document.get(field).map_or(IndexValue::Missing, IndexValue::from_value))
                .collect(),
        )
    }

    fn is_sparse(&self) -> bool {
        self.0.iter().any(|value| matches!(value, IndexValue::Missing))
    }

    fn starts_with(&self, prefix: &[IndexValue]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", value)?;
        }
        f.write_str(")")
    }
}

/// Splits text into lower-cased alphanumeric tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone)]
enum IndexData {
    Ordered(BTreeMap<IndexKey, IdSet>),
    Text(BTreeMap<String, IdSet>),
}

#[derive(Debug, Clone)]
struct Index {
    definition: IndexDefinition,
    data: IndexData,
}

impl Index {
    fn new(definition: IndexDefinition) -> Self {
        let data = match definition.kind {
            IndexKind::Text => IndexData::Text(BTreeMap::new()),
            _ => IndexData::Ordered(BTreeMap::new()),
        };
        Self { definition, data }
    }

    fn is_unique(&self) -> bool {
        self.definition.kind == IndexKind::Unique
    }

    fn key(&self, document: &Document) -> IndexKey {
        IndexKey::for_document(&self.definition.fields, document)
    }

    /// Returns the id already holding this document's unique key, if any.
    fn conflict(&self, document: &Document, id: &str) -> Option<(IndexKey, String)> {
        let IndexData::Ordered(entries) = &self.data else {
            return None;
        };
        if !self.is_unique() {
            return None;
        }

        let key = self.key(document);
        if key.is_sparse() {
            return None;
        }

        let holder = entries.get(&key)?.iter().find(|other| other.as_str() != id)?.clone();
        Some((key, holder))
    }

    fn add(&mut self, id: &str, document: &Document) {
        match &mut self.data {
            IndexData::Ordered(entries) => {
                let key = IndexKey::for_document(&self.definition.fields, document);
                entries.entry(key).or_default().insert(id.to_string());
            }
            IndexData::Text(tokens) => {
                for token in Index::tokens_of(&self.definition.fields, document) {
                    tokens.entry(token).or_default().insert(id.to_string());
                }
            }
        }
    }

    fn remove(&mut self, id: &str, document: &Document) {
        match &mut self.data {
            IndexData::Ordered(entries) => {
                let key = IndexKey::for_document(&self.definition.fields, document);
                if let Some(ids) = entries.get_mut(&key) {
                    ids.remove(id);
                }
            }
            IndexData::Text(tokens) => {
                for token in Index::tokens_of(&self.definition.fields, document) {
                    if let Some(ids) = tokens.get_mut(&token) {
                        ids.remove(id);
                    }
                }
            }
        }
    }

    fn tokens_of(fields: &[String], document: &Document) -> BTreeSet<String> {
        fields
            .iter()
            .filter_map(|field| document.get(field))
            .flat_map(|value| tokenize(&stringify(value)).collect::<Vec<_>>())
            .collect()
    }

    fn unchanged(&self, old: &Document, new: &Document) -> bool {
        match self.data {
            IndexData::Ordered(_) => self.key(old) == self.key(new),
            IndexData::Text(_) => {
                Index::tokens_of(&self.definition.fields, old) == Index::tokens_of(&self.definition.fields, new)
            }
        }
    }

    fn prefix(&self, prefix: &[IndexValue]) -> IdSet {
        let IndexData::Ordered(entries) = &self.data else {
            return IdSet::new();
        };

        entries
            .range(IndexKey(prefix.to_vec())..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Ids whose first key component satisfies a range operator.
    fn range(&self, op: FieldOp, bound: IndexValue) -> IdSet {
        let IndexData::Ordered(entries) = &self.data else {
            return IdSet::new();
        };
        let Some(floor) = bound.floor() else {
            return IdSet::new();
        };
        let rank = bound.rank();

        let start = match op {
            FieldOp::Gt | FieldOp::Gte => bound.clone(),
            _ => floor,
        };

        entries
            .range((Bound::Included(IndexKey(vec![start])), Bound::Unbounded))
            .map_while(|(key, ids)| {
                let first = key.0.first()?;
                (first.rank() == rank).then_some((first, ids))
            })
            .filter(|(first, _)| match op {
                FieldOp::Gt => *first > &bound,
                FieldOp::Gte => *first >= &bound,
                FieldOp::Lt => *first < &bound,
                _ => *first <= &bound,
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    fn containing(&self, literal: &str) -> IdSet {
        let IndexData::Text(tokens) = &self.data else {
            return IdSet::new();
        };
        let needle = literal.to_lowercase();

        tokens
            .iter()
            .filter(|(token, _)| token.contains(&needle))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    fn compact(&mut self) -> usize {
        let before = self.bucket_count();
        match &mut self.data {
            IndexData::Ordered(entries) => entries.retain(|_, ids| !ids.is_empty()),
            IndexData::Text(tokens) => tokens.retain(|_, ids| !ids.is_empty()),
        }
        before - self.bucket_count()
    }

    fn bucket_count(&self) -> usize {
        match &self.data {
            IndexData::Ordered(entries) => entries.len(),
            IndexData::Text(tokens) => tokens.len(),
        }
    }
}

/// Maintains every secondary index of one collection.
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: IndexMap<String, Index>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index and fills it from `documents`.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::InvalidIndex`] for a malformed or duplicate
    /// definition, [`DocumentStoreError::UniqueConstraint`] when a unique
    /// index meets duplicates among existing documents. No index is left
    /// behind on error.
    pub fn create_index<'a>(
        &mut self,
        definition: IndexDefinition,
        documents: impl IntoIterator<Item = (&'a str, &'a Document)>,
    ) -> DocumentStoreResult<()> {
        definition.validate()?;
        if self.indexes.contains_key(&definition.name) {
            return Err(DocumentStoreError::InvalidIndex(format!(
                "index {} already exists",
                definition.name
            )));
        }

        let mut index = Index::new(definition);
        for (id, document) in documents {
            if let Some((key, _)) = index.conflict(document, id) {
                return Err(DocumentStoreError::UniqueConstraint {
                    index: index.definition.name.clone(),
                    key: key.to_string(),
                });
            }
            index.add(id, document);
        }

        log::debug!(
            "built {:?} index {} over {:?} with {} buckets",
            index.definition.kind,
            index.definition.name,
            index.definition.fields,
            index.bucket_count()
        );
        self.indexes.insert(index.definition.name.clone(), index);
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> DocumentStoreResult<IndexDefinition> {
        self.indexes
            .shift_remove(name)
            .map(|index| index.definition)
            .ok_or_else(|| DocumentStoreError::NotFound(format!("index {}", name)))
    }

    pub fn list_indexes(&self) -> Vec<IndexDefinition> {
        self.indexes.values().map(|index| index.definition.clone()).collect()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    /// Fails if writing `document` under `id` would break a unique index.
    pub fn check_unique(&self, id: &str, document: &Document) -> DocumentStoreResult<()> {
        for index in self.indexes.values() {
            if let Some((key, holder)) = index.conflict(document, id) {
                log::debug!("unique index {} rejects {}: key {} held by {}", index.definition.name, id, key, holder);
                return Err(DocumentStoreError::UniqueConstraint {
                    index: index.definition.name.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn on_insert(&mut self, id: &str, document: &Document) {
        for index in self.indexes.values_mut() {
            index.add(id, document);
        }
    }

    /// Moves `id` between buckets of the indexes whose key changed.
    pub fn on_update(&mut self, id: &str, old: &Document, new: &Document) {
        for index in self.indexes.values_mut() {
            if index.unchanged(old, new) {
                continue;
            }
            index.remove(id, old);
            index.add(id, new);
        }
    }

    pub fn on_delete(&mut self, id: &str, document: &Document) {
        for index in self.indexes.values_mut() {
            index.remove(id, document);
        }
    }

    pub fn clear(&mut self) {
        for index in self.indexes.values_mut() {
            *index = Index::new(index.definition.clone());
        }
    }

    /// Candidate ids for a query, or `None` when a full scan is required.
    pub fn lookup(&self, query: &Query) -> Option<IdSet> {
        if self.indexes.is_empty() {
            return None;
        }
        IndexPlanner { manager: self }.visit_expr(query.expr()).ok().flatten()
    }

    /// Ids whose text-indexed `field` contains every token of `text`.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::NotFound`] if no text index covers `field`.
    pub fn search_text(&self, field: &str, text: &str) -> DocumentStoreResult<IdSet> {
        let index = self
            .indexes
            .values()
            .find(|index| index.definition.kind == IndexKind::Text && index.definition.fields.iter().any(|f| f == field))
            .ok_or_else(|| DocumentStoreError::NotFound(format!("text index on {}", field)))?;
        let IndexData::Text(tokens) = &index.data else {
            return Ok(IdSet::new());
        };

        let mut result: Option<IdSet> = None;
        for token in tokenize(text) {
            let ids = tokens.get(&token).cloned().unwrap_or_default();
            result = Some(match result {
                Some(acc) => acc.intersection(&ids).cloned().collect(),
                None => ids,
            });
        }
        Ok(result.unwrap_or_default())
    }

    /// Drops empty buckets, returning how many were removed.
    pub fn compact(&mut self) -> usize {
        self.indexes.values_mut().map(Index::compact).sum()
    }

    fn ordered_on(&self, field: &str) -> Option<&Index> {
        self.indexes
            .values()
            .filter(|index| {
                index.definition.kind != IndexKind::Text && index.definition.fields.first().is_some_and(|f| f == field)
            })
            .min_by_key(|index| index.definition.fields.len())
    }

    fn text_on(&self, field: &str) -> Option<&Index> {
        self.indexes
            .values()
            .find(|index| index.definition.kind == IndexKind::Text && index.definition.fields.iter().any(|f| f == field))
    }
}

/// Turns a query into an index-backed candidate set.
struct IndexPlanner<'a> {
    manager: &'a IndexManager,
}

impl IndexPlanner<'_> {
    /// Equality lookups over compound prefixes longer than one field.
    fn compound_prefixes(&self, equalities: &HashMap<&str, &Value>) -> Vec<IdSet> {
        self.manager
            .indexes
            .values()
            .filter(|index| index.definition.kind != IndexKind::Text && index.definition.fields.len() > 1)
            .filter_map(|index| {
                let prefix: Vec<IndexValue> = index
                    .definition
                    .fields
                    .iter()
                    .map_while(|field| equalities.get(field.as_str()).map(|value| IndexValue::from_value(value)))
                    .collect();
                (prefix.len() > 1).then(|| index.prefix(&prefix))
            })
            .collect()
    }
}

fn intersect(sets: impl IntoIterator<Item = IdSet>) -> Option<IdSet> {
    sets.into_iter().fold(None, |acc, set| match acc {
        None => Some(set),
        Some(acc) => Some(acc.intersection(&set).cloned().collect()),
    })
}

impl QueryVisitor for IndexPlanner<'_> {
    type Output = Option<IdSet>;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        let mut sets = Vec::new();
        let mut equalities = HashMap::new();

        for expr in exprs {
            if let Expr::Field { field, op: FieldOp::Eq, value } = expr {
                equalities.insert(field.as_str(), value);
            }
            if let Some(set) = self.visit_expr(expr)? {
                sets.push(set);
            }
        }

        if equalities.len() > 1 {
            sets.extend(self.compound_prefixes(&equalities));
        }

        sets.sort_by_key(BTreeSet::len);
        Ok(intersect(sets))
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        let mut union = IdSet::new();
        for expr in exprs {
            match self.visit_expr(expr)? {
                Some(set) => union.extend(set),
                None => return Ok(None),
            }
        }
        Ok(Some(union))
    }

    fn visit_not(&mut self, _expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(None)
    }

    fn visit_exists(&mut self, _field: &str, _should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(None)
    }

    fn visit_regex(&mut self, field: &str, pattern: &Pattern) -> Result<Self::Output, Self::Error> {
        let Some(literal) = pattern.literal() else {
            return Ok(None);
        };
        Ok(self.manager.text_on(field).map(|index| index.containing(literal)))
    }

    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Value) -> Result<Self::Output, Self::Error> {
        let Some(index) = self.manager.ordered_on(field) else {
            return Ok(None);
        };

        let set = match op {
            FieldOp::Eq => index.prefix(&[IndexValue::from_value(value)]),
            FieldOp::In => value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .flat_map(|item| index.prefix(&[IndexValue::from_value(item)]))
                        .collect()
                })
                .unwrap_or_default(),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => index.range(op, IndexValue::from_value(value)),
            FieldOp::Ne | FieldOp::Nin => return Ok(None),
        };

        Ok(Some(set))
    }
}
