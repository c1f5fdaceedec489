//! Query evaluation against a single document.
//!
//! Missing fields never match an operator except `$ne`, `$nin` and
//! `$exists: false`. Ordering operators only compare values of the same kind.
//! `$and` and `$or` short-circuit.

use serde_json::Value;
use std::cmp::Ordering;

use crate::{
    document::{Document, compare_values, stringify, values_equal},
    error::DocumentStoreError,
    query::{Expr, FieldOp, Pattern, Query, QueryVisitor},
};

/// Returns true if the document satisfies the query.
pub fn matches(document: &Document, query: &Query) -> bool {
    DocumentEvaluator::new(document)
        .evaluate(query.expr())
        .unwrap_or(false)
}

/// Evaluates field comparisons for a value that may be absent.
pub(crate) fn compare_field(field_value: Option<&Value>, op: FieldOp, operand: &Value) -> bool {
    let Some(field_value) = field_value else {
        return matches!(op, FieldOp::Ne | FieldOp::Nin);
    };

    match op {
        FieldOp::Eq => values_equal(field_value, operand),
        FieldOp::Ne => !values_equal(field_value, operand),
        FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
            match compare_values(field_value, operand) {
                Some(ordering) => match op {
                    FieldOp::Gt => ordering == Ordering::Greater,
                    FieldOp::Gte => ordering != Ordering::Less,
                    FieldOp::Lt => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                },
                None => false,
            }
        }
        FieldOp::In => listed(operand).iter().any(|candidate| values_equal(field_value, candidate)),
        FieldOp::Nin => !listed(operand).iter().any(|candidate| values_equal(field_value, candidate)),
    }
}

fn listed(operand: &Value) -> &[Value] {
    match operand {
        Value::Array(items) => items,
        _ => &[],
    }
}

pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> Result<bool, DocumentStoreError> {
        self.visit_expr(expr)
    }
}

impl<'a> QueryVisitor for DocumentEvaluator<'a> {
    type Output = bool;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(self.document.contains(field) == should_exist)
    }

    fn visit_regex(&mut self, field: &str, pattern: &Pattern) -> Result<Self::Output, Self::Error> {
        Ok(self
            .document
            .get(field)
            .is_some_and(|value| pattern.is_match(&stringify(value))))
    }

    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Value) -> Result<Self::Output, Self::Error> {
        Ok(compare_field(self.document.get(field), op, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn check(document: &Document, query: Value) -> bool {
        matches(document, &Query::parse(&query).unwrap())
    }

    #[test]
    fn test_literal_equality_requires_every_field() {
        let d = doc(json!({ "id": "1", "name": "Alice", "age": 30 }));

        assert!(check(&d, json!({ "name": "Alice" })));
        assert!(check(&d, json!({ "name": "Alice", "age": 30.0 })));
        assert!(!check(&d, json!({ "name": "Alice", "age": 31 })));
        assert!(!check(&d, json!({ "email": null })));
        assert!(check(&d, json!({})));
    }

    #[test]
    fn test_missing_field_semantics() {
        let d = doc(json!({ "id": "1" }));

        assert!(check(&d, json!({ "age": { "$ne": 5 } })));
        assert!(check(&d, json!({ "age": { "$nin": [5] } })));
        assert!(check(&d, json!({ "age": { "$exists": false } })));
        assert!(!check(&d, json!({ "age": { "$exists": true } })));
        assert!(!check(&d, json!({ "age": { "$gt": 1 } })));
        assert!(!check(&d, json!({ "age": { "$lte": 1 } })));
        assert!(!check(&d, json!({ "age": { "$in": [null] } })));
        assert!(!check(&d, json!({ "age": { "$regex": "." } })));
    }

    #[test]
    fn test_range_operators() {
        let d = doc(json!({ "id": "1", "age": 30, "name": "bob" }));

        assert!(check(&d, json!({ "age": { "$gt": 26, "$lte": 30 } })));
        assert!(!check(&d, json!({ "age": { "$gte": 31 } })));
        assert!(check(&d, json!({ "name": { "$lt": "carl" } })));
        assert!(!check(&d, json!({ "age": { "$gt": "10" } })));
    }

    #[test]
    fn test_in_uses_deep_equality() {
        let d = doc(json!({ "id": "1", "tags": ["a", "b"], "meta": { "v": 1 } }));

        assert!(check(&d, json!({ "tags": { "$in": [["a", "b"], "c"] } })));
        assert!(check(&d, json!({ "meta": { "$in": [{ "v": 1.0 }] } })));
        assert!(check(&d, json!({ "tags": { "$nin": [["b", "a"]] } })));
    }

    #[test]
    fn test_regex_matches_stringified_values() {
        let d = doc(json!({ "id": "1", "name": "Alice Smith", "zip": 12345 }));

        assert!(check(&d, json!({ "name": { "$regex": "^Ali" } })));
        assert!(check(&d, json!({ "name": { "$regex": "smith", "$options": "i" } })));
        assert!(check(&d, json!({ "zip": { "$regex": "^123" } })));
        assert!(!check(&d, json!({ "name": { "$regex": "^Bob" } })));
    }

    #[test]
    fn test_logical_composition() {
        let d = doc(json!({ "id": "1", "a": 1, "b": 2 }));
        let a = json!({ "a": 1 });
        let b = json!({ "b": 3 });

        let both = check(&d, json!({ "$and": [a.clone(), b.clone()] }));
        assert_eq!(check(&d, json!({ "$not": { "$and": [a.clone(), b.clone()] } })), !both);
        assert!(check(&d, json!({ "$or": [a.clone(), b.clone()] })));
        assert!(!check(&d, json!({ "$or": [] })));
        assert!(check(&d, json!({ "b": { "$not": { "$gt": 5 } } })));
    }

    #[test]
    fn test_nested_paths() {
        let d = doc(json!({ "id": "1", "address": { "city": "Oslo", "geo": { "lat": 59.9 } } }));

        assert!(check(&d, json!({ "address.city": "Oslo" })));
        assert!(check(&d, json!({ "address.geo.lat": { "$gt": 59 } })));
        assert!(check(&d, json!({ "address.zip": { "$exists": false } })));
    }
}
