//! Update expressions.
//!
//! An [`Update`] is parsed from a JSON object such as
//! `{"$set": {"age": 31}, "$push": {"tags": "new"}}` and applied with
//! [`Update::apply`], which always returns a fresh document.
//!
//! Operators run in a fixed order regardless of how they are written:
//! `$unset`, `$set`, `$inc`, `$push`, `$pull`.

use serde_json::{Map, Number, Value};

use crate::{
    document::{Document, ID_FIELD, get_path_mut, remove_path, set_path, type_name, values_equal},
    error::{DocumentStoreError, DocumentStoreResult},
};

type FieldValues = Vec<(String, Value)>;

/// A parsed update expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    unset: Vec<String>,
    set: FieldValues,
    inc: FieldValues,
    push: FieldValues,
    pull: FieldValues,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON update expression.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Query`] for unknown operators, non-object
    /// operands, non-numeric `$inc` amounts, empty expressions and any attempt
    /// to modify `id`.
    pub fn parse(value: &Value) -> DocumentStoreResult<Self> {
        let operators = value
            .as_object()
            .ok_or_else(|| DocumentStoreError::Query(format!("update must be an object, found {}", value)))?;

        let mut update = Update::new();

        for (op, fields) in operators {
            let fields = fields
                .as_object()
                .ok_or_else(|| DocumentStoreError::Query(format!("{} expects an object of fields", op)))?;

            for (field, operand) in fields {
                update = match op.as_str() {
                    "$set" => update.set(field, operand.clone()),
                    "$unset" => update.unset(field),
                    "$inc" => update.inc(field, operand.clone()),
                    "$push" => update.push(field, operand.clone()),
                    "$pull" => update.pull(field, operand.clone()),
                    other => {
                        return Err(DocumentStoreError::Query(format!("unknown update operator {}", other)));
                    }
                };
            }
        }

        update.validate()?;
        Ok(update)
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn inc(mut self, field: impl Into<String>, amount: impl Into<Value>) -> Self {
        self.inc.push((field.into(), amount.into()));
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((field.into(), value.into()));
        self
    }

    pub fn pull(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pull.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.unset.is_empty()
            && self.set.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.pull.is_empty()
    }

    /// Every field path this update touches.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.unset
            .iter()
            .map(String::as_str)
            .chain(
                [&self.set, &self.inc, &self.push, &self.pull]
                    .into_iter()
                    .flat_map(|pairs| pairs.iter().map(|(field, _)| field.as_str())),
            )
    }

    /// Checks the rules that `parse` enforces; builder-made updates are
    /// validated when applied.
    pub fn validate(&self) -> DocumentStoreResult<()> {
        if self.is_empty() {
            return Err(DocumentStoreError::Query("update expression is empty".into()));
        }

        for field in self.fields() {
            if field.is_empty() || field.split('.').any(str::is_empty) {
                return Err(DocumentStoreError::Query(format!("invalid field path '{}'", field)));
            }
            if field == ID_FIELD || field.starts_with("id.") {
                return Err(DocumentStoreError::Query("the id field cannot be updated".into()));
            }
        }

        if let Some((field, amount)) = self.inc.iter().find(|(_, amount)| !amount.is_number()) {
            return Err(DocumentStoreError::Query(format!(
                "$inc amount for '{}' must be a number, found {}",
                field, amount
            )));
        }

        Ok(())
    }

    /// Applies the update, returning a new document. The input is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Type`] when an operator meets an
    /// incompatible existing value, or [`DocumentStoreError::Query`] if the
    /// update itself is invalid.
    pub fn apply(&self, document: &Document) -> DocumentStoreResult<Document> {
        self.validate()?;

        let mut result = document.clone();
        let map = result.as_map_mut();

        for field in &self.unset {
            remove_path(map, field);
        }

        for (field, value) in &self.set {
            set_path(map, field, value.clone())?;
        }

        for (field, amount) in &self.inc {
            let next = match get_path_mut(map, field) {
                None => amount.clone(),
                Some(Value::Number(current)) => Value::Number(add_numbers(current, amount)?),
                Some(other) => {
                    return Err(DocumentStoreError::Type(format!(
                        "cannot $inc '{}' which is {}",
                        field,
                        type_name(other)
                    )));
                }
            };
            set_path(map, field, next)?;
        }

        for (field, value) in &self.push {
            match get_path_mut(map, field) {
                None => set_path(map, field, Value::Array(vec![value.clone()]))?,
                Some(Value::Array(items)) => items.push(value.clone()),
                Some(other) => {
                    return Err(DocumentStoreError::Type(format!(
                        "cannot $push to '{}' which is {}",
                        field,
                        type_name(other)
                    )));
                }
            }
        }

        for (field, value) in &self.pull {
            match get_path_mut(map, field) {
                None => {}
                Some(Value::Array(items)) => items.retain(|item| !values_equal(item, value)),
                Some(other) => {
                    return Err(DocumentStoreError::Type(format!(
                        "cannot $pull from '{}' which is {}",
                        field,
                        type_name(other)
                    )));
                }
            }
        }

        Ok(result)
    }

    /// Renders the update back to its JSON form.
    pub fn to_value(&self) -> Value {
        let mut operators = Map::new();

        if !self.unset.is_empty() {
            let fields = self.unset.iter().map(|field| (field.clone(), Value::String(String::new())));
            operators.insert("$unset".into(), Value::Object(fields.collect()));
        }

        for (op, pairs) in [("$set", &self.set), ("$inc", &self.inc), ("$push", &self.push), ("$pull", &self.pull)] {
            if !pairs.is_empty() {
                operators.insert(op.into(), Value::Object(pairs.iter().cloned().collect()));
            }
        }

        Value::Object(operators)
    }
}

impl From<Update> for Value {
    fn from(update: Update) -> Self {
        update.to_value()
    }
}

impl TryFrom<Value> for Update {
    type Error = DocumentStoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Update::parse(&value)
    }
}

impl TryFrom<&Value> for Update {
    type Error = DocumentStoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Update::parse(value)
    }
}

fn add_numbers(current: &Number, amount: &Value) -> DocumentStoreResult<Number> {
    let amount = match amount {
        Value::Number(amount) => amount,
        other => {
            return Err(DocumentStoreError::Query(format!("$inc amount must be a number, found {}", other)));
        }
    };

    if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Number::from(sum));
        }
    }

    let sum = current.as_f64().unwrap_or_default() + amount.as_f64().unwrap_or_default();
    Number::from_f64(sum).ok_or_else(|| DocumentStoreError::Type(format!("$inc produced a non-finite number ({})", sum)))
}

/// Applies a parsed update to a document.
pub fn apply(document: &Document, update: &Update) -> DocumentStoreResult<Document> {
    update.apply(document)
}
