//! Item model and conditional update requests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a conditional table.
#[derive(Debug, Error)]
pub enum TableError {
    /// The update's condition did not hold; the item was left unchanged.
    #[error("conditional check failed")]
    ConditionalCheckFailed,
    /// Any transport or engine failure.
    #[error("table backend failure: {0}")]
    Backend(String),
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// String attribute
    S(String),
    /// Numeric attribute
    N(f64),
}

impl AttributeValue {
    /// The numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            AttributeValue::S(_) => None,
        }
    }

    /// The string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            AttributeValue::N(_) => None,
        }
    }
}

/// An item is a flat map of attribute names to values.
pub type Item = HashMap<String, AttributeValue>;

/// Composite primary key of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// Partition (hash) key value
    pub partition: String,
    /// Sort (range) key value
    pub sort: String,
}

impl ItemKey {
    /// Create a new item key.
    pub fn new(partition: &str, sort: &str) -> Self {
        Self {
            partition: partition.to_string(),
            sort: sort.to_string(),
        }
    }
}

/// A predicate over an item's state before an update is applied.
///
/// Comparisons against a missing attribute, or against a non-numeric one,
/// evaluate to `false`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The attribute is absent (or the whole item is).
    AttributeNotExists(String),
    /// The numeric attribute is `>=` the value.
    GreaterThanOrEqual(String, f64),
    /// The numeric attribute is `<` the value.
    LessThan(String, f64),
    /// The numeric attribute equals the value.
    Equals(String, f64),
    /// Any of the inner conditions holds.
    Or(Vec<Condition>),
    /// Every inner condition holds.
    And(Vec<Condition>),
}

impl Condition {
    /// Evaluate the condition against the current item, if any.
    pub fn evaluate(&self, item: Option<&Item>) -> bool {
        let number = |name: &str| {
            item.and_then(|i| i.get(name))
                .and_then(AttributeValue::as_number)
        };

        match self {
            Condition::AttributeNotExists(name) => {
                item.map_or(true, |i| !i.contains_key(name))
            }
            Condition::GreaterThanOrEqual(name, value) => {
                number(name).is_some_and(|n| n >= *value)
            }
            Condition::LessThan(name, value) => number(name).is_some_and(|n| n < *value),
            Condition::Equals(name, value) => number(name).is_some_and(|n| n == *value),
            Condition::Or(conditions) => conditions.iter().any(|c| c.evaluate(item)),
            Condition::And(conditions) => conditions.iter().all(|c| c.evaluate(item)),
        }
    }
}

/// One mutation in an update request.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Add to a numeric attribute, treating a missing one as zero.
    Add(String, f64),
    /// Overwrite an attribute.
    Set(String, AttributeValue),
}

impl UpdateAction {
    /// Apply the action to an item in place.
    pub fn apply(&self, item: &mut Item) {
        match self {
            UpdateAction::Add(name, delta) => {
                let current = item
                    .get(name)
                    .and_then(AttributeValue::as_number)
                    .unwrap_or(0.0);
                item.insert(name.clone(), AttributeValue::N(current + delta));
            }
            UpdateAction::Set(name, value) => {
                item.insert(name.clone(), value.clone());
            }
        }
    }
}

/// What an update hands back on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    /// Nothing
    #[default]
    None,
    /// The whole item as it is after the update
    AllNew,
}

/// A conditional update against a single item.
///
/// The item is created if it does not exist yet. The condition, when set, is
/// checked against the item's pre-update state, and the check plus the
/// mutation happen atomically.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub table: String,
    pub key: ItemKey,
    pub actions: Vec<UpdateAction>,
    pub condition: Option<Condition>,
    pub return_values: ReturnValues,
}

impl UpdateRequest {
    /// Start an update for `key` in `table`.
    pub fn new(table: &str, key: ItemKey) -> Self {
        Self {
            table: table.to_string(),
            key,
            actions: Vec::new(),
            condition: None,
            return_values: ReturnValues::None,
        }
    }

    pub fn add(mut self, name: &str, delta: f64) -> Self {
        self.actions.push(UpdateAction::Add(name.to_string(), delta));
        self
    }

    pub fn set(mut self, name: &str, value: AttributeValue) -> Self {
        self.actions.push(UpdateAction::Set(name.to_string(), value));
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn returning(mut self, return_values: ReturnValues) -> Self {
        self.return_values = return_values;
        self
    }

    /// Apply this request to `current`, the stored item if any.
    ///
    /// Returns the updated item, or `ConditionalCheckFailed` without touching
    /// anything. Table implementations call this while holding whatever
    /// makes the item exclusive to them.
    pub fn apply_to(&self, current: Option<&Item>) -> Result<Item, TableError> {
        if let Some(condition) = &self.condition {
            if !condition.evaluate(current) {
                return Err(TableError::ConditionalCheckFailed);
            }
        }

        let mut item = current.cloned().unwrap_or_default();
        for action in &self.actions {
            action.apply(&mut item);
        }
        Ok(item)
    }
}

/// A key-value table offering per-item conditional updates but no
/// server-side scripting.
#[async_trait]
pub trait ConditionalTable: Send + Sync {
    /// Read an item.
    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, TableError>;

    /// Write an item unconditionally, replacing any existing one.
    async fn put_item(&self, table: &str, key: &ItemKey, item: Item) -> Result<(), TableError>;

    /// Apply a conditional update.
    ///
    /// Returns the new item when [`ReturnValues::AllNew`] was requested.
    async fn update_item(&self, request: UpdateRequest) -> Result<Option<Item>, TableError>;
}

#[async_trait]
impl<T: ConditionalTable + ?Sized> ConditionalTable for std::sync::Arc<T> {
    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, TableError> {
        (**self).get_item(table, key).await
    }

    async fn put_item(&self, table: &str, key: &ItemKey, item: Item) -> Result<(), TableError> {
        (**self).put_item(table, key, item).await
    }

    async fn update_item(&self, request: UpdateRequest) -> Result<Option<Item>, TableError> {
        (**self).update_item(request).await
    }
}
