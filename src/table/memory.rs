//! In-process conditional table.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::item::{ConditionalTable, Item, ItemKey, ReturnValues, TableError, UpdateRequest};

/// A [`ConditionalTable`] held in process memory.
///
/// Each update holds the item's shard lock while the condition is checked
/// and the actions applied, which gives the same per-item atomicity a
/// conditional-write database offers. Useful for tests and single-host
/// deployments.
#[derive(Debug, Default)]
pub struct MemoryTable {
    items: DashMap<(String, ItemKey), Item>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items across all logical tables.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no item has been written yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Synchronous read, for inspection.
    pub fn item(&self, table: &str, key: &ItemKey) -> Option<Item> {
        self.items
            .get(&(table.to_string(), key.clone()))
            .map(|i| i.value().clone())
    }
}

#[async_trait]
impl ConditionalTable for MemoryTable {
    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, TableError> {
        Ok(self.item(table, key))
    }

    async fn put_item(&self, table: &str, key: &ItemKey, item: Item) -> Result<(), TableError> {
        self.items.insert((table.to_string(), key.clone()), item);
        Ok(())
    }

    async fn update_item(&self, request: UpdateRequest) -> Result<Option<Item>, TableError> {
        let entry = self
            .items
            .entry((request.table.clone(), request.key.clone()));

        let updated = match entry {
            Entry::Occupied(mut occupied) => {
                let updated = request.apply_to(Some(occupied.get()))?;
                occupied.insert(updated.clone());
                updated
            }
            Entry::Vacant(vacant) => {
                let updated = request.apply_to(None)?;
                vacant.insert(updated.clone());
                updated
            }
        };

        trace!(table = %request.table, key = ?request.key, item = ?updated, "Item updated");

        Ok(match request.return_values {
            ReturnValues::AllNew => Some(updated),
            ReturnValues::None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{AttributeValue, Condition};
    use std::sync::Arc;

    fn key() -> ItemKey {
        ItemKey::new("search", "acct-1")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let table = MemoryTable::new();
        assert!(table.is_empty());

        let mut item = Item::new();
        item.insert("limit".to_string(), AttributeValue::N(5.0));
        table.put_item("limit", &key(), item.clone()).await.unwrap();

        assert_eq!(table.get_item("limit", &key()).await.unwrap(), Some(item));
        assert_eq!(table.get_item("token", &key()).await.unwrap(), None);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_update_creates_item() {
        let table = MemoryTable::new();
        let request = UpdateRequest::new("token", key())
            .add("tokens", -1.0)
            .returning(ReturnValues::AllNew);

        let item = table.update_item(request).await.unwrap().unwrap();
        assert_eq!(item.get("tokens"), Some(&AttributeValue::N(-1.0)));
    }

    #[tokio::test]
    async fn test_update_without_return_values() {
        let table = MemoryTable::new();
        let request = UpdateRequest::new("token", key()).add("tokens", 1.0);
        assert_eq!(table.update_item(request).await.unwrap(), None);
        assert!(table.item("token", &key()).is_some());
    }

    #[tokio::test]
    async fn test_failed_condition_is_reported() {
        let table = MemoryTable::new();
        let request = UpdateRequest::new("token", key())
            .add("tokens", -1.0)
            .condition(Condition::GreaterThanOrEqual("tokens".to_string(), 1.0));

        let err = table.update_item(request).await.unwrap_err();
        assert!(matches!(err, TableError::ConditionalCheckFailed));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_conditional_decrements() {
        let table = Arc::new(MemoryTable::new());
        let mut seed = Item::new();
        seed.insert("tokens".to_string(), AttributeValue::N(3.0));
        table.put_item("token", &key(), seed).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let request = UpdateRequest::new("token", key())
                    .add("tokens", -1.0)
                    .condition(Condition::GreaterThanOrEqual("tokens".to_string(), 1.0));
                table.update_item(request).await.is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 3);
        let item = table.item("token", &key()).unwrap();
        assert_eq!(item.get("tokens"), Some(&AttributeValue::N(0.0)));
    }
}
