//! Storage abstraction for engines that offer conditional writes.
//!
//! A conditional table applies an update to one item only if a predicate
//! over the item's current state holds, and otherwise rejects it atomically.
//! It offers no way to read a value, compute on it, and write it back in one
//! step, which is what the claim/settle protocol in
//! [`crate::ratelimit::ConditionalRateLimiter`] works around.

#[cfg(feature = "dynamo")]
mod dynamo;
#[cfg(any(feature = "dynamo", test))]
mod expression;
mod item;
mod memory;

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoTable;

pub use item::{
    AttributeValue, Condition, ConditionalTable, Item, ItemKey, ReturnValues, TableError,
    UpdateAction, UpdateRequest,
};
pub use memory::MemoryTable;
