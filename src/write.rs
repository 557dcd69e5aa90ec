//! Write operations for storing data in DynamoDB tables.
//!
//! Puts and deletes are sent in BatchWriteItem chunks by a [`batch_write_item::BatchWriter`],
//! which shrinks its concurrency when DynamoDB throttles.

/// Batch write item operation for writing many items.
pub mod batch_write_item;
