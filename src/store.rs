//! The remote store seam.
//!
//! Fetchers and writers never talk to DynamoDB directly. They issue the five request shapes
//! below through a shared [`StoreClient`], which keeps the orchestration engine independent
//! of the SDK and lets tests script every response.

/// [`StoreClient`] implementation over the AWS SDK.
pub mod dynamodb;

use crate::{Error, common, common::key};

use async_trait::async_trait;
use aws_sdk_dynamodb::types;
use serde::Serialize;
use serde_dynamo::to_item;
use std::{collections, sync::Arc, time};

/// One page request of a Query or Scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageRequest {
    /// Whether to use a strongly consistent read.
    pub consistent_read: Option<bool>,
    /// Cursor to resume from.
    pub exclusive_start_key: Option<common::Item>,
    /// Name placeholders shared by every expression of the request.
    pub expression_attribute_names: Option<collections::HashMap<String, String>>,
    /// Value placeholders shared by every expression of the request.
    pub expression_attribute_values: Option<collections::HashMap<String, types::AttributeValue>>,
    /// Filter applied by the store after reading.
    pub filter_expression: Option<String>,
    /// Secondary index to read instead of the base table.
    pub index_name: Option<String>,
    /// Key condition, Query only.
    pub key_condition_expression: Option<String>,
    /// Maximum number of items to evaluate.
    pub limit: Option<i32>,
    /// Attributes to return.
    pub projection_expression: Option<String>,
    /// Sort direction, Query only.
    pub scan_index_forward: Option<bool>,
    /// Parallel scan segment, Scan only.
    pub segment: Option<i32>,
    /// The table to read.
    pub table_name: String,
    /// Parallel scan segment count, Scan only.
    pub total_segments: Option<i32>,
}

/// One page of a Query or Scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Capacity units consumed by the call.
    pub consumed_capacity: Option<f64>,
    /// Items left after filtering.
    pub items: Vec<common::Item>,
    /// Cursor to continue from, `None` when the read is exhausted.
    pub last_evaluated_key: Option<common::Item>,
    /// Items evaluated before filtering.
    pub scanned_count: i32,
}

/// Keys of one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableKeys {
    /// Raw primary keys.
    pub keys: Vec<common::Item>,
    /// The table the keys belong to.
    pub table_name: String,
}

/// A BatchGetItem call for a single table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetRequest {
    /// Whether to use strongly consistent reads.
    pub consistent_read: Option<bool>,
    /// Name placeholders of the projection.
    pub expression_attribute_names: Option<collections::HashMap<String, String>>,
    /// Raw primary keys, at most 100.
    pub keys: Vec<common::Item>,
    /// Attributes to return.
    pub projection_expression: Option<String>,
    /// The table to read.
    pub table_name: String,
}

/// Result of a BatchGetItem call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetResponse {
    /// Capacity units consumed by the call.
    pub consumed_capacity: Option<f64>,
    /// Items found, in no particular order.
    pub items: Vec<common::Item>,
    /// Keys the store did not process.
    pub unprocessed: Vec<TableKeys>,
}

/// A TransactGetItems call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactGetRequest {
    /// Name placeholders of the projection.
    pub expression_attribute_names: Option<collections::HashMap<String, String>>,
    /// Raw primary keys, at most 100, read atomically.
    pub keys: Vec<common::Item>,
    /// Attributes to return.
    pub projection_expression: Option<String>,
    /// The table to read.
    pub table_name: String,
}

/// Result of a TransactGetItems call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactGetResponse {
    /// Capacity units consumed by the call.
    pub consumed_capacity: Option<f64>,
    /// One entry per requested key, in request order, `None` for missing items.
    pub items: Vec<Option<common::Item>>,
}

/// A single put or delete of a batch write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// Deletes the item with the given raw primary key.
    Delete(common::Item),
    /// Puts the given raw item.
    Put(common::Item),
}

impl WriteRequest {
    /// Creates a put request from any serializable item.
    pub fn put<T: Serialize>(item: &T) -> Result<Self, Error> {
        Ok(Self::Put(to_item(item)?))
    }

    /// Creates a delete request from typed keys.
    pub fn delete<T: Serialize>(keys: key::Keys<T>) -> Result<Self, Error> {
        Ok(Self::Delete(keys.try_into()?))
    }
}

/// Write requests of one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableWrites {
    /// The write requests.
    pub requests: Vec<WriteRequest>,
    /// The table the requests target.
    pub table_name: String,
}

/// A BatchWriteItem call for a single table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteRequest {
    /// Puts and deletes, at most 25.
    pub requests: Vec<WriteRequest>,
    /// The table to write.
    pub table_name: String,
}

/// Result of a BatchWriteItem call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteResponse {
    /// Number of attempts the store client needed, 1 when the first one succeeded.
    pub attempts: u32,
    /// Capacity units consumed by the call.
    pub consumed_capacity: Option<f64>,
    /// Total time the store client waited between attempts.
    pub total_retry_delay: time::Duration,
    /// Requests the store did not process.
    pub unprocessed: Vec<TableWrites>,
}

impl BatchWriteResponse {
    /// Whether the store client had to retry, the signal used for congestion control.
    pub fn was_throttled(&self) -> bool {
        self.attempts > 1 || !self.total_retry_delay.is_zero()
    }
}

/// Remote store operations used by fetchers and writers.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Reads one page of a Query.
    async fn query(&self, request: PageRequest) -> Result<Page, Error>;

    /// Reads one page of a Scan.
    async fn scan(&self, request: PageRequest) -> Result<Page, Error>;

    /// Reads up to 100 items by key.
    async fn batch_get(&self, request: BatchGetRequest) -> Result<BatchGetResponse, Error>;

    /// Reads up to 100 items by key atomically.
    async fn transact_get(&self, request: TransactGetRequest) -> Result<TransactGetResponse, Error>;

    /// Writes up to 25 puts and deletes.
    async fn batch_write(&self, request: BatchWriteRequest) -> Result<BatchWriteResponse, Error>;
}

/// Type alias for a shared StoreClient.
pub type SharedStoreClient = Arc<dyn StoreClient>;
