#![deny(missing_docs)]
#![deny(warnings)]

//! # DynamoDB Fetch
//!
//! Backpressure-aware paging, batching and rate limiting for Amazon DynamoDB.
//!
//! ## Overview
//!
//! Single DynamoDB calls are bounded: a query returns one page, a batch get accepts at most
//! 100 keys, a batch write at most 25 items, and any of them may hand back a partial result.
//! This library turns those bounded calls into continuous streams:
//! - Query and Scan pages are fetched one cursor step at a time, with a configurable
//!   look-ahead buffer that overlaps the next call with the consumer's work
//! - Batch gets and batch writes are chunked and run concurrently, with unprocessed keys and
//!   items retried by binary splitting or handed back to the caller
//! - Batch writes shrink their concurrency when DynamoDB starts throttling
//! - A shared token bucket paces every fetcher that targets the same table or index
//! - Filters and conditions are built from a typed expression tree instead of strings
//!
//! ## Quick Example
//!
//! ```no_run
//! use dynamodb_fetch::{common, config, read, store};
//! use std::sync::Arc;
//!
//! # async fn example(client: aws_sdk_dynamodb::Client) -> Result<(), dynamodb_fetch::Error> {
//! let store: Arc<dyn store::StoreClient> = Arc::new(store::dynamodb::DynamoDbStore::new(client));
//! let query = read::query::Query {
//!     partition_key: common::key::Key {
//!         name: "id".to_string(),
//!         value: "1".to_string(),
//!     },
//!     multiple_read_args: read::common::MultipleReadArgs {
//!         condition: Some(common::condition::ConditionExpression::leaf(
//!             "status",
//!             common::condition::Condition::Equals("active".to_string()),
//!         )),
//!         table_name: "users".to_string(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! // Builds "#p0 = :v0" as the key condition and "#p1 = :v1" as the filter.
//! let items = query.send(store, config::FetchOptions::default())?.collect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`mod@common`] - Expressions, keys, selections, chunking and rate limiting
//! - [`mod@config`] - Options for fetchers and writers
//! - [`mod@read`] - Paged and batched reads (Query, Scan, BatchGetItem, TransactGetItems)
//! - [`mod@store`] - The store client seam and its DynamoDB implementation
//! - [`mod@write`] - Chunked batch writes with congestion control

/// Emits a `tracing` event when the `tracing` feature is enabled.
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        tracing::$level!($($arg)+);
    };
}

pub(crate) use trace_event;

/// Common utilities for expressions, keys, selections, chunking and rate limiting.
pub mod common;

/// Options for fetchers and writers.
pub mod config;

/// Error type shared by every operation.
pub mod error;

/// Read operations turning bounded DynamoDB reads into continuous streams.
///
/// This module provides:
/// - The generic paged fetcher engine
/// - Query and Scan strategies
/// - Batch get and transactional get strategies
/// - The consumer-facing table iterator
pub mod read;

/// The remote store seam.
pub mod store;

/// Write operations for chunked, throttling-aware batch writes.
pub mod write;

pub use error::Error;
