//! Read operations for retrieving data from DynamoDB tables.
//!
//! Every read is a [`fetcher::Fetcher`] driven by a strategy:
//! - Query and Scan follow the store's cursor, one page at a time
//! - BatchGetItem and TransactGetItems send independent key chunks concurrently
//!
//! Consumers pull items through a [`iterator::TableIterator`].

/// Batch get and transactional get operations.
pub mod batch_get_item;

/// Common arguments of read operations and the Query/Scan strategy.
pub mod common;

/// The paged fetcher engine.
pub mod fetcher;

/// Consumer-facing iteration over a fetcher.
pub mod iterator;

/// Query operation for retrieving items with key conditions.
pub mod query;

/// Scan operation for retrieving all items from a table.
pub mod scan;
