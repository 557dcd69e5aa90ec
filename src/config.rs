//! Options for fetchers and writers.
//!
//! Options are validated when a fetcher or writer is built, before any remote call.

use crate::{Error, common::token_bucket::TokenBucket, store};

use std::{fmt, sync::Arc};

/// Maximum number of keys of one BatchGetItem call.
pub const MAX_BATCH_GET_KEYS: usize = 100;

/// Maximum number of keys of one TransactGetItems call.
pub const MAX_TRANSACT_GET_KEYS: usize = 100;

/// Maximum number of requests of one BatchWriteItem call.
pub const MAX_BATCH_WRITE_REQUESTS: usize = 25;

/// Floor of the writer's concurrency when it shrinks under throttling.
pub const MIN_WRITE_BUFFER_CAPACITY: usize = 5;

/// Receives keys a batch get did not process, instead of retrying them.
pub type UnprocessedKeysCallback = Arc<dyn Fn(store::TableKeys) + Send + Sync>;

/// Receives write requests a batch write gave up on.
pub type UnprocessedWritesCallback = Arc<dyn Fn(store::TableWrites) + Send + Sync>;

/// Options of a fetcher.
///
/// ```rust
/// use dynamodb_fetch::config::FetchOptions;
///
/// let options = FetchOptions {
///     batch_size: 100,
///     limit: Some(1000),
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct FetchOptions {
    /// Number of items per delivered batch, also the page size of Query and Scan calls.
    pub batch_size: usize,
    /// How many calls may be buffered ahead of the consumer.
    ///
    /// Batch gets also use it as their number of concurrent calls.
    pub buffer_capacity: usize,
    /// Maximum number of items to deliver.
    pub limit: Option<usize>,
    /// Receives unprocessed keys of batch gets, which are then not retried.
    pub on_unprocessed_keys: Option<UnprocessedKeysCallback>,
    /// Capacity budget shared with other fetchers of the same table or index.
    pub token_bucket: Option<Arc<TokenBucket>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            buffer_capacity: 1,
            limit: None,
            on_unprocessed_keys: None,
            token_bucket: None,
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("batch_size", &self.batch_size)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("limit", &self.limit)
            .field("on_unprocessed_keys", &self.on_unprocessed_keys.is_some())
            .field("token_bucket", &self.token_bucket)
            .finish()
    }
}

impl FetchOptions {
    /// Checks the options.
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::configuration("batch size must be positive"));
        }
        if self.limit == Some(0) {
            return Err(Error::configuration("limit must be positive"));
        }
        Ok(())
    }
}

/// Options of a batch writer.
///
/// ```rust
/// use dynamodb_fetch::config::WriteOptions;
///
/// let options = WriteOptions {
///     buffer_capacity: 20,
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct WriteOptions {
    /// Number of requests per BatchWriteItem call, at most 25.
    pub batch_size: usize,
    /// Initial number of concurrent calls, shrunk under throttling.
    pub buffer_capacity: usize,
    /// Receives requests that were still unprocessed after their retry.
    pub on_unprocessed_items: Option<UnprocessedWritesCallback>,
    /// Capacity budget shared with other writers of the same table.
    pub token_bucket: Option<Arc<TokenBucket>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_WRITE_REQUESTS,
            buffer_capacity: 10,
            on_unprocessed_items: None,
            token_bucket: None,
        }
    }
}

impl fmt::Debug for WriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteOptions")
            .field("batch_size", &self.batch_size)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("on_unprocessed_items", &self.on_unprocessed_items.is_some())
            .field("token_bucket", &self.token_bucket)
            .finish()
    }
}

impl WriteOptions {
    /// Checks the options.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=MAX_BATCH_WRITE_REQUESTS).contains(&self.batch_size) {
            return Err(Error::configuration(format!(
                "write batch size must be between 1 and {MAX_BATCH_WRITE_REQUESTS}, got {}",
                self.batch_size
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(Error::configuration("buffer capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::default(FetchOptions::default(), true)]
    #[case::zero_batch_size(FetchOptions { batch_size: 0, ..Default::default() }, false)]
    #[case::zero_limit(FetchOptions { limit: Some(0), ..Default::default() }, false)]
    #[case::no_lookahead(FetchOptions { buffer_capacity: 0, ..Default::default() }, true)]
    fn test_fetch_options_validation(#[case] options: FetchOptions, #[case] valid: bool) {
        assert_eq!(options.validate().is_ok(), valid);
    }

    #[rstest]
    #[case::default(WriteOptions::default(), true)]
    #[case::single(WriteOptions { batch_size: 1, ..Default::default() }, true)]
    #[case::zero_batch_size(WriteOptions { batch_size: 0, ..Default::default() }, false)]
    #[case::oversized_batch(WriteOptions { batch_size: 26, ..Default::default() }, false)]
    #[case::zero_buffer(WriteOptions { buffer_capacity: 0, ..Default::default() }, false)]
    fn test_write_options_validation(#[case] options: WriteOptions, #[case] valid: bool) {
        let result = options.validate();
        assert_eq!(result.is_ok(), valid);
        if let Err(error) = result {
            assert!(error.is_configuration());
        }
    }
}
