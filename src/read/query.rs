use crate::{Error, common, config, read, store};

use serde::Serialize;

/// Query operation.
///
/// ```rust,no_run
/// use dynamodb_fetch::{common, config, read, store};
///
/// # async fn example(store: store::SharedStoreClient) -> Result<(), dynamodb_fetch::Error> {
/// let query = read::query::Query {
///     partition_key: common::key::Key {
///         name: "id".to_string(),
///         value: "1".to_string(),
///     },
///     multiple_read_args: read::common::MultipleReadArgs {
///         table_name: "users".to_string(),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// let mut iterator = query.send(store, config::FetchOptions::default())?;
/// while let Some(batch) = iterator.next_batch().await? {
///     println!("{} items", batch.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query<T> {
    /// Additional read operation arguments (table name, filter, selection, etc.).
    pub multiple_read_args: read::common::MultipleReadArgs<T>,
    /// The partition key value to query for.
    pub partition_key: common::key::Key<T>,
    /// Whether to read the index forward (ascending) or backward (descending).
    pub scan_index_forward: Option<bool>,
    /// Optional condition to apply to the sort key.
    pub sort_key_condition: Option<common::condition::KeyCondition<T>>,
}

impl<T: Serialize> TryFrom<Query<T>> for store::PageRequest {
    type Error = Error;

    fn try_from(query: Query<T>) -> Result<Self, Error> {
        let mut key_condition = query.partition_key.equals();
        if let Some(sort_key_condition) = query.sort_key_condition {
            key_condition =
                key_condition.and(common::condition::ConditionExpression::Leaf(sort_key_condition));
        }
        let mut request = query
            .multiple_read_args
            .into_page_request(Some(key_condition))?;
        request.scan_index_forward = query.scan_index_forward;
        Ok(request)
    }
}

impl<T: Serialize> Query<T> {
    /// Starts the query, returning an iterator over its items.
    ///
    /// Nothing is sent before the iterator is polled.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.query", skip_all, err)
    )]
    pub fn send(
        self,
        store: store::SharedStoreClient,
        options: config::FetchOptions,
    ) -> Result<read::iterator::TableIterator<read::common::QueryScanStrategy>, Error> {
        let request: store::PageRequest = self.try_into()?;
        let strategy = read::common::QueryScanStrategy::new(
            store,
            read::common::PageOperation::Query,
            request,
        );
        let fetcher = read::fetcher::Fetcher::new(strategy, &options)?;
        Ok(read::iterator::TableIterator::new(fetcher))
    }
}
