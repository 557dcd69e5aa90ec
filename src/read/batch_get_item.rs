use crate::{Error, common, config, read, store};

use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use std::sync::Arc;

/// Batch get item operation.
///
/// Keys are sent in chunks of `chunk_size`, up to `buffer_capacity` chunks at a time.
/// Unprocessed keys are retried once, split in two halves, after every chunk has been sent,
/// unless `on_unprocessed_keys` is set in the options.
///
/// ```rust,no_run
/// use dynamodb_fetch::{common, config, read, store};
///
/// # async fn example(store: store::SharedStoreClient) -> Result<(), dynamodb_fetch::Error> {
/// let batch_get = read::batch_get_item::BatchGetItem {
///     keys: vec![
///         common::key::Keys {
///             partition_key: common::key::Key {
///                 name: "id".to_string(),
///                 value: "1".to_string(),
///             },
///             ..Default::default()
///         },
///     ],
///     single_read_args: read::common::SingleReadArgs {
///         table_name: "users".to_string(),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// let mut iterator = batch_get.send(store, config::FetchOptions::default())?;
/// let items = iterator.collect().await?;
/// let unprocessed = iterator.unprocessed();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetItem<T> {
    /// Number of keys per call, at most 100. Defaults to 100.
    pub chunk_size: Option<usize>,
    /// The keys of the items to retrieve.
    pub keys: Vec<common::key::Keys<T>>,
    /// Table, projection and consistency of the reads.
    pub single_read_args: read::common::SingleReadArgs,
}

impl<T: Serialize> BatchGetItem<T> {
    /// Starts the batch get, returning an iterator over the items found.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.batch_get_item", skip_all, err)
    )]
    pub fn send(
        self,
        store: store::SharedStoreClient,
        options: config::FetchOptions,
    ) -> Result<read::iterator::TableIterator<BatchGetStrategy>, Error> {
        let chunk_size = self.chunk_size.unwrap_or(config::MAX_BATCH_GET_KEYS);
        if !(1..=config::MAX_BATCH_GET_KEYS).contains(&chunk_size) {
            return Err(Error::configuration(format!(
                "batch get chunk size must be between 1 and {}, got {chunk_size}",
                config::MAX_BATCH_GET_KEYS
            )));
        }
        let keys = common::key::to_items(self.keys)?;
        let strategy = BatchGetStrategy::new(
            store,
            GetMode::Batch,
            self.single_read_args.into(),
            keys,
            chunk_size,
            options.on_unprocessed_keys.clone(),
        );
        let fetcher = read::fetcher::Fetcher::new(strategy, &options)?;
        Ok(read::iterator::TableIterator::new(fetcher))
    }
}

/// Transactional get operation.
///
/// All keys are read in one atomic call. Missing items are skipped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactGetItems<T> {
    /// The keys of the items to retrieve, at most 100.
    pub keys: Vec<common::key::Keys<T>>,
    /// Table and projection of the reads.
    pub single_read_args: read::common::SingleReadArgs,
}

impl<T: Serialize> TransactGetItems<T> {
    /// Starts the transactional get, returning an iterator over the items found.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.transact_get_items", skip_all, err)
    )]
    pub fn send(
        self,
        store: store::SharedStoreClient,
        options: config::FetchOptions,
    ) -> Result<read::iterator::TableIterator<BatchGetStrategy>, Error> {
        if !(1..=config::MAX_TRANSACT_GET_KEYS).contains(&self.keys.len()) {
            return Err(Error::configuration(format!(
                "transactional get needs between 1 and {} keys, got {}",
                config::MAX_TRANSACT_GET_KEYS,
                self.keys.len()
            )));
        }
        let keys = common::key::to_items(self.keys)?;
        let chunk_size = keys.len();
        let strategy = BatchGetStrategy::new(
            store,
            GetMode::Transact,
            self.single_read_args.into(),
            keys,
            chunk_size,
            options.on_unprocessed_keys.clone(),
        );
        let fetcher = read::fetcher::Fetcher::new(strategy, &options)?;
        Ok(read::iterator::TableIterator::new(fetcher))
    }
}

/// The call a [`BatchGetStrategy`] issues per chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GetMode {
    /// BatchGetItem calls.
    Batch,
    /// A single TransactGetItems call.
    Transact,
}

/// Strategy of batch get and transactional get fetchers.
///
/// Chunks are independent, so up to `buffer_capacity` of them are in flight at once. A chunk
/// is only sent while the buffered items plus a full chunk per call in flight stay within
/// `buffer_capacity * batch_size + batch_size`, unless the fetcher is idle.
pub struct BatchGetStrategy {
    chunk_size: usize,
    chunks: common::chunk::ChunkQueue<common::Item>,
    mode: GetMode,
    on_unprocessed_keys: Option<config::UnprocessedKeysCallback>,
    read_input: read::common::SingleReadInput,
    store: store::SharedStoreClient,
    unprocessed: Vec<store::TableKeys>,
}

impl BatchGetStrategy {
    pub(crate) fn new(
        store: store::SharedStoreClient,
        mode: GetMode,
        read_input: read::common::SingleReadInput,
        keys: Vec<common::Item>,
        chunk_size: usize,
        on_unprocessed_keys: Option<config::UnprocessedKeysCallback>,
    ) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: common::chunk::ChunkQueue::new(keys, chunk_size),
            mode,
            on_unprocessed_keys,
            read_input,
            store,
            unprocessed: Vec::new(),
        }
    }

    /// The call issued per chunk.
    pub fn mode(&self) -> GetMode {
        self.mode
    }

    /// Keys still unprocessed after their retry.
    pub fn unprocessed(&self) -> &[store::TableKeys] {
        &self.unprocessed
    }

    fn request(
        &self,
        keys: Vec<common::Item>,
    ) -> BoxFuture<'static, Result<store::BatchGetResponse, Error>> {
        let store = Arc::clone(&self.store);
        match self.mode {
            GetMode::Batch => {
                let request = store::BatchGetRequest {
                    consistent_read: self.read_input.consistent_read,
                    expression_attribute_names: self.read_input.expression_attribute_names.clone(),
                    keys,
                    projection_expression: self.read_input.projection_expression.clone(),
                    table_name: self.read_input.table_name.clone(),
                };
                async move { store.batch_get(request).await }.boxed()
            }
            GetMode::Transact => {
                let request = store::TransactGetRequest {
                    expression_attribute_names: self.read_input.expression_attribute_names.clone(),
                    keys,
                    projection_expression: self.read_input.projection_expression.clone(),
                    table_name: self.read_input.table_name.clone(),
                };
                async move {
                    let response = store.transact_get(request).await?;
                    Ok(store::BatchGetResponse {
                        consumed_capacity: response.consumed_capacity,
                        items: response.items.into_iter().flatten().collect(),
                        unprocessed: Vec::new(),
                    })
                }
                .boxed()
            }
        }
    }

    fn lookahead(&self, state: &read::fetcher::FetchState) -> usize {
        state.buffer_capacity.max(1) * state.batch_size + state.batch_size
    }

    /// Buffered items plus a full chunk for every call in flight and the next one.
    fn reserved_items(&self, state: &read::fetcher::FetchState) -> usize {
        state.results.len() + (state.active_requests + 1) * self.chunk_size
    }

    fn handle_unprocessed(&mut self, pass: common::chunk::Pass, keys: Vec<common::Item>) {
        if let Some(on_unprocessed_keys) = &self.on_unprocessed_keys {
            self.chunks.complete(pass, Vec::new());
            if !keys.is_empty() {
                crate::trace_event!(debug, keys = keys.len(), "unprocessed keys forwarded");
                on_unprocessed_keys(store::TableKeys {
                    keys,
                    table_name: self.read_input.table_name.clone(),
                });
            }
            return;
        }
        if !keys.is_empty() {
            crate::trace_event!(debug, keys = keys.len(), ?pass, "unprocessed keys");
        }
        let given_up = self.chunks.complete(pass, keys);
        if !given_up.is_empty() {
            crate::trace_event!(warn, keys = given_up.len(), "keys still unprocessed after retry");
            self.unprocessed.push(store::TableKeys {
                keys: given_up,
                table_name: self.read_input.table_name.clone(),
            });
        }
    }
}

impl read::fetcher::FetchStrategy for BatchGetStrategy {
    type Response = (
        common::chunk::Pass,
        Result<store::BatchGetResponse, Error>,
    );

    fn fetch_strategy(
        &mut self,
        state: &mut read::fetcher::FetchState,
    ) -> Option<BoxFuture<'static, Result<Self::Response, Error>>> {
        if state.active_requests >= state.buffer_capacity.max(1)
            || state.remaining_to_fetch() == Some(0)
        {
            return None;
        }
        let idle = state.active_requests == 0 && state.results.is_empty();
        if !idle && self.reserved_items(state) > self.lookahead(state) {
            return None;
        }
        let (keys, pass) = self.chunks.next_chunk()?;
        let request = self.request(keys);
        Some(async move { Ok((pass, request.await)) }.boxed())
    }

    fn process_result(&mut self, state: &mut read::fetcher::FetchState, response: Self::Response) {
        let (pass, response) = response;
        match response {
            Ok(response) => {
                state.total_fetched += response.items.len();
                state.results.extend(response.items);
                let keys = response
                    .unprocessed
                    .into_iter()
                    .flat_map(|table_keys| table_keys.keys)
                    .collect();
                self.handle_unprocessed(pass, keys);
            }
            Err(error) => {
                self.chunks.complete(pass, Vec::new());
                state.record_error(error);
            }
        }
    }

    fn is_done(&self, state: &read::fetcher::FetchState) -> bool {
        self.chunks.is_drained() || state.remaining_to_fetch() == Some(0)
    }

    fn consumed_capacity(response: &Self::Response) -> Option<f64> {
        response
            .1
            .as_ref()
            .ok()
            .and_then(|response| response.consumed_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::mock;
    use std::{collections, sync::Mutex, time};

    fn keys(range: std::ops::Range<usize>) -> Vec<common::key::Keys<usize>> {
        range
            .map(|id| common::key::Keys {
                partition_key: common::key::Key {
                    name: "id".to_string(),
                    value: id,
                },
                ..Default::default()
            })
            .collect()
    }

    fn read_args() -> read::common::SingleReadArgs {
        read::common::SingleReadArgs {
            table_name: "a".to_string(),
            ..Default::default()
        }
    }

    /// Answers every key except those in the stuck ranges, which are always unprocessed.
    fn stuck_store(stuck: Vec<std::ops::Range<usize>>) -> mock::MockStore {
        mock::MockStore::new()
            .with_batch_get(move |request| {
                let (unprocessed, found): (Vec<_>, Vec<_>) = request
                    .keys
                    .iter()
                    .cloned()
                    .partition(|key| stuck.iter().any(|range| range.contains(&mock::id_of(key))));
                Ok(store::BatchGetResponse {
                    consumed_capacity: Some(found.len() as f64),
                    items: found.iter().map(|key| mock::item(mock::id_of(key))).collect(),
                    unprocessed: if unprocessed.is_empty() {
                        Vec::new()
                    } else {
                        vec![store::TableKeys {
                            keys: unprocessed,
                            table_name: request.table_name.clone(),
                        }]
                    },
                })
            })
            .with_latency(time::Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_chunks_are_split_then_reported() {
        let store = Arc::new(stuck_store(vec![60..80, 140..160]));
        let mut iterator = BatchGetItem {
            chunk_size: Some(20),
            keys: keys(0..200),
            single_read_args: read_args(),
        }
        .send(
            store.clone(),
            config::FetchOptions {
                batch_size: 50,
                buffer_capacity: 3,
                ..Default::default()
            },
        )
        .unwrap();
        let items = iterator.collect().await.unwrap();
        let ids: collections::BTreeSet<_> = items.iter().map(mock::id_of).collect();
        assert_eq!(items.len(), 160);
        assert_eq!(ids.len(), 160);
        assert!(ids.iter().all(|id| !(60..80).contains(id) && !(140..160).contains(id)));

        let unprocessed: Vec<_> = iterator
            .unprocessed()
            .iter()
            .flat_map(|table_keys| table_keys.keys.iter().map(mock::id_of))
            .collect();
        assert_eq!(unprocessed.len(), 40);
        assert_eq!(iterator.unprocessed().len(), 4);

        let requests = store.batch_get_requests.lock().unwrap();
        let sizes: Vec<_> = requests.iter().map(|request| request.keys.len()).collect();
        assert_eq!(sizes, [vec![20; 10], vec![10; 4]].concat());
        assert!(store.max_in_flight() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_bounds_buffered_items() {
        let store = Arc::new(stuck_store(Vec::new()));
        let batch_size = 10;
        let buffer_capacity = 2;
        let mut iterator = BatchGetItem {
            chunk_size: Some(10),
            keys: keys(0..400),
            single_read_args: read_args(),
        }
        .send(
            store.clone(),
            config::FetchOptions {
                batch_size,
                buffer_capacity,
                ..Default::default()
            },
        )
        .unwrap();
        let mut ids = collections::BTreeSet::new();
        while let Some(batch) = iterator.next_batch().await.unwrap() {
            ids.extend(batch.iter().map(mock::id_of));
            // Slow consumer: every chunk in flight completes before the next pull.
            tokio::time::sleep(time::Duration::from_millis(50)).await;
            let state = iterator.fetcher().state();
            let buffered = state.total_fetched - state.total_returned;
            assert!(buffered <= buffer_capacity * batch_size + batch_size);
        }
        assert_eq!(ids.len(), 400);
        assert!(store.max_in_flight() <= buffer_capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_keys_go_to_callback() {
        let forwarded = Arc::new(Mutex::new(Vec::<store::TableKeys>::new()));
        let sink = Arc::clone(&forwarded);
        let store = Arc::new(stuck_store(vec![0..5]));
        let mut iterator = BatchGetItem {
            chunk_size: Some(10),
            keys: keys(0..30),
            single_read_args: read_args(),
        }
        .send(
            store.clone(),
            config::FetchOptions {
                on_unprocessed_keys: Some(Arc::new(move |table_keys: store::TableKeys| {
                    sink.lock().unwrap().push(table_keys)
                })),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(iterator.collect().await.unwrap().len(), 25);
        assert!(iterator.unprocessed().is_empty());
        assert_eq!(store.batch_get_requests.lock().unwrap().len(), 3);
        let forwarded = forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].table_name, "a");
        assert_eq!(forwarded[0].keys, (0..5).map(mock::key).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_fails_read() {
        let store = Arc::new(mock::MockStore::new().with_batch_get(|request| {
            if request.keys.iter().any(|key| mock::id_of(key) == 15) {
                Err(Error::store("throughput exceeded"))
            } else {
                Ok(store::BatchGetResponse {
                    items: request.keys.iter().map(|key| mock::item(mock::id_of(key))).collect(),
                    ..Default::default()
                })
            }
        }));
        let mut iterator = BatchGetItem {
            chunk_size: Some(10),
            keys: keys(0..30),
            single_read_args: read_args(),
        }
        .send(store, config::FetchOptions::default())
        .unwrap();
        assert!(iterator.collect().await.unwrap_err().is_store());
        assert!(!iterator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transact_get_skips_missing_items() {
        let store = Arc::new(mock::MockStore::new().with_transact_get(|request| {
            Ok(store::TransactGetResponse {
                consumed_capacity: Some(2.0),
                items: request
                    .keys
                    .iter()
                    .map(|key| (mock::id_of(key) != 1).then(|| mock::item(mock::id_of(key))))
                    .collect(),
            })
        }));
        let mut iterator = TransactGetItems {
            keys: keys(0..3),
            single_read_args: read_args(),
        }
        .send(store.clone(), config::FetchOptions::default())
        .unwrap();
        let ids: Vec<_> = iterator
            .collect()
            .await
            .unwrap()
            .iter()
            .map(mock::id_of)
            .collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(store.transact_get_requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_sizes_are_rejected() {
        let store: store::SharedStoreClient = Arc::new(mock::MockStore::new());
        let oversized_chunk = BatchGetItem {
            chunk_size: Some(101),
            keys: keys(0..1),
            single_read_args: read_args(),
        }
        .send(Arc::clone(&store), config::FetchOptions::default());
        assert!(oversized_chunk.is_err_and(|error| error.is_configuration()));
        let too_many_keys = TransactGetItems {
            keys: keys(0..101),
            single_read_args: read_args(),
        }
        .send(Arc::clone(&store), config::FetchOptions::default());
        assert!(too_many_keys.is_err_and(|error| error.is_configuration()));
        let no_keys = TransactGetItems::<usize> {
            keys: Vec::new(),
            single_read_args: read_args(),
        }
        .send(store, config::FetchOptions::default());
        assert!(no_keys.is_err_and(|error| error.is_configuration()));
    }
}
