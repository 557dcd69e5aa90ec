use crate::{Error, common, read, store};

use futures::{Stream, stream};
use serde::de::DeserializeOwned;
use serde_dynamo::from_items;
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;

/// Consumer-facing side of a read.
///
/// Items are pulled batch by batch from the underlying [`read::fetcher::Fetcher`]. The
/// cancellation token is checked between batches, items and strides; once it fires, the
/// calls already in flight settle before the read ends.
pub struct TableIterator<S: read::fetcher::FetchStrategy> {
    cancellation: CancellationToken,
    fetcher: read::fetcher::Fetcher<S>,
}

impl<S: read::fetcher::FetchStrategy> TableIterator<S> {
    pub(crate) fn new(fetcher: read::fetcher::Fetcher<S>) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            fetcher,
        }
    }

    /// Replaces the cancellation token, e.g. with a child of an application-wide token.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// A handle cancelling this read.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// The underlying fetcher.
    pub fn fetcher(&self) -> &read::fetcher::Fetcher<S> {
        &self.fetcher
    }

    /// Cursor to resume the read from, `None` when it was exhausted or never started.
    pub fn last_evaluated_key(&self) -> Option<&common::Item> {
        self.fetcher.last_evaluated_key()
    }

    /// Whether the read will not produce any more items.
    pub fn is_done(&self) -> bool {
        self.fetcher.is_done()
    }

    /// Whether a call is in flight.
    pub fn is_active(&self) -> bool {
        self.fetcher.is_active()
    }

    async fn stop(&mut self) {
        crate::trace_event!(debug, "read stopped by the consumer");
        self.fetcher.close().await;
    }

    /// Returns the next batch of at most `batch_size` items, `None` once the read ends.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<common::Item>>, Error> {
        if self.cancellation.is_cancelled() {
            self.stop().await;
            return Ok(None);
        }
        self.fetcher.next_batch().await
    }

    /// The batches of the read as a stream.
    pub fn batches(&mut self) -> impl Stream<Item = Result<Vec<common::Item>, Error>> + '_ {
        stream::unfold(self, |iterator| async move {
            match iterator.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), iterator)),
                Ok(None) => None,
                Err(error) => Some((Err(error), iterator)),
            }
        })
    }

    /// Visits every item until the read ends, the visitor breaks or the read is cancelled.
    pub async fn for_each<F>(&mut self, mut visitor: F) -> Result<(), Error>
    where
        F: FnMut(common::Item) -> ControlFlow<()>,
    {
        while let Some(batch) = self.next_batch().await? {
            for item in batch {
                if self.cancellation.is_cancelled() || visitor(item).is_break() {
                    self.stop().await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Visits the items in groups of `stride`, the last group possibly shorter.
    ///
    /// Strides are cut independently of `batch_size`. Once the read is cancelled, items not
    /// yet visited are dropped, including a partial last group.
    pub async fn for_each_stride<F>(&mut self, stride: usize, mut visitor: F) -> Result<(), Error>
    where
        F: FnMut(Vec<common::Item>) -> ControlFlow<()>,
    {
        if stride == 0 {
            return Err(Error::configuration("stride must be greater than 0"));
        }
        let mut pending = Vec::with_capacity(stride);
        while let Some(batch) = self.next_batch().await? {
            pending.extend(batch);
            while pending.len() >= stride {
                let rest = pending.split_off(stride);
                let group = std::mem::replace(&mut pending, rest);
                if self.cancellation.is_cancelled() || visitor(group).is_break() {
                    self.stop().await;
                    return Ok(());
                }
            }
        }
        if !pending.is_empty()
            && !self.cancellation.is_cancelled()
            && visitor(pending).is_break()
        {
            self.stop().await;
        }
        Ok(())
    }

    /// Collects the remaining items.
    pub async fn collect(&mut self) -> Result<Vec<common::Item>, Error> {
        let mut items = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            items.extend(batch);
        }
        Ok(items)
    }

    /// Collects the remaining items, deserialized.
    pub async fn collect_as<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, Error> {
        Ok(from_items(self.collect().await?)?)
    }
}

impl TableIterator<read::batch_get_item::BatchGetStrategy> {
    /// Keys still unprocessed after their retry.
    ///
    /// Always empty when `on_unprocessed_keys` was configured.
    pub fn unprocessed(&self) -> &[store::TableKeys] {
        self.fetcher.strategy().unprocessed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{config, store::mock};
    use futures::StreamExt;
    use serde::Deserialize;
    use serde_json::Value;
    use std::{sync::Arc, time};

    fn scan(
        count: usize,
        options: config::FetchOptions,
    ) -> (
        Arc<mock::MockStore>,
        TableIterator<read::common::QueryScanStrategy>,
    ) {
        let store = Arc::new(
            mock::MockStore::new()
                .with_pages(mock::paged_table((0..count).map(mock::item).collect(), |_| true))
                .with_latency(time::Duration::from_millis(5)),
        );
        let iterator = read::scan::Scan::<Value> {
            multiple_read_args: read::common::MultipleReadArgs {
                table_name: "a".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
        .send(store.clone(), options)
        .unwrap();
        (store, iterator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_stream() {
        let (_, mut iterator) = scan(
            7,
            config::FetchOptions {
                batch_size: 3,
                ..Default::default()
            },
        );
        let sizes: Vec<_> = iterator
            .batches()
            .map(|batch| batch.unwrap().len())
            .collect()
            .await;
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(iterator.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_settles_in_flight_calls() {
        let (store, mut iterator) = scan(
            100,
            config::FetchOptions {
                batch_size: 5,
                buffer_capacity: 3,
                ..Default::default()
            },
        );
        let mut visited = Vec::new();
        iterator
            .for_each(|item| {
                visited.push(mock::id_of(&item));
                if visited.len() == 7 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await
            .unwrap();
        assert_eq!(visited, (0..7).collect::<Vec<_>>());
        assert!(!iterator.is_active());
        assert!(iterator.is_done());
        let calls = store.page_calls();
        assert_eq!(iterator.next_batch().await.unwrap(), None);
        assert_eq!(store.page_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_read() {
        let (store, mut iterator) = scan(
            100,
            config::FetchOptions {
                batch_size: 10,
                ..Default::default()
            },
        );
        let cancellation = iterator.cancellation_token();
        assert_eq!(iterator.next_batch().await.unwrap().map(|batch| batch.len()), Some(10));
        cancellation.cancel();
        assert_eq!(iterator.next_batch().await.unwrap(), None);
        assert!(!iterator.is_active());
        assert!(store.page_calls() < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_visitor() {
        let parent = CancellationToken::new();
        let (_, iterator) = scan(
            50,
            config::FetchOptions {
                batch_size: 10,
                ..Default::default()
            },
        );
        let mut iterator = iterator.with_cancellation(parent.child_token());
        let mut visited = 0;
        iterator
            .for_each(|_| {
                visited += 1;
                if visited == 15 {
                    parent.cancel();
                }
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        assert_eq!(visited, 15);
        assert!(!iterator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strides_ignore_batch_size() {
        let (_, mut iterator) = scan(
            10,
            config::FetchOptions {
                batch_size: 3,
                ..Default::default()
            },
        );
        let mut strides = Vec::new();
        iterator
            .for_each_stride(4, |stride| {
                strides.push(stride.iter().map(mock::id_of).collect::<Vec<_>>());
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        assert_eq!(strides, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_strides_drop_partial_group() {
        let (_, mut iterator) = scan(
            10,
            config::FetchOptions {
                batch_size: 10,
                ..Default::default()
            },
        );
        let cancellation = iterator.cancellation_token();
        let mut strides = Vec::new();
        iterator
            .for_each_stride(4, |stride| {
                strides.push(stride.len());
                cancellation.cancel();
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        assert_eq!(strides, vec![4]);
        assert!(!iterator.is_active());
        assert_eq!(iterator.next_batch().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_on_last_stride_ends_read() {
        let (_, mut iterator) = scan(5, config::FetchOptions::default());
        let mut strides = Vec::new();
        iterator
            .for_each_stride(4, |stride| {
                strides.push(stride.len());
                ControlFlow::Break(())
            })
            .await
            .unwrap();
        assert_eq!(strides, vec![4]);

        let (_, mut iterator) = scan(3, config::FetchOptions::default());
        let mut strides = Vec::new();
        iterator
            .for_each_stride(4, |stride| {
                strides.push(stride.len());
                ControlFlow::Break(())
            })
            .await
            .unwrap();
        assert_eq!(strides, vec![3]);
        assert!(iterator.is_done());
        assert!(!iterator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_stride_is_rejected() {
        let (store, mut iterator) = scan(10, config::FetchOptions::default());
        let error = iterator
            .for_each_stride(0, |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(error.is_configuration());
        assert_eq!(store.page_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_as() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Row {
            id: usize,
            payload: String,
        }

        let (_, mut iterator) = scan(2, config::FetchOptions::default());
        let rows: Vec<Row> = iterator.collect_as().await.unwrap();
        assert_eq!(
            rows,
            vec![
                Row {
                    id: 0,
                    payload: "item-0".to_string(),
                },
                Row {
                    id: 1,
                    payload: "item-1".to_string(),
                },
            ]
        );
    }
}
