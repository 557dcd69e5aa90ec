use crate::{Error, common, config};

use futures::{Stream, future::BoxFuture, stream};
use std::{collections, sync::Arc};
use tokio::task;

/// Position of a cursor-based read.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum NextToken {
    /// No call has completed yet.
    #[default]
    NotStarted,
    /// The read continues after this key.
    Key(common::Item),
    /// The store reported the end of the read.
    Exhausted,
}

/// Bookkeeping shared by the fetch engine and its strategy.
#[derive(Debug, Default)]
pub struct FetchState {
    /// Calls currently in flight.
    pub active_requests: usize,
    /// Estimated number of calls worth of data buffered or in flight.
    pub buffer_size: usize,
    /// Maximum `buffer_size` before cursor reads stop fetching ahead.
    pub buffer_capacity: usize,
    /// Items per delivered batch.
    pub batch_size: usize,
    /// Maximum number of items to deliver.
    pub limit: Option<usize>,
    /// Items received from the store.
    pub total_fetched: usize,
    /// Items delivered to the consumer.
    pub total_returned: usize,
    /// Cursor of the read.
    pub next_token: NextToken,
    /// Items received but not yet delivered.
    pub results: collections::VecDeque<common::Item>,
    /// First failure of a call, terminal for the read.
    pub error: Option<Error>,
}

impl FetchState {
    fn new(options: &config::FetchOptions) -> Self {
        Self {
            buffer_capacity: options.buffer_capacity,
            batch_size: options.batch_size,
            limit: options.limit,
            ..Default::default()
        }
    }

    /// Items that may still be requested before the limit is reached.
    pub fn remaining_to_fetch(&self) -> Option<usize> {
        self.limit
            .map(|limit| limit.saturating_sub(self.total_fetched))
    }

    /// Items that may still be delivered before the limit is reached.
    pub fn remaining_to_return(&self) -> Option<usize> {
        self.limit
            .map(|limit| limit.saturating_sub(self.total_returned))
    }

    /// Whether the limit has been delivered.
    pub fn is_limit_reached(&self) -> bool {
        self.remaining_to_return() == Some(0)
    }

    /// Records a failure, keeping the first one.
    pub fn record_error(&mut self, error: Error) {
        crate::trace_event!(warn, error = %error, "fetch failed");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// The strategy-specific part of a fetcher.
///
/// The engine owns buffering, look-ahead and rate limiting. A strategy decides when a call
/// may be issued and how its response changes the state.
pub trait FetchStrategy: Send + 'static {
    /// Response of one call.
    type Response: Send + 'static;

    /// Issues the next call if the state allows one, advancing the strategy's position.
    fn fetch_strategy(
        &mut self,
        state: &mut FetchState,
    ) -> Option<BoxFuture<'static, Result<Self::Response, Error>>>;

    /// Applies the response of a completed call.
    fn process_result(&mut self, state: &mut FetchState, response: Self::Response);

    /// Applies the failure of a call.
    fn process_error(&mut self, state: &mut FetchState, error: Error) {
        state.record_error(error);
    }

    /// Whether the strategy will never issue another call.
    fn is_done(&self, state: &FetchState) -> bool;

    /// Capacity units consumed by a call.
    fn consumed_capacity(response: &Self::Response) -> Option<f64>;

    /// Average number of useful items per call, when `buffer_size` is estimated from it.
    fn items_per_call(&self) -> Option<usize> {
        None
    }
}

/// Pull-based engine turning a [`FetchStrategy`] into a sequence of item batches.
///
/// Calls run as tasks of a [`task::JoinSet`] owned by the fetcher; their results are only
/// applied by the fetcher itself, either while waiting for data or opportunistically after
/// a batch is handed out.
pub struct Fetcher<S: FetchStrategy> {
    active: task::JoinSet<Result<S::Response, Error>>,
    finished: bool,
    state: FetchState,
    strategy: S,
    token_bucket: Option<Arc<common::token_bucket::TokenBucket>>,
}

impl<S: FetchStrategy> Fetcher<S> {
    /// Creates a fetcher, rejecting invalid options before any call.
    pub fn new(strategy: S, options: &config::FetchOptions) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self {
            active: task::JoinSet::new(),
            finished: false,
            state: FetchState::new(options),
            strategy,
            token_bucket: options.token_bucket.clone(),
        })
    }

    /// The strategy of the fetcher.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The current bookkeeping.
    pub fn state(&self) -> &FetchState {
        &self.state
    }

    /// Whether the fetcher will not produce any more items.
    pub fn is_done(&self) -> bool {
        self.finished
            || self.state.is_limit_reached()
            || (self.state.error.is_none()
                && self.active.is_empty()
                && self.state.results.is_empty()
                && self.strategy.is_done(&self.state))
    }

    /// Whether a call is in flight.
    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Cursor to resume the read from, `None` when it was exhausted or never started.
    pub fn last_evaluated_key(&self) -> Option<&common::Item> {
        match &self.state.next_token {
            NextToken::Key(key) => Some(key),
            NextToken::NotStarted | NextToken::Exhausted => None,
        }
    }

    fn register(&mut self, request: BoxFuture<'static, Result<S::Response, Error>>) {
        self.active.spawn(request);
        self.state.active_requests += 1;
        self.state.buffer_size += 1;
        crate::trace_event!(
            debug,
            active_requests = self.state.active_requests,
            buffer_size = self.state.buffer_size,
            "request scheduled"
        );
    }

    fn schedule(&mut self) {
        while self.state.error.is_none() {
            match self.strategy.fetch_strategy(&mut self.state) {
                Some(request) => self.register(request),
                None => break,
            }
        }
    }

    fn complete(&mut self, joined: Result<Result<S::Response, Error>, task::JoinError>) {
        self.state.active_requests = self.state.active_requests.saturating_sub(1);
        match joined {
            Ok(Ok(response)) => {
                if let (Some(token_bucket), Some(capacity)) =
                    (&self.token_bucket, S::consumed_capacity(&response))
                {
                    token_bucket.take(capacity, true);
                }
                self.strategy.process_result(&mut self.state, response);
            }
            Ok(Err(error)) => self.strategy.process_error(&mut self.state, error),
            Err(error) => self.strategy.process_error(&mut self.state, error.into()),
        }
        self.recalibrate(false);
    }

    fn harvest(&mut self) {
        while let Some(joined) = self.active.try_join_next() {
            self.complete(joined);
        }
    }

    async fn throttle(&self) {
        let delay = self
            .token_bucket
            .as_ref()
            .and_then(|token_bucket| token_bucket.deficit_delay());
        if let Some(delay) = delay {
            crate::trace_event!(debug, ?delay, "capacity budget exhausted, delaying next request");
            tokio::time::sleep(delay).await;
        }
    }

    /// Issues the calls the strategy allows, then waits for one call to complete.
    ///
    /// Returns `false` when nothing was in flight and nothing could be issued.
    pub async fn fetch_next(&mut self) -> bool {
        self.throttle().await;
        self.schedule();
        match self.active.join_next().await {
            Some(joined) => {
                self.complete(joined);
                true
            }
            None => false,
        }
    }

    /// Issues look-ahead calls without waiting, unless the capacity budget is in deficit.
    fn prefetch(&mut self) {
        self.harvest();
        let in_deficit = self
            .token_bucket
            .as_ref()
            .is_some_and(|token_bucket| token_bucket.peek() < 0.0);
        if !in_deficit {
            self.schedule();
        }
    }

    /// Waits for every call in flight and applies its result.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.active.join_next().await {
            self.complete(joined);
        }
    }

    /// Settles every call in flight and ends the read.
    pub async fn close(&mut self) {
        self.settle().await;
        self.finished = true;
    }

    /// Returns the next batch of items, `None` once the read is complete.
    ///
    /// A failed call ends the read with its error once the other calls in flight settle.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<common::Item>>, Error> {
        loop {
            if self.finished {
                return Ok(None);
            }
            self.harvest();
            if let Some(error) = self.state.error.take() {
                self.close().await;
                return Err(error);
            }
            if self.state.is_limit_reached() {
                self.close().await;
                return Ok(None);
            }
            if self.state.results.is_empty() {
                if self.is_done() {
                    self.close().await;
                    return Ok(None);
                }
                if !self.fetch_next().await
                    && self.state.results.is_empty()
                    && self.state.error.is_none()
                {
                    crate::trace_event!(warn, "no request could be issued, ending read");
                    self.finished = true;
                }
                continue;
            }
            let batch = self.get_result_batch();
            if !self.state.is_limit_reached() && !self.strategy.is_done(&self.state) {
                self.prefetch();
            }
            if batch.is_empty() {
                continue;
            }
            return Ok(Some(batch));
        }
    }

    fn get_result_batch(&mut self) -> Vec<common::Item> {
        let size = self
            .state
            .remaining_to_return()
            .map_or(self.state.batch_size, |remaining| {
                remaining.min(self.state.batch_size)
            })
            .min(self.state.results.len());
        let batch: Vec<_> = self.state.results.drain(..size).collect();
        self.state.total_returned += batch.len();
        self.recalibrate(true);
        batch
    }

    /// Re-estimates `buffer_size` after a completion or a delivery.
    ///
    /// Strategies that report their yield per call get an estimate from the buffered items;
    /// the others lose one unit per delivered batch.
    fn recalibrate(&mut self, delivered: bool) {
        if self.state.results.is_empty() && self.state.active_requests == 0 {
            self.state.buffer_size = 0;
            return;
        }
        match self.strategy.items_per_call() {
            Some(items_per_call) => {
                self.state.buffer_size = self.state.active_requests
                    + self.state.results.len().div_ceil(items_per_call.max(1));
            }
            None if delivered => {
                self.state.buffer_size = self.state.buffer_size.saturating_sub(1);
            }
            None => {}
        }
    }

    /// The batches of the read as a stream.
    pub fn execute(&mut self) -> impl Stream<Item = Result<Vec<common::Item>, Error>> + '_ {
        stream::unfold(self, |fetcher| async move {
            match fetcher.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), fetcher)),
                Ok(None) => None,
                Err(error) => Some((Err(error), fetcher)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{FutureExt, StreamExt};
    use std::time;

    /// Serves `pages` in order, one call at a time.
    struct ScriptedStrategy {
        pages: collections::VecDeque<Result<Vec<common::Item>, Error>>,
        calls: usize,
    }

    impl ScriptedStrategy {
        fn new(pages: Vec<Result<Vec<common::Item>, Error>>) -> Self {
            Self {
                pages: pages.into(),
                calls: 0,
            }
        }
    }

    impl FetchStrategy for ScriptedStrategy {
        type Response = Vec<common::Item>;

        fn fetch_strategy(
            &mut self,
            state: &mut FetchState,
        ) -> Option<BoxFuture<'static, Result<Self::Response, Error>>> {
            if state.active_requests > 0 {
                return None;
            }
            let page = self.pages.pop_front()?;
            self.calls += 1;
            Some(
                async move {
                    tokio::time::sleep(time::Duration::from_millis(10)).await;
                    page
                }
                .boxed(),
            )
        }

        fn process_result(&mut self, state: &mut FetchState, response: Self::Response) {
            state.total_fetched += response.len();
            state.results.extend(response);
        }

        fn is_done(&self, _state: &FetchState) -> bool {
            self.pages.is_empty()
        }

        fn consumed_capacity(response: &Self::Response) -> Option<f64> {
            Some(response.len() as f64)
        }
    }

    fn items(range: std::ops::Range<usize>) -> Vec<common::Item> {
        range.map(crate::store::mock::item).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_cut_to_batch_size() {
        let strategy = ScriptedStrategy::new(vec![Ok(items(0..5)), Ok(Vec::new()), Ok(items(5..7))]);
        let mut fetcher = Fetcher::new(
            strategy,
            &config::FetchOptions {
                batch_size: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let sizes: Vec<_> = fetcher
            .execute()
            .map(|batch| batch.unwrap().len())
            .collect()
            .await;
        assert_eq!(sizes, vec![2, 2, 1, 2]);
        assert!(fetcher.is_done());
        assert!(!fetcher.is_active());
        assert_eq!(fetcher.strategy().calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_stops_delivery() {
        let strategy = ScriptedStrategy::new(vec![Ok(items(0..5)), Ok(items(5..10))]);
        let mut fetcher = Fetcher::new(
            strategy,
            &config::FetchOptions {
                batch_size: 4,
                limit: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fetcher.next_batch().await.unwrap().map(|batch| batch.len()), Some(3));
        assert_eq!(fetcher.next_batch().await.unwrap(), None);
        assert_eq!(fetcher.state().total_returned, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_ends_read() {
        let strategy = ScriptedStrategy::new(vec![
            Ok(items(0..2)),
            Err(Error::store("connection reset")),
            Ok(items(2..4)),
        ]);
        let mut fetcher = Fetcher::new(strategy, &config::FetchOptions::default()).unwrap();
        assert_eq!(fetcher.next_batch().await.unwrap().map(|batch| batch.len()), Some(2));
        let error = fetcher.next_batch().await.unwrap_err();
        assert!(error.is_store());
        assert_eq!(fetcher.next_batch().await.unwrap(), None);
        assert!(!fetcher.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_deficit_delays_next_call() {
        let token_bucket = Arc::new(common::token_bucket::TokenBucket::new(2.0).unwrap());
        let strategy = ScriptedStrategy::new(vec![Ok(items(0..6)), Ok(items(6..7))]);
        let mut fetcher = Fetcher::new(
            strategy,
            &config::FetchOptions {
                batch_size: 10,
                token_bucket: Some(Arc::clone(&token_bucket)),
                ..Default::default()
            },
        )
        .unwrap();
        let start = tokio::time::Instant::now();
        assert_eq!(fetcher.next_batch().await.unwrap().map(|batch| batch.len()), Some(6));
        assert!(token_bucket.peek() < 0.0);
        assert_eq!(fetcher.next_batch().await.unwrap().map(|batch| batch.len()), Some(1));
        // 2 units available, 6 charged: the second call waits 2 seconds for the deficit.
        assert!(start.elapsed() >= time::Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let result = Fetcher::new(
            ScriptedStrategy::new(Vec::new()),
            &config::FetchOptions {
                batch_size: 0,
                ..Default::default()
            },
        );
        assert!(result.is_err_and(|error| error.is_configuration()));
    }
}
