use crate::{Error, common, config, store};

use futures::{Stream, stream};
use serde::Serialize;
use std::{collections, sync::Arc};
use tokio::task;

/// A put item request within a batch write operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteItemRequestPutItem<T> {
    /// The item to put into the table.
    pub item: T,
}

/// A delete item request within a batch write operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteItemRequestDeleteItem<T> {
    /// The primary key of the item to delete.
    pub keys: common::key::Keys<T>,
}

/// A single request within a batch write operation.
///
/// Each request can be either a PutItem (create/replace) or DeleteItem (remove) operation.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchWriteItemRequest<T> {
    /// Put item request - creates or replaces an item.
    PutItem(BatchWriteItemRequestPutItem<T>),
    /// Delete item request - removes an item by its primary key.
    DeleteItem(BatchWriteItemRequestDeleteItem<T>),
}

impl<T: Serialize> TryFrom<BatchWriteItemRequest<T>> for store::WriteRequest {
    type Error = Error;

    fn try_from(write_request: BatchWriteItemRequest<T>) -> Result<Self, Error> {
        match write_request {
            BatchWriteItemRequest::PutItem(put_item) => Self::put(&put_item.item),
            BatchWriteItemRequest::DeleteItem(delete_item) => Self::delete(delete_item.keys),
        }
    }
}

/// Batch write item operation.
///
/// ```rust,no_run
/// use dynamodb_fetch::{config, store, write};
///
/// # async fn example(store: store::SharedStoreClient) -> Result<(), dynamodb_fetch::Error> {
/// let batch_write = write::batch_write_item::BatchWriteItem {
///     requests: vec![
///         write::batch_write_item::BatchWriteItemRequest::PutItem(
///             write::batch_write_item::BatchWriteItemRequestPutItem {
///                 item: serde_json::json!({"id": "1", "name": "John"}),
///             },
///         ),
///     ],
///     table_name: "users".to_string(),
/// };
/// let summary = batch_write
///     .send(store, config::WriteOptions::default())?
///     .run()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteItem<T> {
    /// The puts and deletes to apply.
    pub requests: Vec<BatchWriteItemRequest<T>>,
    /// The name of the table to write to.
    pub table_name: String,
}

impl<T: Serialize> BatchWriteItem<T> {
    /// Creates the writer. Nothing is sent before it is polled.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.batch_write_item", skip_all, err)
    )]
    pub fn send(
        self,
        store: store::SharedStoreClient,
        options: config::WriteOptions,
    ) -> Result<BatchWriter, Error> {
        let mut requests = Vec::with_capacity(self.requests.len());
        for request in self.requests {
            requests.push(request.try_into()?);
        }
        BatchWriter::new(store, self.table_name, requests, options)
    }
}

/// Outcome of a completed [`BatchWriter`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteSummary {
    /// Number of requests the store applied.
    pub written: usize,
    /// Requests still unprocessed after their retry.
    ///
    /// Always empty when `on_unprocessed_items` was configured.
    pub unprocessed: Vec<store::TableWrites>,
}

type ChunkOutcome = (
    common::chunk::Pass,
    Vec<store::WriteRequest>,
    Result<store::BatchWriteResponse, Error>,
);

/// Chunked batch writer with multiplicative-decrease congestion control.
///
/// Up to `buffer_capacity` chunks are written concurrently. A response that needed more than
/// one attempt shrinks the capacity to three quarters, never below 5, and blocks new chunks
/// until every chunk in flight has completed. The capacity is not restored afterwards.
pub struct BatchWriter {
    active: task::JoinSet<ChunkOutcome>,
    backoff_active: bool,
    buffer_capacity: usize,
    chunks: common::chunk::ChunkQueue<store::WriteRequest>,
    error: Option<Error>,
    finished: bool,
    on_unprocessed_items: Option<config::UnprocessedWritesCallback>,
    ready: collections::VecDeque<Vec<store::WriteRequest>>,
    store: store::SharedStoreClient,
    table_name: String,
    token_bucket: Option<Arc<common::token_bucket::TokenBucket>>,
    unprocessed: Vec<store::TableWrites>,
    written: usize,
}

impl BatchWriter {
    /// Creates a writer, rejecting invalid options before any call.
    pub fn new(
        store: store::SharedStoreClient,
        table_name: impl Into<String>,
        requests: Vec<store::WriteRequest>,
        options: config::WriteOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self {
            active: task::JoinSet::new(),
            backoff_active: false,
            buffer_capacity: options.buffer_capacity,
            chunks: common::chunk::ChunkQueue::new(requests, options.batch_size),
            error: None,
            finished: false,
            on_unprocessed_items: options.on_unprocessed_items,
            ready: collections::VecDeque::new(),
            store,
            table_name: table_name.into(),
            token_bucket: options.token_bucket,
            unprocessed: Vec::new(),
            written: 0,
        })
    }

    /// Current number of concurrent calls allowed.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of requests applied so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Requests still unprocessed after their retry.
    pub fn unprocessed(&self) -> &[store::TableWrites] {
        &self.unprocessed
    }

    /// Whether a call is in flight.
    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Whether every chunk has been written and handed out.
    pub fn is_done(&self) -> bool {
        self.finished
            || (self.error.is_none()
                && self.active.is_empty()
                && self.ready.is_empty()
                && self.chunks.is_drained())
    }

    fn record_error(&mut self, error: Error) {
        crate::trace_event!(warn, error = %error, "batch write failed");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn shrink(&mut self) {
        let reduced = (self.buffer_capacity * 3 / 4)
            .max(config::MIN_WRITE_BUFFER_CAPACITY)
            .min(self.buffer_capacity);
        if !self.backoff_active {
            crate::trace_event!(
                warn,
                from = self.buffer_capacity,
                to = reduced,
                "throttled, entering backoff"
            );
        }
        self.buffer_capacity = reduced;
        self.backoff_active = true;
    }

    fn schedule(&mut self) {
        if self.error.is_some() || self.finished {
            return;
        }
        if self.backoff_active {
            if !self.active.is_empty() {
                return;
            }
            crate::trace_event!(debug, buffer_capacity = self.buffer_capacity, "backoff left");
            self.backoff_active = false;
        }
        while self.active.len() < self.buffer_capacity {
            let Some((requests, pass)) = self.chunks.next_chunk() else {
                break;
            };
            let request = store::BatchWriteRequest {
                requests: requests.clone(),
                table_name: self.table_name.clone(),
            };
            let store = Arc::clone(&self.store);
            self.active.spawn(async move {
                let response = store.batch_write(request).await;
                (pass, requests, response)
            });
            crate::trace_event!(debug, active_requests = self.active.len(), ?pass, "chunk scheduled");
        }
    }

    fn handle_unprocessed(
        &mut self,
        pass: common::chunk::Pass,
        requests: Vec<store::WriteRequest>,
    ) {
        if let Some(on_unprocessed_items) = &self.on_unprocessed_items {
            self.chunks.complete(pass, Vec::new());
            if !requests.is_empty() {
                crate::trace_event!(debug, requests = requests.len(), "unprocessed writes forwarded");
                on_unprocessed_items(store::TableWrites {
                    requests,
                    table_name: self.table_name.clone(),
                });
            }
            return;
        }
        let given_up = self.chunks.complete(pass, requests);
        if !given_up.is_empty() {
            crate::trace_event!(
                warn,
                requests = given_up.len(),
                "writes still unprocessed after retry"
            );
            self.unprocessed.push(store::TableWrites {
                requests: given_up,
                table_name: self.table_name.clone(),
            });
        }
    }

    fn complete(&mut self, joined: Result<ChunkOutcome, task::JoinError>) {
        let (pass, sent, response) = match joined {
            Ok(outcome) => outcome,
            Err(error) => return self.record_error(error.into()),
        };
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.chunks.complete(pass, Vec::new());
                return self.record_error(error);
            }
        };
        if let (Some(token_bucket), Some(capacity)) = (&self.token_bucket, response.consumed_capacity)
        {
            token_bucket.take(capacity, true);
        }
        if response.was_throttled() {
            self.shrink();
        }
        let unprocessed: Vec<_> = response
            .unprocessed
            .into_iter()
            .flat_map(|table_writes| table_writes.requests)
            .collect();
        let written = subtract(sent, &unprocessed);
        self.written += written.len();
        if !written.is_empty() {
            self.ready.push_back(written);
        }
        self.handle_unprocessed(pass, unprocessed);
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
            crate::trace_event!(debug, ?delay, "capacity budget exhausted, delaying next chunk");
            tokio::time::sleep(delay).await;
        }
    }

    fn prefetch(&mut self) {
        let in_deficit = self
            .token_bucket
            .as_ref()
            .is_some_and(|token_bucket| token_bucket.peek() < 0.0);
        if !in_deficit {
            self.schedule();
        }
    }

    /// Waits for every chunk in flight, then ends the writer.
    pub async fn close(&mut self) {
        while let Some(joined) = self.active.join_next().await {
            self.complete(joined);
        }
        self.finished = true;
    }

    /// Returns the next chunk of applied requests, `None` once every chunk was written.
    ///
    /// A failed call ends the writer with its error once the other calls in flight settle.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<store::WriteRequest>>, Error> {
        loop {
            if self.finished {
                return Ok(None);
            }
            self.harvest();
            if let Some(error) = self.error.take() {
                self.close().await;
                return Err(error);
            }
            if let Some(batch) = self.ready.pop_front() {
                self.prefetch();
                return Ok(Some(batch));
            }
            if self.chunks.is_drained() && self.active.is_empty() {
                self.finished = true;
                return Ok(None);
            }
            self.throttle().await;
            self.schedule();
            match self.active.join_next().await {
                Some(joined) => self.complete(joined),
                None => {
                    crate::trace_event!(warn, "no chunk could be scheduled, ending writer");
                    self.finished = true;
                }
            }
        }
    }

    /// The applied chunks as a stream.
    pub fn execute(
        &mut self,
    ) -> impl Stream<Item = Result<Vec<store::WriteRequest>, Error>> + '_ {
        stream::unfold(self, |writer| async move {
            match writer.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), writer)),
                Ok(None) => None,
                Err(error) => Some((Err(error), writer)),
            }
        })
    }

    /// Writes every chunk.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.batch_writer.run", skip_all, err)
    )]
    pub async fn run(mut self) -> Result<WriteSummary, Error> {
        while self.next_batch().await?.is_some() {}
        Ok(WriteSummary {
            written: self.written,
            unprocessed: std::mem::take(&mut self.unprocessed),
        })
    }
}

/// Removes the unprocessed requests from the sent ones, one occurrence each.
fn subtract(
    sent: Vec<store::WriteRequest>,
    unprocessed: &[store::WriteRequest],
) -> Vec<store::WriteRequest> {
    if unprocessed.is_empty() {
        return sent;
    }
    let mut remaining: Vec<_> = unprocessed.iter().collect();
    sent.into_iter()
        .filter(|request| match remaining.iter().position(|other| *other == request) {
            Some(position) => {
                remaining.swap_remove(position);
                false
            }
            None => true,
        })
        .collect()
}
