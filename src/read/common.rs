use crate::{Error, common, read, store};

use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use serde_dynamo::to_attribute_value;
use std::{collections, sync::Arc};

/// Arguments for key-based read operations (BatchGetItem, TransactGetItems).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SingleReadArgs {
    /// Whether to use a consistent read.
    ///
    /// Ignored by transactional gets, which are always strongly consistent.
    pub consistent_read: Option<bool>,
    /// Which attributes to retrieve (projection expression).
    ///
    /// If `None`, all attributes are retrieved.
    pub selection: Option<common::selection::SelectionMap>,
    /// The name of the table to read from.
    pub table_name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SingleReadInput {
    pub(crate) consistent_read: Option<bool>,
    pub(crate) expression_attribute_names: Option<collections::HashMap<String, String>>,
    pub(crate) projection_expression: Option<String>,
    pub(crate) table_name: String,
}

impl From<SingleReadArgs> for SingleReadInput {
    fn from(single_read_args: SingleReadArgs) -> Self {
        let (expression_attribute_names, projection_expression) = match single_read_args.selection {
            Some(selection) => {
                let selection_operation: common::ExpressionInput = selection.into();
                (
                    Some(selection_operation.expression_attribute_names),
                    Some(selection_operation.expression),
                )
            }
            None => (None, None),
        };
        Self {
            consistent_read: single_read_args.consistent_read,
            expression_attribute_names,
            projection_expression,
            table_name: single_read_args.table_name,
        }
    }
}

/// Arguments for multiple-item read operations (Query, Scan).
///
/// These arguments apply to operations that can return multiple items, such as Query and Scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultipleReadArgs<T> {
    /// Filter condition to apply to the results.
    ///
    /// For Query operations, this is a filter expression (applied after key condition).
    /// For Scan operations, this is a filter expression applied to all scanned items.
    pub condition: Option<common::condition::ConditionExpression<T>>,
    /// Whether to use a consistent read.
    ///
    /// `true` for strongly consistent reads, `false` or `None` for eventually consistent reads.
    pub consistent_read: Option<bool>,
    /// The exclusive start key for pagination.
    ///
    /// Used to continue a previous Query or Scan operation from where it left off.
    /// Typically obtained from the `last_evaluated_key` of a previous iterator.
    pub exclusive_start_key: Option<collections::HashMap<String, T>>,
    /// The name of a global secondary index or local secondary index to read.
    ///
    /// If specified, the operation will read the index instead of the base table.
    pub index_name: Option<String>,
    /// Which attributes to retrieve (projection expression).
    ///
    /// If `None`, all attributes are retrieved.
    pub selection: Option<common::selection::SelectionMap>,
    /// The name of the table to read from.
    pub table_name: String,
}

impl<T: Serialize> MultipleReadArgs<T> {
    /// Builds the page request template.
    ///
    /// The key condition, the filter and the projection are compiled in that order with one
    /// placeholder counter, and share the resulting placeholder maps.
    pub(crate) fn into_page_request(
        self,
        key_condition: Option<common::condition::ConditionExpression<T>>,
    ) -> Result<store::PageRequest, Error> {
        let mut placeholders = common::Placeholders::default();
        let mut expression_attribute_names = None;
        let mut expression_attribute_values = None;
        let key_condition_expression = match key_condition {
            Some(key_condition) => Some(key_condition.compile(&mut placeholders)?.merge_into(
                &mut expression_attribute_names,
                &mut expression_attribute_values,
            )),
            None => None,
        };
        let filter_expression = match self.condition {
            Some(condition) => Some(condition.compile(&mut placeholders)?.merge_into(
                &mut expression_attribute_names,
                &mut expression_attribute_values,
            )),
            None => None,
        };
        let projection_expression = self.selection.map(|selection| {
            selection.compile(&mut placeholders).merge_into(
                &mut expression_attribute_names,
                &mut expression_attribute_values,
            )
        });
        let exclusive_start_key = match self.exclusive_start_key {
            Some(exclusive_start_key) => {
                let mut serialized_exclusive_start_key =
                    common::Item::with_capacity(exclusive_start_key.len());
                for (key, value) in exclusive_start_key {
                    serialized_exclusive_start_key.insert(key, to_attribute_value(value)?);
                }
                Some(serialized_exclusive_start_key)
            }
            None => None,
        };
        Ok(store::PageRequest {
            consistent_read: self.consistent_read,
            exclusive_start_key,
            expression_attribute_names,
            expression_attribute_values,
            filter_expression,
            index_name: self.index_name,
            key_condition_expression,
            projection_expression,
            table_name: self.table_name,
            ..Default::default()
        })
    }
}

/// The cursor-based read a [`QueryScanStrategy`] performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageOperation {
    /// Query calls.
    Query,
    /// Scan calls.
    Scan,
}

/// Strategy of Query and Scan fetchers.
///
/// A single cursor drives the read, so at most one call is in flight. Calls stop once
/// `buffer_capacity` pages are buffered ahead of the consumer, the cursor is exhausted or
/// the limit has been fetched.
pub struct QueryScanStrategy {
    calls_completed: usize,
    items_received: usize,
    operation: PageOperation,
    request: store::PageRequest,
    store: store::SharedStoreClient,
}

impl QueryScanStrategy {
    /// Creates a strategy issuing `request` page by page.
    pub fn new(
        store: store::SharedStoreClient,
        operation: PageOperation,
        request: store::PageRequest,
    ) -> Self {
        Self {
            calls_completed: 0,
            items_received: 0,
            operation,
            request,
            store,
        }
    }

    /// The page request template.
    pub fn request(&self) -> &store::PageRequest {
        &self.request
    }
}

impl read::fetcher::FetchStrategy for QueryScanStrategy {
    type Response = store::Page;

    fn fetch_strategy(
        &mut self,
        state: &mut read::fetcher::FetchState,
    ) -> Option<BoxFuture<'static, Result<Self::Response, Error>>> {
        if state.active_requests > 0 || state.buffer_size > state.buffer_capacity {
            return None;
        }
        let exclusive_start_key = match &state.next_token {
            read::fetcher::NextToken::NotStarted => self.request.exclusive_start_key.clone(),
            read::fetcher::NextToken::Key(key) => Some(key.clone()),
            read::fetcher::NextToken::Exhausted => return None,
        };
        let page_size = state
            .remaining_to_fetch()
            .map_or(state.batch_size, |remaining| remaining.min(state.batch_size));
        if page_size == 0 {
            return None;
        }
        let request = store::PageRequest {
            exclusive_start_key,
            limit: Some(i32::try_from(page_size).unwrap_or(i32::MAX)),
            ..self.request.clone()
        };
        let store = Arc::clone(&self.store);
        let response = match self.operation {
            PageOperation::Query => async move { store.query(request).await }.boxed(),
            PageOperation::Scan => async move { store.scan(request).await }.boxed(),
        };
        Some(response)
    }

    fn process_result(&mut self, state: &mut read::fetcher::FetchState, page: Self::Response) {
        crate::trace_event!(
            debug,
            items = page.items.len(),
            scanned = page.scanned_count,
            exhausted = page.last_evaluated_key.is_none(),
            "page received"
        );
        state.next_token = page
            .last_evaluated_key
            .map_or(read::fetcher::NextToken::Exhausted, read::fetcher::NextToken::Key);
        self.calls_completed += 1;
        self.items_received += page.items.len();
        state.total_fetched += page.items.len();
        state.results.extend(page.items);
    }

    fn is_done(&self, state: &read::fetcher::FetchState) -> bool {
        state.next_token == read::fetcher::NextToken::Exhausted
            || state.remaining_to_fetch() == Some(0)
    }

    fn consumed_capacity(page: &Self::Response) -> Option<f64> {
        page.consumed_capacity
    }

    fn items_per_call(&self) -> Option<usize> {
        (self.calls_completed > 0).then(|| (self.items_received / self.calls_completed).max(1))
    }
}
