use crate::{Error, store};

use async_trait::async_trait;
use aws_sdk_dynamodb::{Client, error, operation, types};
use std::time;

/// Backoff policy for throttled batch writes.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every following one.
    pub initial_delay: time::Duration,
    /// Upper bound of a single delay.
    pub max_delay: time::Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: time::Duration::from_millis(100),
            max_delay: time::Duration::from_millis(2000),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry`, starting at 0.
    pub fn delay(&self, retry: u32) -> time::Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

/// [`store::StoreClient`] over an `aws_sdk_dynamodb` client.
///
/// Every call asks for the total consumed capacity so that token buckets can be charged.
///
/// ```rust,no_run
/// use aws_sdk_dynamodb::Client;
/// use dynamodb_fetch::store;
/// use std::sync::Arc;
///
/// # fn example(client: Client) {
/// let store: store::SharedStoreClient = Arc::new(store::dynamodb::DynamoDbStore::new(client));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DynamoDbStore {
    client: Client,
    retry: RetryConfig,
}

impl DynamoDbStore {
    /// Wraps a client with the default retry policy.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    /// Replaces the retry policy of throttled batch writes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// apply page request settings shared by query and scan builders
macro_rules! apply_page_request {
    ($builder:expr, $request:expr) => {
        $builder
            .set_consistent_read($request.consistent_read)
            .set_exclusive_start_key($request.exclusive_start_key)
            .set_expression_attribute_names($request.expression_attribute_names)
            .set_expression_attribute_values($request.expression_attribute_values)
            .set_filter_expression($request.filter_expression)
            .set_index_name($request.index_name)
            .set_limit($request.limit)
            .set_projection_expression($request.projection_expression)
            .table_name($request.table_name)
            .return_consumed_capacity(types::ReturnConsumedCapacity::Total)
    };
}

/// build a page from a query or scan output
macro_rules! page_from_output {
    ($output:expr) => {
        store::Page {
            consumed_capacity: $output
                .consumed_capacity
                .and_then(|capacity| capacity.capacity_units),
            items: $output.items.unwrap_or_default(),
            last_evaluated_key: $output
                .last_evaluated_key
                .filter(|last_evaluated_key| !last_evaluated_key.is_empty()),
            scanned_count: $output.scanned_count,
        }
    };
}

fn total_capacity(capacities: Option<Vec<types::ConsumedCapacity>>) -> Option<f64> {
    capacities.map(|capacities| {
        capacities
            .into_iter()
            .filter_map(|capacity| capacity.capacity_units)
            .sum()
    })
}

fn to_sdk_write_request(request: store::WriteRequest) -> Result<types::WriteRequest, Error> {
    let request = match request {
        store::WriteRequest::Put(item) => types::WriteRequest::builder()
            .put_request(types::PutRequest::builder().set_item(Some(item)).build()?),
        store::WriteRequest::Delete(key) => types::WriteRequest::builder()
            .delete_request(types::DeleteRequest::builder().set_key(Some(key)).build()?),
    };
    Ok(request.build())
}

fn from_sdk_write_request(request: types::WriteRequest) -> Option<store::WriteRequest> {
    match (request.put_request, request.delete_request) {
        (Some(put_request), _) => Some(store::WriteRequest::Put(put_request.item)),
        (None, Some(delete_request)) => Some(store::WriteRequest::Delete(delete_request.key)),
        (None, None) => None,
    }
}

fn is_throttling<R>(
    error: &error::SdkError<operation::batch_write_item::BatchWriteItemError, R>,
) -> bool {
    error.as_service_error().is_some_and(|error| {
        error.is_provisioned_throughput_exceeded_exception() || error.is_request_limit_exceeded()
    })
}

#[async_trait]
impl store::StoreClient for DynamoDbStore {
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.query", skip_all, fields(table = %request.table_name), err)
    )]
    async fn query(&self, request: store::PageRequest) -> Result<store::Page, Error> {
        let builder = self
            .client
            .query()
            .set_key_condition_expression(request.key_condition_expression)
            .set_scan_index_forward(request.scan_index_forward);
        let output = apply_page_request!(builder, request).send().await?;
        Ok(page_from_output!(output))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.scan", skip_all, fields(table = %request.table_name), err)
    )]
    async fn scan(&self, request: store::PageRequest) -> Result<store::Page, Error> {
        let builder = self
            .client
            .scan()
            .set_segment(request.segment)
            .set_total_segments(request.total_segments);
        let output = apply_page_request!(builder, request).send().await?;
        Ok(page_from_output!(output))
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.batch_get_item", skip_all, fields(table = %request.table_name, keys = request.keys.len()), err)
    )]
    async fn batch_get(
        &self,
        request: store::BatchGetRequest,
    ) -> Result<store::BatchGetResponse, Error> {
        let keys_and_attributes = types::KeysAndAttributes::builder()
            .set_keys(Some(request.keys))
            .set_consistent_read(request.consistent_read)
            .set_expression_attribute_names(request.expression_attribute_names)
            .set_projection_expression(request.projection_expression)
            .build()?;
        let output = self
            .client
            .batch_get_item()
            .request_items(request.table_name, keys_and_attributes)
            .return_consumed_capacity(types::ReturnConsumedCapacity::Total)
            .send()
            .await?;
        let unprocessed = output
            .unprocessed_keys
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, keys_and_attributes)| !keys_and_attributes.keys.is_empty())
            .map(|(table_name, keys_and_attributes)| store::TableKeys {
                keys: keys_and_attributes.keys,
                table_name,
            })
            .collect();
        Ok(store::BatchGetResponse {
            consumed_capacity: total_capacity(output.consumed_capacity),
            items: output
                .responses
                .unwrap_or_default()
                .into_values()
                .flatten()
                .collect(),
            unprocessed,
        })
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.transact_get_items", skip_all, fields(table = %request.table_name, keys = request.keys.len()), err)
    )]
    async fn transact_get(
        &self,
        request: store::TransactGetRequest,
    ) -> Result<store::TransactGetResponse, Error> {
        let mut transact_items = Vec::with_capacity(request.keys.len());
        for key in request.keys {
            let get = types::Get::builder()
                .table_name(&request.table_name)
                .set_key(Some(key))
                .set_expression_attribute_names(request.expression_attribute_names.clone())
                .set_projection_expression(request.projection_expression.clone())
                .build()?;
            transact_items.push(types::TransactGetItem::builder().get(get).build());
        }
        let output = self
            .client
            .transact_get_items()
            .set_transact_items(Some(transact_items))
            .return_consumed_capacity(types::ReturnConsumedCapacity::Total)
            .send()
            .await?;
        Ok(store::TransactGetResponse {
            consumed_capacity: total_capacity(output.consumed_capacity),
            items: output
                .responses
                .unwrap_or_default()
                .into_iter()
                .map(|response| response.item)
                .collect(),
        })
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.batch_write_item", skip_all, fields(table = %request.table_name, requests = request.requests.len()), err)
    )]
    async fn batch_write(
        &self,
        request: store::BatchWriteRequest,
    ) -> Result<store::BatchWriteResponse, Error> {
        let write_requests = request
            .requests
            .into_iter()
            .map(to_sdk_write_request)
            .collect::<Result<Vec<_>, _>>()?;
        let mut attempts = 0;
        let mut total_retry_delay = time::Duration::ZERO;
        let output = loop {
            attempts += 1;
            let result = self
                .client
                .batch_write_item()
                .request_items(&request.table_name, write_requests.clone())
                .return_consumed_capacity(types::ReturnConsumedCapacity::Total)
                .send()
                .await;
            match result {
                Ok(output) => break output,
                Err(error) if attempts < self.retry.max_attempts && is_throttling(&error) => {
                    let delay = self.retry.delay(attempts - 1);
                    crate::trace_event!(
                        warn,
                        table = %request.table_name,
                        attempts,
                        ?delay,
                        "batch write throttled"
                    );
                    tokio::time::sleep(delay).await;
                    total_retry_delay += delay;
                }
                Err(error) => return Err(error.into()),
            }
        };
        let unprocessed = output
            .unprocessed_items
            .unwrap_or_default()
            .into_iter()
            .map(|(table_name, requests)| store::TableWrites {
                requests: requests
                    .into_iter()
                    .filter_map(from_sdk_write_request)
                    .collect(),
                table_name,
            })
            .filter(|table_writes| !table_writes.requests.is_empty())
            .collect();
        Ok(store::BatchWriteResponse {
            attempts,
            consumed_capacity: total_capacity(output.consumed_capacity),
            total_retry_delay,
            unprocessed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::common;
    use rstest::rstest;

    #[rstest]
    #[case::first(0, time::Duration::from_millis(100))]
    #[case::second(1, time::Duration::from_millis(200))]
    #[case::fourth(3, time::Duration::from_millis(800))]
    #[case::capped(5, time::Duration::from_millis(2000))]
    #[case::overflow(40, time::Duration::from_millis(2000))]
    fn test_retry_delay(#[case] retry: u32, #[case] expected: time::Duration) {
        assert_eq!(RetryConfig::default().delay(retry), expected);
    }

    #[rstest]
    #[case::put(store::WriteRequest::Put(
        common::Item::from([("id".to_string(), types::AttributeValue::N("1".to_string()))])
    ))]
    #[case::delete(store::WriteRequest::Delete(
        common::Item::from([("id".to_string(), types::AttributeValue::S("a".to_string()))])
    ))]
    fn test_write_request_conversion(#[case] request: store::WriteRequest) {
        let sdk_request = to_sdk_write_request(request.clone()).unwrap();
        assert_eq!(from_sdk_write_request(sdk_request), Some(request));
    }

    #[rstest]
    #[case::none(None, None)]
    #[case::empty(Some(Vec::new()), Some(0.0))]
    #[case::summed(
        Some(vec![
            types::ConsumedCapacity::builder().capacity_units(1.5).build(),
            types::ConsumedCapacity::builder().build(),
            types::ConsumedCapacity::builder().capacity_units(2.0).build(),
        ]),
        Some(3.5)
    )]
    fn test_total_capacity(
        #[case] capacities: Option<Vec<types::ConsumedCapacity>>,
        #[case] expected: Option<f64>,
    ) {
        assert_eq!(total_capacity(capacities), expected);
    }
}
