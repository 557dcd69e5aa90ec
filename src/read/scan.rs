use crate::{Error, config, read, store};

use serde::Serialize;

/// Scan operation.
///
/// ```rust,no_run
/// use dynamodb_fetch::{config, read, store};
/// use serde_json::Value;
///
/// # async fn example(store: store::SharedStoreClient) -> Result<(), dynamodb_fetch::Error> {
/// let scan: read::scan::Scan<Value> = read::scan::Scan {
///     multiple_read_args: read::common::MultipleReadArgs {
///         table_name: "users".to_string(),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// let items = scan.send(store, config::FetchOptions::default())?.collect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scan<T> {
    /// Additional read operation arguments (table name, filter, selection, etc.).
    pub multiple_read_args: read::common::MultipleReadArgs<T>,
    /// The segment number for parallel scans (0-indexed).
    pub segment: Option<i32>,
    /// The total number of segments for parallel scans.
    pub total_segments: Option<i32>,
}

impl<T: Serialize> TryFrom<Scan<T>> for store::PageRequest {
    type Error = Error;

    fn try_from(scan: Scan<T>) -> Result<Self, Error> {
        match (scan.segment, scan.total_segments) {
            (Some(segment), Some(total_segments)) if !(0..total_segments).contains(&segment) => {
                return Err(Error::configuration(format!(
                    "scan segment {segment} is outside of 0..{total_segments}"
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::configuration(
                    "segment and total segments must be set together",
                ));
            }
            _ => {}
        }
        let mut request = scan.multiple_read_args.into_page_request(None)?;
        request.segment = scan.segment;
        request.total_segments = scan.total_segments;
        Ok(request)
    }
}

impl<T: Serialize> Scan<T> {
    /// Starts the scan, returning an iterator over its items.
    ///
    /// Nothing is sent before the iterator is polled.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "dynamodb_fetch.scan", skip_all, err)
    )]
    pub fn send(
        self,
        store: store::SharedStoreClient,
        options: config::FetchOptions,
    ) -> Result<read::iterator::TableIterator<read::common::QueryScanStrategy>, Error> {
        let request: store::PageRequest = self.try_into()?;
        let strategy = read::common::QueryScanStrategy::new(
            store,
            read::common::PageOperation::Scan,
            request,
        );
        let fetcher = read::fetcher::Fetcher::new(strategy, &options)?;
        Ok(read::iterator::TableIterator::new(fetcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{common, store::mock};
    use rstest::rstest;
    use serde_json::{Value, json};
    use std::{sync::Arc, time};

    fn scan() -> Scan<Value> {
        Scan {
            multiple_read_args: read::common::MultipleReadArgs {
                table_name: "a".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case::whole_table(None, None, true)]
    #[case::segment(Some(3), Some(4), true)]
    #[case::segment_out_of_range(Some(4), Some(4), false)]
    #[case::negative_segment(Some(-1), Some(4), false)]
    #[case::segment_without_total(Some(0), None, false)]
    fn test_segments(
        #[case] segment: Option<i32>,
        #[case] total_segments: Option<i32>,
        #[case] valid: bool,
    ) {
        let result: Result<store::PageRequest, Error> = Scan {
            segment,
            total_segments,
            ..scan()
        }
        .try_into();
        match result {
            Ok(request) => {
                assert!(valid);
                assert_eq!(request.segment, segment);
                assert_eq!(request.total_segments, total_segments);
                assert_eq!(request.key_condition_expression, None);
            }
            Err(error) => {
                assert!(!valid);
                assert!(error.is_configuration());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_discarding_most_rows_still_completes() {
        let store = Arc::new(
            mock::MockStore::new()
                .with_pages(mock::paged_table((0..1000).map(mock::item).collect(), |item| {
                    mock::id_of(item) % 10 == 0
                }))
                .with_latency(time::Duration::from_millis(3)),
        );
        let mut iterator = Scan {
            multiple_read_args: read::common::MultipleReadArgs {
                condition: Some(common::condition::ConditionExpression::leaf(
                    "kept",
                    common::condition::Condition::Equals(json!(true)),
                )),
                table_name: "a".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
        .send(
            store.clone(),
            config::FetchOptions {
                batch_size: 5,
                buffer_capacity: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let items = iterator.collect().await.unwrap();
        let ids: Vec<_> = items.iter().map(mock::id_of).collect();
        assert_eq!(ids, (0..1000).step_by(10).collect::<Vec<_>>());
        assert_eq!(store.page_calls(), 200);
        assert!(iterator.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_request_carries_filter_and_segment() {
        let store = Arc::new(
            mock::MockStore::new()
                .with_pages(mock::paged_table((0..3).map(mock::item).collect(), |_| true)),
        );
        let mut iterator = Scan::<Value> {
            multiple_read_args: read::common::MultipleReadArgs {
                condition: Some(common::condition::ConditionExpression::leaf(
                    "a.b",
                    common::condition::Condition::NotNull,
                )),
                consistent_read: Some(true),
                table_name: "a".to_string(),
                ..Default::default()
            },
            segment: Some(1),
            total_segments: Some(2),
        }
        .send(store.clone(), config::FetchOptions::default())
        .unwrap();
        assert_eq!(iterator.collect().await.unwrap().len(), 3);
        let requests = store.page_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].filter_expression.as_deref(),
            Some("attribute_exists(#p0.#p1)")
        );
        assert_eq!(requests[0].limit, Some(25));
        assert_eq!(requests[0].segment, Some(1));
        assert_eq!(requests[0].consistent_read, Some(true));
    }
}
