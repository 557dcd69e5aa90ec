use std::collections;

/// The pass a chunk was scheduled in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pass {
    /// The chunk comes from the caller's input list.
    Primary,
    /// The chunk is half of a primary chunk's unprocessed remainder.
    Retry,
}

/// Primary and retry chunks of one batch operation.
///
/// Retry chunks are only handed out once every primary chunk has completed. Unprocessed
/// entries of a primary chunk are split in two halves that are queued for retry; unprocessed
/// entries of a retry chunk are given back to the caller.
#[derive(Debug)]
pub struct ChunkQueue<T> {
    primary: collections::VecDeque<Vec<T>>,
    retry: collections::VecDeque<Vec<T>>,
    primary_in_flight: usize,
    retry_in_flight: usize,
}

impl<T> ChunkQueue<T> {
    /// Partitions `items` into chunks of at most `chunk_size` entries.
    pub fn new(items: Vec<T>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut primary = collections::VecDeque::with_capacity(items.len().div_ceil(chunk_size));
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            primary.push_back(items.by_ref().take(chunk_size).collect());
        }
        Self {
            primary,
            retry: collections::VecDeque::new(),
            primary_in_flight: 0,
            retry_in_flight: 0,
        }
    }

    /// Takes the next chunk to send, if one may be sent now.
    pub fn next_chunk(&mut self) -> Option<(Vec<T>, Pass)> {
        if let Some(chunk) = self.primary.pop_front() {
            self.primary_in_flight += 1;
            return Some((chunk, Pass::Primary));
        }
        if self.primary_in_flight > 0 {
            return None;
        }
        let chunk = self.retry.pop_front()?;
        self.retry_in_flight += 1;
        Some((chunk, Pass::Retry))
    }

    /// Records the completion of a chunk sent in `pass`.
    ///
    /// Returns the entries that will not be retried.
    pub fn complete(&mut self, pass: Pass, unprocessed: Vec<T>) -> Vec<T> {
        match pass {
            Pass::Primary => {
                self.primary_in_flight = self.primary_in_flight.saturating_sub(1);
                self.retry.extend(split_in_half(unprocessed));
                Vec::new()
            }
            Pass::Retry => {
                self.retry_in_flight = self.retry_in_flight.saturating_sub(1);
                unprocessed
            }
        }
    }

    /// Whether a chunk is waiting to be sent.
    pub fn has_pending(&self) -> bool {
        !self.primary.is_empty() || !self.retry.is_empty()
    }

    /// Number of chunks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.primary_in_flight + self.retry_in_flight
    }

    /// Whether every chunk, retries included, has been sent and completed.
    pub fn is_drained(&self) -> bool {
        !self.has_pending() && self.in_flight() == 0
    }
}

/// Splits `items` into at most two non-empty halves, the first one taking the odd entry.
pub fn split_in_half<T>(mut items: Vec<T>) -> Vec<Vec<T>> {
    let second = items.split_off(items.len().div_ceil(2));
    [items, second]
        .into_iter()
        .filter(|half| !half.is_empty())
        .collect()
}
