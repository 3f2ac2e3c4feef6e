// In: src/enumerator.rs

//! The identifier space enumerator.
//!
//! Generates every Snowflake identifier with sequence 0 over a millisecond
//! range for a fixed set of origin tags. Pure arithmetic: no I/O happens here.
//! The sequence is lazy, so memory stays bounded by one fetch batch no matter
//! how wide the range is.

use std::sync::Arc;

use crate::error::{FirehoseError, Result};
use crate::types::snowflake::{SnowflakeId, MAX_TIMESTAMP_OFFSET, ORIGIN_MASK};

/// Lazy iterator over `[begin, end) x origin_tags`, millisecond-major.
#[derive(Debug, Clone)]
pub struct IdEnumerator {
    begin_ms: i64,
    end_ms: i64,
    epoch_ms: i64,
    origin_tags: Arc<[u16]>,
    next_ms: i64,
    next_tag: usize,
}

impl IdEnumerator {
    /// Validates the range against the identifier layout.
    pub fn new(begin_ms: i64, end_ms: i64, epoch_ms: i64, origin_tags: &[u16]) -> Result<Self> {
        if begin_ms > end_ms {
            return Err(FirehoseError::InvalidConfig(format!(
                "range begin {} is after end {}",
                begin_ms, end_ms
            )));
        }
        if begin_ms < epoch_ms {
            return Err(FirehoseError::InvalidConfig(format!(
                "range begin {} precedes the identifier epoch {}",
                begin_ms, epoch_ms
            )));
        }
        if end_ms - epoch_ms > MAX_TIMESTAMP_OFFSET + 1 {
            return Err(FirehoseError::InvalidConfig(format!(
                "range end {} overflows the 41-bit timestamp field",
                end_ms
            )));
        }
        if let Some(tag) = origin_tags.iter().find(|&&t| t as u64 > ORIGIN_MASK) {
            return Err(FirehoseError::InvalidConfig(format!(
                "origin tag {} does not fit in 10 bits",
                tag
            )));
        }
        Ok(Self {
            begin_ms,
            end_ms,
            epoch_ms,
            origin_tags: Arc::from(origin_tags),
            next_ms: begin_ms,
            next_tag: 0,
        })
    }

    /// Total number of identifiers in the full range.
    pub fn total(&self) -> u64 {
        (self.end_ms - self.begin_ms) as u64 * self.origin_tags.len() as u64
    }

    /// Rewinds to the start of the range.
    pub fn restart(&mut self) {
        self.next_ms = self.begin_ms;
        self.next_tag = 0;
    }

    /// Groups the remaining identifiers into fixed-size batches. The last
    /// batch may be shorter.
    pub fn batches(self, batch_size: usize) -> IdBatches {
        IdBatches {
            inner: self,
            batch_size: batch_size.max(1),
        }
    }

    fn remaining(&self) -> u64 {
        if self.origin_tags.is_empty() || self.next_ms >= self.end_ms {
            return 0;
        }
        let full_ms = (self.end_ms - self.next_ms) as u64;
        full_ms * self.origin_tags.len() as u64 - self.next_tag as u64
    }
}

impl Iterator for IdEnumerator {
    type Item = SnowflakeId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.origin_tags.is_empty() || self.next_ms >= self.end_ms {
            return None;
        }
        let id = SnowflakeId::encode(
            self.next_ms,
            self.origin_tags[self.next_tag],
            0,
            self.epoch_ms,
        );
        self.next_tag += 1;
        if self.next_tag == self.origin_tags.len() {
            self.next_tag = 0;
            self.next_ms += 1;
        }
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for IdEnumerator {}

/// Fixed-size windows over an [`IdEnumerator`], handed to the producer one at
/// a time.
#[derive(Debug, Clone)]
pub struct IdBatches {
    inner: IdEnumerator,
    batch_size: usize,
}

impl Iterator for IdBatches {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<u64> = self
            .inner
            .by_ref()
            .take(self.batch_size)
            .map(|id| id.as_u64())
            .collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
