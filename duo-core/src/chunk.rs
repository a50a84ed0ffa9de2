//! Chunk bookkeeping: chunk geometry, the sender's sliding window, receiver progress.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024; // 64 KiB
/// Default number of un-acknowledged chunks allowed in flight.
pub const DEFAULT_WINDOW_SIZE: u32 = 8;
/// Default retransmissions per chunk before the transfer fails.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Number of chunks needed for `total_len` bytes. Zero chunk size falls back to the default.
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u32 {
    let size = effective_chunk_size(chunk_size);
    total_len.div_ceil(size) as u32
}

/// Byte range (offset, len) of chunk `index`, or None if out of range.
pub fn chunk_span(index: u32, total_len: u64, chunk_size: u64) -> Option<(u64, usize)> {
    let size = effective_chunk_size(chunk_size);
    let start = u64::from(index).checked_mul(size)?;
    if start >= total_len {
        return None;
    }
    let end = (start + size).min(total_len);
    Some((start, (end - start) as usize))
}

fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkAttempt {
    sent_at: Instant,
    /// Total sends, including the first.
    attempts: u32,
}

/// A chunk ran out of retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk {index} exceeded {max_retries} retransmissions")]
pub struct RetryExceeded {
    pub index: u32,
    pub max_retries: u32,
}

/// Sliding-window state table for one outgoing transfer.
///
/// `base` is the smallest un-acknowledged index. Chunks `[base, base + width)` may be in
/// flight. Acknowledgements arrive in any order; the acknowledged set only grows.
#[derive(Debug)]
pub struct SendWindow {
    total: u32,
    width: u32,
    base: u32,
    next: u32,
    in_flight: BTreeMap<u32, ChunkAttempt>,
    acked: HashSet<u32>,
}

impl SendWindow {
    pub fn new(total: u32, width: u32) -> Self {
        Self {
            total,
            width: width.max(1),
            base: 0,
            next: 0,
            in_flight: BTreeMap::new(),
            acked: HashSet::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn is_complete(&self) -> bool {
        self.base >= self.total
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// Claim never-sent indices that fit in the window, recording them as sent at `now`.
    pub fn take_fresh(&mut self, now: Instant) -> Vec<u32> {
        let limit = self.base.saturating_add(self.width).min(self.total);
        let mut out = Vec::new();
        while self.next < limit {
            let index = self.next;
            self.next += 1;
            if self.acked.contains(&index) {
                continue;
            }
            self.in_flight.insert(
                index,
                ChunkAttempt {
                    sent_at: now,
                    attempts: 1,
                },
            );
            out.push(index);
        }
        out
    }

    /// Record an acknowledgement. Returns false for duplicates and out-of-range indices.
    pub fn ack(&mut self, index: u32) -> bool {
        if index >= self.total || !self.acked.insert(index) {
            return false;
        }
        self.in_flight.remove(&index);
        while self.base < self.total && self.acked.contains(&self.base) {
            self.base += 1;
        }
        true
    }

    /// Indices whose ack is overdue at `now`, re-stamped for retransmission.
    /// Fails if any overdue chunk has already been retransmitted `max_retries` times.
    pub fn take_expired(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> Result<Vec<u32>, RetryExceeded> {
        let mut out = Vec::new();
        for (&index, attempt) in self.in_flight.iter_mut() {
            if now.saturating_duration_since(attempt.sent_at) < ack_timeout {
                continue;
            }
            if attempt.attempts > max_retries {
                return Err(RetryExceeded { index, max_retries });
            }
            attempt.attempts += 1;
            attempt.sent_at = now;
            out.push(index);
        }
        Ok(out)
    }

    /// Sends so far for `index` (0 if never sent or already acknowledged).
    pub fn attempts(&self, index: u32) -> u32 {
        self.in_flight.get(&index).map(|a| a.attempts).unwrap_or(0)
    }
}

/// Smoothing factor for the transfer-rate moving average.
const RATE_ALPHA: f64 = 0.3;

/// Point-in-time progress of an incoming transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub received: u64,
    pub total: u64,
    pub percent: u8,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Receiver-side counters: distinct chunks seen, bytes received, smoothed rate.
#[derive(Debug)]
pub struct ReceiveProgress {
    declared_size: u64,
    received: u64,
    seen: HashSet<u32>,
    highest_index: Option<u32>,
    rate: Option<f64>,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    interval: Duration,
}

impl ReceiveProgress {
    pub fn new(declared_size: u64, interval: Duration, now: Instant) -> Self {
        Self {
            declared_size,
            received: 0,
            seen: HashSet::new(),
            highest_index: None,
            rate: None,
            last_sample_at: now,
            last_sample_bytes: 0,
            interval,
        }
    }

    /// Count a chunk once. Returns false for an index already seen.
    pub fn record(&mut self, index: u32, len: usize) -> bool {
        if !self.seen.insert(index) {
            return false;
        }
        self.received = self
            .received
            .saturating_add(len as u64)
            .min(self.declared_size);
        self.highest_index = Some(self.highest_index.map_or(index, |h| h.max(index)));
        true
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn highest_index(&self) -> Option<u32> {
        self.highest_index
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.declared_size
    }

    /// Throttled snapshot: None until `interval` has passed since the previous sample.
    pub fn sample(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed < self.interval {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let instant = (self.received - self.last_sample_bytes) as f64 / secs;
            self.rate = Some(match self.rate {
                Some(prev) => RATE_ALPHA * instant + (1.0 - RATE_ALPHA) * prev,
                None => instant,
            });
        }
        self.last_sample_at = now;
        self.last_sample_bytes = self.received;
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let rate = self.rate.unwrap_or(0.0);
        let remaining = self.declared_size - self.received;
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        };
        let percent = if self.declared_size == 0 {
            100
        } else {
            ((self.received * 100) / self.declared_size) as u8
        };
        ProgressSnapshot {
            received: self.received,
            total: self.declared_size,
            percent,
            bytes_per_sec: rate,
            eta,
        }
    }
}
