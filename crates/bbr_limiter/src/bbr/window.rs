//! Bucketed sliding-window statistics.
//!
//! A [`RollingCounter`] splits a trailing window into fixed-width time buckets stored in a
//! ring. Buckets are addressed by their absolute number (`wall_clock_nanos / bucket_nanos`),
//! so expiry needs no timer: `add` clears the slots it skipped over, and reads ignore slots
//! whose bucket has left the window since the last write.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Upper bound on the number of buckets a window is split into.
pub const MAX_BUCKETS: usize = 1 << 16;

/// How values landing in the same bucket are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Buckets accumulate the sum of their values. Empty buckets hold `0`.
    Sum,
    /// Buckets keep the smallest value. Empty buckets hold `i64::MAX`.
    Min,
}

impl Aggregation {
    const fn empty(self) -> i64 {
        match self {
            Aggregation::Sum => 0,
            Aggregation::Min => i64::MAX,
        }
    }

    fn combine(self, slot: &mut i64, value: i64) {
        match self {
            Aggregation::Sum => *slot = slot.saturating_add(value),
            Aggregation::Min => *slot = (*slot).min(value),
        }
    }
}

#[derive(Debug)]
struct Ring {
    slots: Box<[i64]>,
    /// Absolute number of the bucket most recently rotated in.
    last_bucket: u64,
}

impl Ring {
    /// Absolute bucket number currently held by `index`, if it ever held a real one.
    fn bucket_of(&self, index: usize) -> Option<u64> {
        let len = self.slots.len() as u64;
        let offset = (self.last_bucket % len + len - index as u64) % len;
        self.last_bucket.checked_sub(offset)
    }

    fn live_slots(&self, now_bucket: u64) -> impl Iterator<Item = i64> + '_ {
        let len = self.slots.len() as u64;
        self.slots
            .iter()
            .enumerate()
            .filter(move |(index, _)| {
                self.bucket_of(*index)
                    .is_some_and(|bucket| now_bucket.saturating_sub(bucket) < len)
            })
            .map(|(_, value)| *value)
    }
}

/// Tracks the per-bucket sum or minimum of a metric over a trailing time window.
#[derive(Debug)]
pub struct RollingCounter {
    ring: RwLock<Ring>,
    bucket_nanos: u64,
    aggregation: Aggregation,
}

impl RollingCounter {
    /// Creates a counter covering `window`, split into `buckets` slots.
    ///
    /// The bucket count is clamped to `1..=MAX_BUCKETS`, and buckets are at least one
    /// nanosecond wide.
    pub fn new(window: Duration, buckets: usize, aggregation: Aggregation) -> Self {
        Self::new_at(window, buckets, aggregation, wall_nanos())
    }

    fn new_at(window: Duration, buckets: usize, aggregation: Aggregation, now: u64) -> Self {
        let buckets = buckets.clamp(1, MAX_BUCKETS);
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        let bucket_nanos = (window_nanos / buckets as u64).max(1);

        Self {
            ring: RwLock::new(Ring {
                slots: vec![aggregation.empty(); buckets].into_boxed_slice(),
                last_bucket: now / bucket_nanos,
            }),
            bucket_nanos,
            aggregation,
        }
    }

    pub fn add(&self, value: i64) {
        self.add_at(value, wall_nanos());
    }

    fn add_at(&self, value: i64, now: u64) {
        let current = now / self.bucket_nanos;
        let mut ring = self.ring.write();
        let len = ring.slots.len() as u64;

        if current > ring.last_bucket {
            // A gap longer than the whole window clears everything once.
            let stale = (current - ring.last_bucket).min(len);
            for step in 1..=stale {
                let index = ((ring.last_bucket + step) % len) as usize;
                ring.slots[index] = self.aggregation.empty();
            }
            ring.last_bucket = current;
        } else if ring.last_bucket - current >= len {
            // The clock stepped back past the window; that slot now holds a newer bucket.
            return;
        }

        let index = (current % len) as usize;
        self.aggregation.combine(&mut ring.slots[index], value);
    }

    /// Largest bucket in the window.
    ///
    /// In [`Aggregation::Min`] mode empty buckets are skipped. Returns `0` when nothing
    /// larger was recorded.
    pub fn max(&self) -> i64 {
        self.max_at(wall_nanos())
    }

    fn max_at(&self, now: u64) -> i64 {
        let empty = self.aggregation.empty();
        let ring = self.ring.read();
        let max = ring
            .live_slots(now / self.bucket_nanos)
            .filter(|value| *value != empty || self.aggregation == Aggregation::Sum)
            .fold(0, i64::max);
        max
    }

    /// Smallest positive, non-empty bucket in the window, or `1` when there is none.
    ///
    /// Never returning zero lets callers divide by the result.
    pub fn min(&self) -> i64 {
        self.min_at(wall_nanos())
    }

    fn min_at(&self, now: u64) -> i64 {
        let ring = self.ring.read();
        let min = ring
            .live_slots(now / self.bucket_nanos)
            .filter(|value| *value > 0 && *value != i64::MAX)
            .min();
        min.unwrap_or(1)
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_nanos)
    }
}

fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
