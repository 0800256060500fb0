use serde::Serialize;

/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Number of tracked status classes (1xx through 5xx).
pub const NUM_STATUS_CLASSES: usize = 5;

/// Histogram bucket boundaries in nanoseconds.
/// 10 buckets: <1us, 1us-10us, 10us-100us, 100us-1ms, 1ms-10ms,
/// 10ms-100ms, 100ms-1s, 1s-10s, 10s-100s, 100s+.
const BOUNDARIES: [u64; 9] = [
    1_000,           // 1 microsecond
    10_000,          // 10 microseconds
    100_000,         // 100 microseconds
    1_000_000,       // 1 millisecond
    10_000_000,      // 10 milliseconds
    100_000_000,     // 100 milliseconds
    1_000_000_000,   // 1 second
    10_000_000_000,  // 10 seconds
    100_000_000_000, // 100 seconds
];

/// Exponential latency histogram. Owned by the control loop, so plain
/// counters suffice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    buckets: [u64; NUM_BUCKETS],
}

impl Histogram {
    pub fn record(&mut self, value_ns: u64) {
        self.buckets[bucket_index(value_ns)] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (dst, src) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *dst += src;
        }
    }

    /// Returns [<1us, 1us-10us, 10us-100us, ..., 100s+].
    pub fn buckets(&self) -> [u64; NUM_BUCKETS] {
        self.buckets
    }
}

/// Returns the bucket index for a given value in nanoseconds.
fn bucket_index(value_ns: u64) -> usize {
    BOUNDARIES
        .iter()
        .position(|&boundary| value_ns < boundary)
        .unwrap_or(NUM_BUCKETS - 1)
}

/// Returns the upper bounds for each bucket in nanoseconds.
/// The last bucket is unbounded (+inf, represented as 0).
pub fn bucket_boundaries() -> [u64; NUM_BUCKETS] {
    let mut out = [0u64; NUM_BUCKETS];
    out[..BOUNDARIES.len()].copy_from_slice(&BOUNDARIES);
    out
}

/// Sum, count, min, max and histogram of request latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyAggregate {
    pub sum: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub histogram: Histogram,
}

impl Default for LatencyAggregate {
    fn default() -> Self {
        Self {
            sum: 0,
            count: 0,
            min: u64::MAX,
            max: 0,
            histogram: Histogram::default(),
        }
    }
}

impl LatencyAggregate {
    pub fn record(&mut self, value_ns: u64) {
        self.sum = self.sum.saturating_add(value_ns);
        self.count += 1;
        self.min = self.min.min(value_ns);
        self.max = self.max.max(value_ns);
        self.histogram.record(value_ns);
    }

    pub fn merge(&mut self, other: &LatencyAggregate) {
        if other.count == 0 {
            return;
        }
        self.sum = self.sum.saturating_add(other.sum);
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.histogram.merge(&other.histogram);
    }

    /// Minimum latency, 0 when nothing was recorded.
    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn mean(&self) -> u64 {
        self.sum.checked_div(self.count).unwrap_or(0)
    }
}

/// Aggregate for one status class of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusClassStats {
    pub count: u64,
    pub latency: LatencyAggregate,
    /// OR of the static tags of every contributing transaction.
    pub tags: u64,
}

/// Per-key statistics, split by response status class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    classes: [StatusClassStats; NUM_STATUS_CLASSES],
}

impl RequestStats {
    /// Fold one observation in. Status codes outside 100..=599 are ignored.
    /// A zero latency is counted but not recorded in the distribution.
    pub fn add_request(&mut self, status_code: u16, latency_ns: u64, tags: u64) {
        let Some(slot) = class_slot(status_code) else {
            return;
        };
        let class = &mut self.classes[slot];
        class.count += 1;
        class.tags |= tags;
        if latency_ns > 0 {
            class.latency.record(latency_ns);
        }
    }

    pub fn combine_with(&mut self, other: &RequestStats) {
        for (dst, src) in self.classes.iter_mut().zip(other.classes.iter()) {
            dst.count += src.count;
            dst.tags |= src.tags;
            dst.latency.merge(&src.latency);
        }
    }

    /// Stats for a status class given as its hundred (200, 404, ...).
    pub fn class(&self, status_code: u16) -> Option<&StatusClassStats> {
        class_slot(status_code).map(|slot| &self.classes[slot])
    }

    /// Non-empty classes as `(class, stats)`, e.g. `(200, ..)`.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &StatusClassStats)> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.count > 0)
            .map(|(i, s)| ((i as u16 + 1) * 100, s))
    }

    pub fn total_count(&self) -> u64 {
        self.classes.iter().map(|c| c.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }
}

fn class_slot(status_code: u16) -> Option<usize> {
    match status_code {
        100..=599 => Some(usize::from(status_code / 100) - 1),
        _ => None,
    }
}
