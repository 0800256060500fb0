//! Pipeline health counters.
//!
//! `Telemetry` lives inside the control loop and is mutated only there.
//! `reset` produces the delta since the previous reset; the cumulative
//! totals are never rewound.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use super::error::BatchError;
use super::types::HttpTransaction;

macro_rules! counters {
    ($($field:ident => $name:literal),* $(,)?) => {
        /// Cumulative pipeline counters.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct Counters {
            $(pub $field: u64,)*
        }

        impl Counters {
            /// Exposed name of every counter, in field order.
            pub const NAMES: &'static [&'static str] = &[$($name),*];

            /// `(name, value)` for every counter.
            pub fn fields(&self) -> Vec<(&'static str, u64)> {
                vec![$(($name, self.$field)),*]
            }

            fn saturating_sub(&self, base: &Counters) -> Counters {
                Counters {
                    $($field: self.$field.saturating_sub(base.$field),)*
                }
            }
        }
    };
}

counters! {
    decoded => "decoded",
    hits1xx => "hits1XX",
    hits2xx => "hits2XX",
    hits3xx => "hits3XX",
    hits4xx => "hits4XX",
    hits5xx => "hits5XX",
    misses => "misses",
    missed_batch => "errors.missed_batch",
    lost_batch => "errors.lost_batch",
    storage_read => "errors.storage_read",
    unknown_cpu => "errors.unknown_cpu",
    malformed => "malformed",
    rejected => "rejected",
    dropped => "dropped",
    expired => "expired",
    aggregations => "aggregations",
}

/// Counter delta between two resets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub delta: Counters,
    pub elapsed_secs: f64,
}

impl TelemetrySnapshot {
    /// Flat map of counter deltas plus per-second rates.
    pub fn report(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (name, value) in self.delta.fields() {
            out.insert(name.to_string(), Value::from(value));
            if self.elapsed_secs > 0.0 {
                out.insert(
                    format!("{name}_per_sec"),
                    Value::from(value as f64 / self.elapsed_secs),
                );
            }
        }
        out.insert("elapsed_s".to_string(), Value::from(self.elapsed_secs));

        debug!(
            decoded = self.delta.decoded,
            misses = self.delta.misses,
            malformed = self.delta.malformed,
            rejected = self.delta.rejected,
            dropped = self.delta.dropped,
            aggregations = self.delta.aggregations,
            elapsed_s = self.elapsed_secs,
            "http telemetry",
        );

        out
    }
}

pub struct Telemetry {
    current: Counters,
    baseline: Counters,
    last_reset: Instant,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            current: Counters::default(),
            baseline: Counters::default(),
            last_reset: Instant::now(),
        }
    }

    /// Count decoded records and, when present, the batch error.
    pub fn aggregate(&mut self, records: &[HttpTransaction], err: Option<&BatchError>) {
        self.current.decoded += records.len() as u64;
        for tx in records {
            match tx.status_class() {
                100 => self.current.hits1xx += 1,
                200 => self.current.hits2xx += 1,
                300 => self.current.hits3xx += 1,
                400 => self.current.hits4xx += 1,
                500 => self.current.hits5xx += 1,
                _ => {}
            }
        }

        match err {
            Some(BatchError::MissedBatch { .. }) => self.current.missed_batch += 1,
            Some(BatchError::Storage { .. }) => self.current.storage_read += 1,
            Some(BatchError::UnknownCpu { .. }) => self.current.unknown_cpu += 1,
            None => {}
        }
    }

    /// A whole batch was dropped before its notification was delivered.
    pub fn lost_batch(&mut self) {
        self.current.lost_batch += 1;
        self.current.misses += 1;
    }

    pub fn storage_read_failures(&mut self, n: u64) {
        self.current.storage_read += n;
    }

    pub fn malformed(&mut self) {
        self.current.malformed += 1;
    }

    pub fn rejected(&mut self) {
        self.current.rejected += 1;
    }

    pub fn dropped(&mut self) {
        self.current.dropped += 1;
    }

    pub fn expired(&mut self, n: u64) {
        self.current.expired += n;
    }

    pub fn aggregations(&mut self, n: u64) {
        self.current.aggregations += n;
    }

    /// Cumulative totals since creation.
    pub fn totals(&self) -> Counters {
        self.current
    }

    /// Delta since the previous reset. The baseline moves forward; totals
    /// keep accumulating.
    pub fn reset(&mut self) -> TelemetrySnapshot {
        let now = Instant::now();
        let snapshot = TelemetrySnapshot {
            delta: self.current.saturating_sub(&self.baseline),
            elapsed_secs: now.duration_since(self.last_reset).as_secs_f64(),
        };
        self.baseline = self.current;
        self.last_reset = now;
        snapshot
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
