//! Joins request-only and response-only halves of the same exchange.
//!
//! The kernel program may observe the two halves of one exchange on
//! different sockets or CPUs. Each half is parked here until its
//! counterpart shows up or it ages out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use super::types::{ConnTuple, HttpTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct JoinKey {
    tup: ConnTuple,
    tcp_seq: u32,
}

impl JoinKey {
    fn of(tx: &HttpTransaction) -> Self {
        Self {
            tup: tx.tup,
            tcp_seq: tx.tcp_seq,
        }
    }
}

struct Parked {
    tx: HttpTransaction,
    since: Instant,
}

/// Outcome of a flush.
#[derive(Debug, Default)]
pub struct FlushResult {
    pub joined: Vec<HttpTransaction>,
    pub expired: u64,
}

pub struct IncompleteBuffer {
    requests: HashMap<JoinKey, Parked>,
    responses: HashMap<JoinKey, Parked>,
    timeout: Duration,
    capacity: usize,
}

impl IncompleteBuffer {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        Self {
            requests: HashMap::new(),
            responses: HashMap::new(),
            timeout,
            capacity,
        }
    }

    /// Park an incomplete transaction. Returns false if the buffer is full
    /// and the half was dropped. Complete transactions are ignored.
    pub fn add(&mut self, tx: HttpTransaction, now: Instant) -> bool {
        let target = if tx.is_request_only() {
            &mut self.requests
        } else if tx.is_response_only() {
            &mut self.responses
        } else {
            return true;
        };

        let key = JoinKey::of(&tx);
        if !target.contains_key(&key) && target.len() >= self.capacity {
            return false;
        }
        target.insert(key, Parked { tx, since: now });
        true
    }

    /// Emit every joinable pair and discard halves older than the timeout.
    pub fn flush(&mut self, now: Instant) -> FlushResult {
        let mut result = FlushResult::default();

        let responses = std::mem::take(&mut self.responses);
        for (key, response) in responses {
            match self.requests.remove(&key) {
                Some(request) => result.joined.push(join(request.tx, &response.tx)),
                None => {
                    self.responses.insert(key, response);
                }
            }
        }

        let timeout = self.timeout;
        let before = self.requests.len() + self.responses.len();
        self.requests
            .retain(|_, p| now.saturating_duration_since(p.since) < timeout);
        self.responses
            .retain(|_, p| now.saturating_duration_since(p.since) < timeout);
        result.expired = (before - self.requests.len() - self.responses.len()) as u64;

        if result.expired > 0 {
            trace!(expired = result.expired, "expired incomplete transactions");
        }

        result
    }

    pub fn len(&self) -> usize {
        self.requests.len() + self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn join(mut request: HttpTransaction, response: &HttpTransaction) -> HttpTransaction {
    request.response_status_code = response.response_status_code;
    request.response_last_seen = response.response_last_seen;
    request.tags |= response.tags;
    request
}
