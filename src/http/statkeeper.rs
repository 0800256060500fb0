use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use anyhow::Result;
use regex::Regex;
use tracing::trace;

use super::incomplete::IncompleteBuffer;
use super::stats::RequestStats;
use super::telemetry::Telemetry;
use super::types::{HttpTransaction, Method};
use crate::config::HttpConfig;

const VALID_STATUS: std::ops::RangeInclusive<u16> = 100..=599;

/// Aggregation key: connection identity, request path and method.
///
/// Process id and network namespace are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub path: String,
    /// False when the fragment was truncated before the path ended.
    pub full_path: bool,
    pub method: Method,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} {} {}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.method, self.path
        )
    }
}

struct CompiledRule {
    re: Regex,
    repl: String,
}

/// Folds transactions into per-key statistics.
pub struct StatKeeper {
    stats: HashMap<Key, RequestStats>,
    incomplete: IncompleteBuffer,
    rules: Vec<CompiledRule>,
    max_entries: usize,
}

impl StatKeeper {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let rules = cfg
            .replace_rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    re: rule.compile()?,
                    repl: rule.repl.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            stats: HashMap::new(),
            incomplete: IncompleteBuffer::new(
                cfg.incomplete_buffer_timeout,
                cfg.max_stats_buffered,
            ),
            rules,
            max_entries: cfg.max_stats_buffered,
        })
    }

    /// Fold a batch of records in. Incomplete halves are parked until they
    /// can be joined.
    pub fn process(&mut self, records: Vec<HttpTransaction>, telemetry: &mut Telemetry) {
        let now = Instant::now();
        for tx in records {
            if tx.is_incomplete() {
                // Neither half observed.
                if !tx.is_request_only() && !tx.is_response_only() {
                    telemetry.malformed();
                    continue;
                }
                if !self.incomplete.add(tx, now) {
                    telemetry.dropped();
                }
                continue;
            }
            self.add(&tx, telemetry);
        }
    }

    /// Return every key's stats and start over empty.
    pub fn get_and_reset_all_stats(
        &mut self,
        telemetry: &mut Telemetry,
    ) -> HashMap<Key, RequestStats> {
        let flushed = self.incomplete.flush(Instant::now());
        telemetry.expired(flushed.expired);
        for tx in &flushed.joined {
            self.add(tx, telemetry);
        }

        let out = std::mem::take(&mut self.stats);
        telemetry.aggregations(out.len() as u64);
        out
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    fn add(&mut self, tx: &HttpTransaction, telemetry: &mut Telemetry) {
        let Some((raw_path, full_path)) = tx.path().filter(|(p, _)| !p.is_empty()) else {
            telemetry.malformed();
            return;
        };

        let Some(path) = self.apply_rules(&String::from_utf8_lossy(raw_path)) else {
            telemetry.rejected();
            return;
        };

        let method = tx.method();
        if method == Method::Unknown || !VALID_STATUS.contains(&tx.response_status_code) {
            telemetry.malformed();
            return;
        }

        let key = Key {
            src_ip: tx.tup.source_addr(),
            src_port: tx.tup.sport,
            dst_ip: tx.tup.dest_addr(),
            dst_port: tx.tup.dport,
            path,
            full_path,
            method,
        };

        if !self.stats.contains_key(&key) && self.stats.len() >= self.max_entries {
            trace!(%key, "stats buffer full, dropping new key");
            telemetry.dropped();
            return;
        }

        self.stats.entry(key).or_default().add_request(
            tx.response_status_code,
            tx.latency_ns(),
            tx.static_tags(),
        );
    }

    /// Returns `None` when a matching rule has an empty replacement.
    fn apply_rules(&self, path: &str) -> Option<String> {
        let mut path = path.to_string();
        for rule in &self.rules {
            if !rule.re.is_match(&path) {
                continue;
            }
            if rule.repl.is_empty() {
                return None;
            }
            path = rule.re.replace_all(&path, rule.repl.as_str()).into_owned();
        }
        Some(path)
    }
}
