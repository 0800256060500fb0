use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::http::{Key, Monitor, RequestStats};
use crate::producer::Producer;

/// Number of busiest keys logged per report.
const TOP_KEYS: usize = 5;

/// Agent orchestrates the health server, the HTTP monitor and the periodic
/// stats reporter.
pub struct Agent<P: Producer> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    monitor: Arc<Monitor<P>>,
    reporter: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<P: Producer> Agent<P> {
    /// Create the agent. Opens the producer's storage but does not start it.
    pub fn new(cfg: Config, producer: P) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let monitor =
            Arc::new(Monitor::new(&cfg.http, producer).context("creating http monitor")?);

        Ok(Self {
            cfg,
            health,
            monitor,
            reporter: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn monitor(&self) -> &Arc<Monitor<P>> {
        &self.monitor
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        self.monitor
            .start()
            .await
            .context("starting http monitor")?;
        self.health.monitor_running.set(1.0);

        self.spawn_stats_reporter();

        info!(
            report_interval = ?self.cfg.http.report_interval,
            max_stats_buffered = self.cfg.http.max_stats_buffered,
            replace_rules = self.cfg.http.replace_rules.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal background tasks to stop.
        self.cancel.cancel();
        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                debug!(error = %e, "stats reporter task ended abnormally");
            }
        }

        self.monitor.stop().await;
        self.health.monitor_running.set(0.0);

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn the background task that drains stats every report interval.
    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let monitor = Arc::clone(&self.monitor);
        let interval = self.cfg.http.report_interval;

        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        let stats = monitor.query().await;
                        health
                            .stats_drain_duration
                            .observe(start.elapsed().as_secs_f64());
                        health.record_telemetry(&stats.telemetry.delta);
                        health.record_requests(&combined(&stats.requests));

                        report(&stats.requests, interval.as_secs_f64());
                    }
                }
            }
        }));
    }
}

/// Log a summary of one drain.
fn report(stats: &HashMap<Key, RequestStats>, window_secs: f64) {
    let summary = summarize(stats);
    if summary.requests == 0 {
        return;
    }

    info!(
        keys = stats.len(),
        requests = summary.requests,
        errors_5xx = summary.server_errors,
        window_s = window_secs,
        "http stats",
    );

    for (key, count) in summary.top {
        debug!(key = %key, count, "  busiest key");
    }
}

/// All keys folded into one per-class aggregate.
fn combined(stats: &HashMap<Key, RequestStats>) -> RequestStats {
    let mut totals = RequestStats::default();
    for value in stats.values() {
        totals.combine_with(value);
    }
    totals
}

#[derive(Debug, Default)]
struct Summary<'a> {
    requests: u64,
    server_errors: u64,
    top: Vec<(&'a Key, u64)>,
}

fn summarize(stats: &HashMap<Key, RequestStats>) -> Summary<'_> {
    let mut summary = Summary::default();
    let mut by_count: Vec<(&Key, u64)> = Vec::with_capacity(stats.len());

    for (key, value) in stats {
        let count = value.total_count();
        summary.requests += count;
        summary.server_errors += value.class(500).map_or(0, |c| c.count);
        by_count.push((key, count));
    }

    by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    by_count.truncate(TOP_KEYS);
    summary.top = by_count;
    summary
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::http::types::Method;
    use crate::producer::memory::MemoryProducer;

    fn key(path: &str) -> Key {
        Key {
            src_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            src_port: 1000,
            dst_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dst_port: 80,
            path: path.to_string(),
            full_path: true,
            method: Method::Get,
        }
    }

    #[test]
    fn test_summarize_orders_by_count() {
        let mut stats = HashMap::new();
        for (path, n, status) in [("/a", 3, 200), ("/b", 7, 503), ("/c", 1, 200)] {
            let mut value = RequestStats::default();
            for _ in 0..n {
                value.add_request(status, 1_000, 0);
            }
            stats.insert(key(path), value);
        }

        let summary = summarize(&stats);
        assert_eq!(summary.requests, 11);
        assert_eq!(summary.server_errors, 7);
        let top: Vec<&str> = summary.top.iter().map(|(k, _)| k.path.as_str()).collect();
        assert_eq!(top, vec!["/b", "/a", "/c"]);
    }

    #[test]
    fn test_combined_folds_every_key() {
        let mut stats = HashMap::new();
        for (path, status) in [("/a", 200), ("/b", 200), ("/c", 404)] {
            let mut value = RequestStats::default();
            value.add_request(status, 2_000, 0);
            stats.insert(key(path), value);
        }

        let totals = combined(&stats);
        assert_eq!(totals.total_count(), 3);
        let classes: Vec<(u16, u64)> = totals.iter().map(|(c, s)| (c, s.count)).collect();
        assert_eq!(classes, vec![(200, 2), (400, 1)]);
    }

    #[tokio::test]
    async fn test_agent_start_stop() {
        let mut cfg = Config::default();
        cfg.health.addr = "127.0.0.1:0".to_string();

        let mut agent = Agent::new(cfg, MemoryProducer::new(2, 16)).unwrap();
        agent.start().await.unwrap();
        assert!(!agent.monitor().is_stopped());
        agent.stop().await.unwrap();
        assert!(agent.monitor().is_stopped());
    }
}
