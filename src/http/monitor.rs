//! Control loop and public facade of the HTTP pipeline.
//!
//! A single tokio task owns the [`BatchManager`], the [`StatKeeper`] and the
//! [`Telemetry`]. Doorbells, lost notifications and queries all reach it
//! through channels and are handled one at a time, so none of that state is
//! ever shared.
//!
//! A query is linearized with the loop: doorbells already queued when it is
//! serviced are processed first, then in-flight batches are polled, then the
//! aggregates are drained.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::batch::BatchManager;
use super::error::MonitorError;
use super::statkeeper::{Key, StatKeeper};
use super::stats::RequestStats;
use super::telemetry::{Telemetry, TelemetrySnapshot};
use super::types::{BatchNotification, LostNotification};
use crate::config::HttpConfig;
use crate::producer::Producer;

/// Diagnostic name of the batch storage.
pub const MAP_HTTP_BATCHES: &str = "http_batches";
/// Diagnostic name of the per-CPU delivery cursors.
pub const MAP_HTTP_CURSORS: &str = "http_cursors";

const REQUEST_QUEUE_SIZE: usize = 16;

/// Result of one stats query.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub requests: HashMap<Key, RequestStats>,
    pub telemetry: TelemetrySnapshot,
}

enum Request {
    Stats(oneshot::Sender<MonitorStats>),
    Dump {
        names: Vec<String>,
        reply: oneshot::Sender<Result<String>>,
    },
}

/// State owned by the control loop.
struct Worker {
    batches: BatchManager,
    statkeeper: StatKeeper,
    telemetry: Telemetry,
    notifications: mpsc::Receiver<BatchNotification>,
    lost: mpsc::Receiver<LostNotification>,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                notification = self.notifications.recv() => match notification {
                    Some(n) => self.on_notification(n),
                    None => break,
                },
                lost = self.lost.recv() => match lost {
                    Some(l) => self.on_lost(l),
                    None => break,
                },
                request = requests.recv() => match request {
                    Some(r) => self.on_request(r),
                    None => break,
                },
            }
        }

        debug!("http monitor loop exited");
    }

    fn on_notification(&mut self, notification: BatchNotification) {
        match self.batches.get_transactions_from(notification) {
            Ok(records) => {
                self.telemetry.aggregate(&records, None);
                self.statkeeper.process(records, &mut self.telemetry);
            }
            Err(e) => {
                debug!(
                    cpu = notification.cpu,
                    idx = notification.idx,
                    error = %e,
                    "batch notification not delivered"
                );
                self.telemetry.aggregate(&[], Some(&e));
            }
        }
    }

    fn on_lost(&mut self, lost: LostNotification) {
        debug!(cpu = lost.cpu, "lost batch notification");
        self.telemetry.lost_batch();
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Stats(reply) => {
                let stats = self.collect();
                if reply.send(stats).is_err() {
                    debug!("stats requester went away");
                }
            }
            Request::Dump { names, reply } => {
                let _ = reply.send(self.dump(&names));
            }
        }
    }

    /// Doorbells queued before the query was received are handled first.
    fn drain_queued(&mut self) {
        while let Ok(notification) = self.notifications.try_recv() {
            self.on_notification(notification);
        }
        while let Ok(lost) = self.lost.try_recv() {
            self.on_lost(lost);
        }
    }

    fn collect(&mut self) -> MonitorStats {
        self.drain_queued();

        let pending = self.batches.get_pending_transactions();
        let failures = self.batches.take_read_failures();
        self.telemetry.storage_read_failures(failures);
        self.telemetry.aggregate(&pending, None);
        self.statkeeper.process(pending, &mut self.telemetry);

        let requests = self.statkeeper.get_and_reset_all_stats(&mut self.telemetry);
        let telemetry = self.telemetry.reset();
        MonitorStats {
            requests,
            telemetry,
        }
    }

    fn dump(&self, names: &[String]) -> Result<String> {
        let all = [MAP_HTTP_BATCHES.to_string(), MAP_HTTP_CURSORS.to_string()];
        let names = if names.is_empty() { &all[..] } else { names };

        let mut out = String::new();
        for name in names {
            out.push_str(&format!("map: {name}\n"));
            match name.as_str() {
                MAP_HTTP_BATCHES => out.push_str(&self.batches.dump()?),
                MAP_HTTP_CURSORS => out.push_str(&self.batches.describe_cursors()),
                other => return Err(anyhow!("unknown map {other:?}")),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

struct State<P> {
    phase: Phase,
    producer: P,
    worker: Option<Worker>,
    requests: Option<mpsc::Sender<Request>>,
    handle: Option<JoinHandle<()>>,
    last_telemetry: TelemetrySnapshot,
}

/// Thread-safe facade over the HTTP control loop.
pub struct Monitor<P: Producer> {
    state: tokio::sync::Mutex<State<P>>,
    stopped: AtomicBool,
}

impl<P: Producer> Monitor<P> {
    /// Open the producer's storage and build the pipeline. Nothing runs
    /// until [`Monitor::start`].
    pub fn new(cfg: &HttpConfig, mut producer: P) -> Result<Self, MonitorError> {
        let channels = producer
            .open()
            .map_err(|e| MonitorError::StorageUnavailable(format!("{e:#}")))?;

        let batches = BatchManager::new(channels.storage, channels.num_cpus)?;
        let statkeeper = StatKeeper::new(cfg).map_err(|e| MonitorError::Config(e.into()))?;

        let worker = Worker {
            batches,
            statkeeper,
            telemetry: Telemetry::new(),
            notifications: channels.notifications,
            lost: channels.lost,
        };

        Ok(Self {
            state: tokio::sync::Mutex::new(State {
                phase: Phase::Created,
                producer,
                worker: Some(worker),
                requests: None,
                handle: None,
                last_telemetry: TelemetrySnapshot::default(),
            }),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the producer and spawn the control loop.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Running => return Err(MonitorError::AlreadyStarted),
            Phase::Stopped => return Err(MonitorError::Stopped),
            Phase::Created => {}
        }

        state
            .producer
            .start()
            .map_err(|e| MonitorError::Producer(e.into()))?;
        let worker = state.worker.take().ok_or(MonitorError::AlreadyStarted)?;

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let num_cpus = worker.batches.num_cpus();
        state.handle = Some(tokio::spawn(worker.run(requests_rx)));
        state.requests = Some(requests_tx);
        state.phase = Phase::Running;

        info!(num_cpus, "http monitor started");
        Ok(())
    }

    /// Graceful shutdown. Safe to call more than once and concurrently; only
    /// the first call does any work.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Stopped {
            return;
        }

        if let Err(e) = state.producer.close().await {
            warn!(error = %e, "closing producer");
        }

        state.requests = None;
        state.worker = None;
        if let Some(handle) = state.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "http monitor loop panicked");
            }
        }

        state.last_telemetry = TelemetrySnapshot::default();
        state.phase = Phase::Stopped;
        self.stopped.store(true, Ordering::Release);
        info!("http monitor stopped");
    }

    /// Drain aggregated stats and the telemetry delta since the previous
    /// query. Empty when the monitor is not running.
    pub async fn query(&self) -> MonitorStats {
        let mut state = self.state.lock().await;
        let Some(requests) = state.requests.as_ref() else {
            return MonitorStats::default();
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if requests.send(Request::Stats(reply_tx)).await.is_err() {
            return MonitorStats::default();
        }

        match reply_rx.await {
            Ok(stats) => {
                state.last_telemetry = stats.telemetry;
                stats
            }
            Err(_) => MonitorStats::default(),
        }
    }

    /// Snapshot-and-clear of the per-key statistics.
    pub async fn get_http_stats(&self) -> HashMap<Key, RequestStats> {
        self.query().await.requests
    }

    /// Telemetry delta computed by the most recent query, rendered. Empty
    /// once the monitor is stopped.
    pub async fn get_stats(&self) -> BTreeMap<String, Value> {
        let state = self.state.lock().await;
        if state.phase == Phase::Stopped {
            return BTreeMap::new();
        }
        state.last_telemetry.report()
    }

    /// Best-effort text rendering of the named internal maps. All maps are
    /// dumped when `names` is empty.
    pub async fn dump_maps(&self, names: &[&str]) -> Result<String> {
        let state = self.state.lock().await;
        let requests = state.requests.as_ref().ok_or(MonitorError::Stopped)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(Request::Dump {
                names: names.iter().map(|n| n.to_string()).collect(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| MonitorError::Stopped)?;

        reply_rx.await.map_err(|_| MonitorError::Stopped)?
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
