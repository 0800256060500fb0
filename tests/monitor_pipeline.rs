use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use httpscope::config::{HttpConfig, ReplaceRule};
use httpscope::http::batch::BatchStorage;
use httpscope::http::parse::{encode_batch, parse_batch};
use httpscope::http::types::{
    BatchKey, BatchNotification, ConnTuple, HttpBatch, HttpTransaction, LostNotification, Method,
    HTTP_BATCH_SIZE,
};
use httpscope::http::{Key, Monitor, RequestStats, StorageError};
use httpscope::producer::memory::MemoryProducer;
use httpscope::producer::{Producer, ProducerChannels};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tx(path: &str, method: Method, status: u16, seq: u32) -> HttpTransaction {
    let mut tx = HttpTransaction {
        tup: ConnTuple {
            saddr_l: u64::from(u32::from_le_bytes([10, 1, 0, 1])),
            daddr_l: u64::from(u32::from_le_bytes([10, 1, 0, 2])),
            sport: 51_000,
            dport: 8080,
            metadata: 1,
            ..Default::default()
        },
        request_started: 1_000_000,
        request_method: method as u8,
        response_status_code: status,
        response_last_seen: 1_250_000,
        tcp_seq: seq,
        ..Default::default()
    };
    let fragment = format!("{} {path} HTTP/1.1\r\nHost: svc\r\n", method.as_str());
    tx.request_fragment[..fragment.len()].copy_from_slice(fragment.as_bytes());
    tx
}

fn get(path: &str, seq: u32) -> HttpTransaction {
    tx(path, Method::Get, 200, seq)
}

fn total(stats: &HashMap<Key, RequestStats>) -> u64 {
    stats.values().map(RequestStats::total_count).sum()
}

fn count_for(stats: &HashMap<Key, RequestStats>, path: &str) -> u64 {
    stats
        .iter()
        .filter(|(k, _)| k.path == path)
        .map(|(_, v)| v.total_count())
        .sum()
}

/// Producer whose storage holds raw wire-format batches, so every read goes
/// through the decoder. Batches and doorbells are placed by hand.
#[derive(Clone, Default)]
struct WireProducer {
    slots: Arc<Mutex<HashMap<BatchKey, Vec<u8>>>>,
    senders: Arc<Mutex<Option<(mpsc::Sender<BatchNotification>, mpsc::Sender<LostNotification>)>>>,
    closes: Arc<AtomicUsize>,
}

impl WireProducer {
    fn put(&self, cpu: u32, idx: u64, records: &[HttpTransaction]) {
        let mut txs = records.to_vec();
        txs.resize(HTTP_BATCH_SIZE, HttpTransaction::default());
        let batch = HttpBatch {
            idx,
            pos: records.len() as u8,
            txs,
        };
        self.slots
            .lock()
            .insert(BatchKey::new(cpu, idx), encode_batch(&batch));
    }

    async fn doorbell(&self, cpu: u32, idx: u64) {
        let tx = self.senders.lock().as_ref().map(|(n, _)| n.clone()).unwrap();
        tx.send(BatchNotification { cpu, idx }).await.unwrap();
    }
}

struct WireStorage {
    slots: Arc<Mutex<HashMap<BatchKey, Vec<u8>>>>,
}

impl BatchStorage for WireStorage {
    fn lookup(&self, key: BatchKey) -> Result<HttpBatch, StorageError> {
        let slots = self.slots.lock();
        let raw = slots.get(&key).ok_or(StorageError::NotFound {
            cpu: key.cpu,
            num: key.num,
        })?;
        Ok(parse_batch(raw)?)
    }

    fn dump(&self) -> Result<String> {
        Ok(format!("{} slots", self.slots.lock().len()))
    }
}

impl Producer for WireProducer {
    fn open(&mut self) -> Result<ProducerChannels> {
        let (notify_tx, notifications) = mpsc::channel(64);
        let (lost_tx, lost) = mpsc::channel(64);
        *self.senders.lock() = Some((notify_tx, lost_tx));
        Ok(ProducerChannels {
            storage: Box::new(WireStorage {
                slots: Arc::clone(&self.slots),
            }),
            notifications,
            lost,
            num_cpus: 2,
        })
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.senders.lock() = None;
        Ok(())
    }
}

async fn wire_monitor() -> (Monitor<WireProducer>, WireProducer) {
    let producer = WireProducer::default();
    let monitor = Monitor::new(&HttpConfig::default(), producer.clone()).unwrap();
    monitor.start().await.unwrap();
    (monitor, producer)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_doorbell_delivers_exactly_committed_records() {
    let (monitor, producer) = wire_monitor().await;
    producer.put(
        0,
        5,
        &[get("/one", 1), get("/two", 2), get("/three", 3)],
    );
    producer.doorbell(0, 5).await;

    let stats = monitor.get_http_stats().await;
    assert_eq!(total(&stats), 3);
    assert_eq!(count_for(&stats, "/two"), 1);

    // Same idx, nothing new committed.
    assert!(monitor.get_http_stats().await.is_empty());
    monitor.stop().await;
}

#[tokio::test]
async fn test_query_includes_half_full_batch() {
    let producer = MemoryProducer::new(2, 64);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    // Batches 0..=6 fill up and ring doorbells, drained as they go.
    let mut seq = 0u32;
    for _ in 0..7 {
        for _ in 0..HTTP_BATCH_SIZE {
            handle.push(1, get("/hot", seq));
            seq += 1;
        }
        assert_eq!(
            count_for(&monitor.get_http_stats().await, "/hot"),
            HTTP_BATCH_SIZE as u64
        );
    }

    // Batch 7 stops at 8 records and never rings.
    for _ in 0..8 {
        handle.push(1, get("/hot", seq));
        seq += 1;
    }
    assert_eq!(handle.writing_idx(1), Some(7));

    let stats = monitor.get_http_stats().await;
    assert_eq!(count_for(&stats, "/hot"), 8);
    assert!(monitor.get_http_stats().await.is_empty());
    monitor.stop().await;
}

#[tokio::test]
async fn test_overwritten_slot_counts_missed_batch() {
    let (monitor, producer) = wire_monitor().await;
    // idx 1 was overwritten by idx 4 (same slot) before its doorbell was read.
    producer.put(0, 4, &[get("/late", 1), get("/late", 2)]);
    producer.doorbell(0, 1).await;

    let stats = monitor.query().await;
    assert_eq!(stats.telemetry.delta.missed_batch, 1);
    assert_eq!(total(&stats.requests), 0);

    // The overwriting batch is still delivered by its own doorbell.
    producer.doorbell(0, 4).await;
    assert_eq!(count_for(&monitor.get_http_stats().await, "/late"), 2);
    monitor.stop().await;
}

#[tokio::test]
async fn test_unknown_cpu_is_absorbed() {
    let (monitor, producer) = wire_monitor().await;
    producer.doorbell(9, 0).await;

    let stats = monitor.query().await;
    assert_eq!(stats.telemetry.delta.unknown_cpu, 1);
    assert!(stats.requests.is_empty());
    monitor.stop().await;
}

#[tokio::test]
async fn test_drain_isolation() {
    let producer = MemoryProducer::new(1, 64);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    for seq in 0..20 {
        handle.push(0, tx("/x", Method::Post, 201, seq));
    }
    let first = monitor.get_http_stats().await;
    assert_eq!(total(&first), 20);

    let second = monitor.get_http_stats().await;
    for key in first.keys() {
        assert_eq!(second.get(key).map_or(0, RequestStats::total_count), 0);
    }
    monitor.stop().await;
}

#[tokio::test]
async fn test_no_double_counting_with_interleaved_queries() {
    let producer = MemoryProducer::new(4, 256);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    // Deterministic pseudo-random schedule.
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let mut pushed = 0u64;
    let mut seen = 0u64;
    for seq in 0..2_000u32 {
        let cpu = (next() % 4) as u32;
        handle.push(cpu, get("/mix", seq));
        pushed += 1;
        // Queries at least every 30 pushes so no CPU laps its slots.
        if next() % 37 == 0 || seq % 30 == 29 {
            seen += total(&monitor.get_http_stats().await);
        }
    }
    seen += total(&monitor.get_http_stats().await);

    assert_eq!(seen, pushed);
    monitor.stop().await;
}

#[tokio::test]
async fn test_lost_notifications_and_telemetry_report() {
    let producer = MemoryProducer::new(1, 64);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    handle.set_doorbells(false);
    for seq in 0..(2 * HTTP_BATCH_SIZE) as u32 {
        handle.push(0, tx("/err", Method::Get, 503, seq));
    }

    let stats = monitor.query().await;
    assert_eq!(stats.telemetry.delta.lost_batch, 2);
    assert_eq!(total(&stats.requests), (2 * HTTP_BATCH_SIZE) as u64);

    let report = monitor.get_stats().await;
    assert_eq!(report["errors.lost_batch"], Value::from(2u64));
    assert_eq!(report["misses"], Value::from(2u64));
    assert_eq!(
        report["hits5XX"],
        Value::from((2 * HTTP_BATCH_SIZE) as u64)
    );
    monitor.stop().await;
}

#[tokio::test]
async fn test_storage_failures_recover() {
    let producer = MemoryProducer::new(1, 64);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    for seq in 0..5 {
        handle.push(0, get("/r", seq));
    }
    handle.set_fail_reads(true);
    let failed = monitor.query().await;
    assert!(failed.requests.is_empty());
    assert_eq!(failed.telemetry.delta.storage_read, 1);

    handle.set_fail_reads(false);
    assert_eq!(total(&monitor.get_http_stats().await), 5);
    monitor.stop().await;
}

#[tokio::test]
async fn test_replace_rules_and_limits_apply() {
    let cfg = HttpConfig {
        max_stats_buffered: 2,
        replace_rules: vec![
            ReplaceRule {
                pattern: "/orders/[0-9]+".to_string(),
                repl: "/orders/:id".to_string(),
            },
            ReplaceRule {
                pattern: "^/metrics".to_string(),
                repl: String::new(),
            },
        ],
        ..Default::default()
    };
    let producer = MemoryProducer::new(1, 64);
    let handle = producer.handle();
    let monitor = Monitor::new(&cfg, producer).unwrap();
    monitor.start().await.unwrap();

    handle.push(0, get("/orders/1", 1));
    handle.push(0, get("/orders/2", 2));
    handle.push(0, get("/metrics", 3));
    handle.push(0, get("/a", 4));
    handle.push(0, get("/b", 5));

    let stats = monitor.query().await;
    assert_eq!(count_for(&stats.requests, "/orders/:id"), 2);
    assert_eq!(stats.requests.len(), 2);
    assert_eq!(stats.telemetry.delta.rejected, 1);
    assert_eq!(stats.telemetry.delta.dropped, 1);
    monitor.stop().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_double_stop() {
    let (monitor, producer) = wire_monitor().await;
    let monitor = Arc::new(monitor);

    let a = Arc::clone(&monitor);
    let b = Arc::clone(&monitor);
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.stop().await }),
        tokio::spawn(async move { b.stop().await }),
    );
    first.unwrap();
    second.unwrap();
    assert!(monitor.is_stopped());
    // Only the first stop reaches the producer.
    assert_eq!(producer.closes.load(Ordering::SeqCst), 1);

    monitor.stop().await;
    assert_eq!(producer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queries_after_stop_are_empty() {
    let producer = MemoryProducer::new(1, 16);
    let handle = producer.handle();
    let monitor = Monitor::new(&HttpConfig::default(), producer).unwrap();
    monitor.start().await.unwrap();

    handle.push(0, get("/before", 1));
    assert_eq!(total(&monitor.get_http_stats().await), 1);
    assert_eq!(monitor.get_stats().await["decoded"], Value::from(1u64));
    monitor.stop().await;

    handle.push(0, get("/after", 2));
    assert!(monitor.get_http_stats().await.is_empty());
    assert!(monitor.dump_maps(&[]).await.is_err());
    assert!(monitor.get_stats().await.is_empty());
    monitor.stop().await;
    assert!(monitor.get_stats().await.is_empty());
}
