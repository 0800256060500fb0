//! In-process producer backed by plain memory.
//!
//! Mirrors the kernel program's batching: each CPU fills batch `idx` in
//! slot `idx % 3`, rings a doorbell when the batch is full, then moves on
//! to `idx + 1`, overwriting whatever that slot held. Used by the test
//! suites and benchmarks, and handy for exercising the pipeline on hosts
//! without BPF support.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Producer, ProducerChannels};
use crate::http::batch::BatchStorage;
use crate::http::error::StorageError;
use crate::http::types::{
    BatchKey, BatchNotification, HttpBatch, HttpTransaction, LostNotification, HTTP_BATCH_SIZE,
};

struct Shared {
    slots: HashMap<BatchKey, HttpBatch>,
    /// Batch idx each CPU is currently writing.
    writing: Vec<u64>,
    notify_tx: Option<mpsc::Sender<BatchNotification>>,
    lost_tx: Option<mpsc::Sender<LostNotification>>,
    running: bool,
    doorbells: bool,
    fail_reads: bool,
}

impl Shared {
    fn ring(&self, cpu: u32, idx: u64) {
        if !self.running {
            return;
        }
        let Some(notify_tx) = &self.notify_tx else {
            return;
        };
        if self.doorbells && notify_tx.try_send(BatchNotification { cpu, idx }).is_ok() {
            return;
        }
        if let Some(lost_tx) = &self.lost_tx {
            // A full lost queue drops the signal entirely.
            let _ = lost_tx.try_send(LostNotification { cpu });
        }
    }
}

/// Producer writing batches into a shared in-memory map.
pub struct MemoryProducer {
    shared: Arc<Mutex<Shared>>,
    num_cpus: usize,
    queue_size: usize,
}

/// Write side of a [`MemoryProducer`], usable after the producer has been
/// handed to a monitor.
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryProducer {
    pub fn new(num_cpus: usize, queue_size: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                slots: HashMap::new(),
                writing: vec![0; num_cpus],
                notify_tx: None,
                lost_tx: None,
                running: false,
                doorbells: true,
                fail_reads: false,
            })),
            num_cpus,
            queue_size,
        }
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Producer for MemoryProducer {
    fn open(&mut self) -> Result<ProducerChannels> {
        if self.num_cpus == 0 {
            bail!("memory producer configured with zero cpus");
        }

        let mut shared = self.shared.lock();
        if shared.notify_tx.is_some() {
            bail!("memory producer already opened");
        }

        let (notify_tx, notifications) = mpsc::channel(self.queue_size);
        let (lost_tx, lost) = mpsc::channel(self.queue_size);
        shared.notify_tx = Some(notify_tx);
        shared.lost_tx = Some(lost_tx);

        Ok(ProducerChannels {
            storage: Box::new(MemoryStorage {
                shared: Arc::clone(&self.shared),
            }),
            notifications,
            lost,
            num_cpus: self.num_cpus,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.shared.lock().running = true;
        info!(num_cpus = self.num_cpus, "memory producer started");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.running = false;
        shared.notify_tx = None;
        shared.lost_tx = None;
        debug!("memory producer closed");
        Ok(())
    }
}

impl MemoryHandle {
    /// Commit one transaction to `cpu`'s current batch, ringing the doorbell
    /// when the batch fills up.
    pub fn push(&self, cpu: u32, tx: HttpTransaction) {
        let mut shared = self.shared.lock();
        let Some(&idx) = shared.writing.get(cpu as usize) else {
            return;
        };

        let key = BatchKey::new(cpu, idx);
        let batch = shared.slots.entry(key).or_insert_with(|| HttpBatch {
            idx,
            pos: 0,
            txs: vec![HttpTransaction::default(); HTTP_BATCH_SIZE],
        });
        if batch.idx != idx {
            *batch = HttpBatch {
                idx,
                pos: 0,
                txs: vec![HttpTransaction::default(); HTTP_BATCH_SIZE],
            };
        }

        batch.txs[usize::from(batch.pos)] = tx;
        batch.pos += 1;

        if usize::from(batch.pos) == HTTP_BATCH_SIZE {
            shared.writing[cpu as usize] = idx + 1;
            shared.ring(cpu, idx);
        }
    }

    /// When disabled, full batches report a lost notification instead of a
    /// doorbell.
    pub fn set_doorbells(&self, enabled: bool) {
        self.shared.lock().doorbells = enabled;
    }

    /// Make every storage read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.shared.lock().fail_reads = fail;
    }

    /// Send a raw doorbell regardless of batch state.
    pub fn notify(&self, cpu: u32, idx: u64) -> bool {
        let shared = self.shared.lock();
        shared
            .notify_tx
            .as_ref()
            .is_some_and(|tx| tx.try_send(BatchNotification { cpu, idx }).is_ok())
    }

    /// Batch idx `cpu` is currently filling.
    pub fn writing_idx(&self, cpu: u32) -> Option<u64> {
        self.shared.lock().writing.get(cpu as usize).copied()
    }
}

struct MemoryStorage {
    shared: Arc<Mutex<Shared>>,
}

impl BatchStorage for MemoryStorage {
    fn lookup(&self, key: BatchKey) -> Result<HttpBatch, StorageError> {
        let shared = self.shared.lock();
        if shared.fail_reads {
            return Err(StorageError::Read("injected read failure".to_string()));
        }
        shared
            .slots
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound {
                cpu: key.cpu,
                num: key.num,
            })
    }

    fn dump(&self) -> Result<String> {
        let shared = self.shared.lock();
        let mut keys: Vec<&BatchKey> = shared.slots.keys().collect();
        keys.sort_by_key(|k| (k.cpu, k.num));

        let mut out = String::new();
        for key in keys {
            if let Some(batch) = shared.slots.get(key) {
                writeln!(
                    out,
                    "cpu={} num={} idx={} pos={}",
                    key.cpu, key.num, batch.idx, batch.pos
                )?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tx(seq: u32) -> HttpTransaction {
        HttpTransaction {
            tcp_seq: seq,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_batch_rings_doorbell() {
        let mut producer = MemoryProducer::new(2, 8);
        let handle = producer.handle();
        let mut channels = producer.open().unwrap();
        producer.start().unwrap();

        for seq in 0..HTTP_BATCH_SIZE as u32 {
            handle.push(1, tx(seq));
        }
        assert_eq!(
            channels.notifications.try_recv().unwrap(),
            BatchNotification { cpu: 1, idx: 0 }
        );
        assert_eq!(handle.writing_idx(1), Some(1));

        let batch = channels.storage.lookup(BatchKey::new(1, 0)).unwrap();
        assert_eq!(usize::from(batch.pos), HTTP_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_disabled_doorbells_report_lost() {
        let mut producer = MemoryProducer::new(1, 8);
        let handle = producer.handle();
        let mut channels = producer.open().unwrap();
        producer.start().unwrap();
        handle.set_doorbells(false);

        for seq in 0..HTTP_BATCH_SIZE as u32 {
            handle.push(0, tx(seq));
        }
        assert!(channels.notifications.try_recv().is_err());
        assert_eq!(
            channels.lost.try_recv().unwrap(),
            LostNotification { cpu: 0 }
        );
    }

    #[tokio::test]
    async fn test_slot_reuse_overwrites() {
        let mut producer = MemoryProducer::new(1, 64);
        let handle = producer.handle();
        let channels = producer.open().unwrap();

        for seq in 0..(4 * HTTP_BATCH_SIZE as u32) {
            handle.push(0, tx(seq));
        }
        // idx 3 now lives in slot 0.
        let batch = channels.storage.lookup(BatchKey::new(0, 0)).unwrap();
        assert_eq!(batch.idx, 3);
        assert!(channels.storage.dump().unwrap().contains("idx=3"));
    }

    #[tokio::test]
    async fn test_close_closes_channels() {
        let mut producer = MemoryProducer::new(1, 8);
        let mut channels = producer.open().unwrap();
        producer.start().unwrap();
        producer.close().await.unwrap();
        assert!(channels.notifications.recv().await.is_none());
        assert!(channels.lost.recv().await.is_none());
        assert!(producer.open().is_ok());
    }
}
