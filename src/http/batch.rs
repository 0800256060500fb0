//! Per-CPU delivery cursors over cyclic batch storage.
//!
//! The kernel program fills batch `idx` in physical slot `idx % P` on each
//! CPU and rings a doorbell when it is full. Slots are reused, so freshness
//! is always decided by comparing the stored `idx` against the expected one.
//!
//! A cursor `(idx, pos)` records how far the CPU has been delivered:
//! records `[0, pos)` of batch `idx` and every batch below `idx` have been
//! emitted. `pos == HTTP_BATCH_SIZE` marks the batch closed.

use tracing::{debug, trace};

use super::error::{BatchError, MonitorError, StorageError};
use super::types::{BatchKey, BatchNotification, HttpBatch, HttpTransaction, HTTP_BATCH_SIZE};

/// Read access to the shared batch storage.
pub trait BatchStorage: Send + 'static {
    /// Read the batch currently held in the slot named by `key`.
    fn lookup(&self, key: BatchKey) -> Result<HttpBatch, StorageError>;

    /// Human-readable rendering of the storage contents.
    fn dump(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    idx: u64,
    pos: usize,
}

impl Cursor {
    fn is_closed(&self) -> bool {
        self.pos >= HTTP_BATCH_SIZE
    }
}

/// Turns doorbells and live polls into a deduplicated record stream.
pub struct BatchManager {
    storage: Box<dyn BatchStorage>,
    cursors: Vec<Cursor>,
    read_failures: u64,
}

impl BatchManager {
    /// Creates a manager with one empty cursor per CPU.
    pub fn new(storage: Box<dyn BatchStorage>, num_cpus: usize) -> Result<Self, MonitorError> {
        if num_cpus == 0 {
            return Err(MonitorError::StorageUnavailable(
                "storage reports zero cpus".to_string(),
            ));
        }

        Ok(Self {
            storage,
            cursors: vec![Cursor::default(); num_cpus],
            read_failures: 0,
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.cursors.len()
    }

    /// Records of the batch named by a doorbell that have not been emitted yet.
    ///
    /// On success the batch is closed for its CPU. An idx mismatch means the
    /// slot was overwritten before the doorbell was handled: nothing is
    /// emitted and the cursor skips past the lost batch.
    pub fn get_transactions_from(
        &mut self,
        notification: BatchNotification,
    ) -> Result<Vec<HttpTransaction>, BatchError> {
        let num_cpus = self.cursors.len();
        let BatchNotification { cpu, idx } = notification;
        let cursor = self
            .cursors
            .get_mut(cpu as usize)
            .ok_or(BatchError::UnknownCpu { cpu, num_cpus })?;

        if idx < cursor.idx || (idx == cursor.idx && cursor.is_closed()) {
            trace!(cpu, idx, cursor_idx = cursor.idx, "batch already delivered");
            return Ok(Vec::new());
        }

        let batch = self
            .storage
            .lookup(BatchKey::new(cpu, idx))
            .map_err(|source| BatchError::Storage { cpu, idx, source })?;

        if batch.idx != idx {
            *cursor = Cursor {
                idx,
                pos: HTTP_BATCH_SIZE,
            };
            return Err(BatchError::MissedBatch {
                cpu,
                expected: idx,
                found: batch.idx,
            });
        }

        let offset = if cursor.idx == idx { cursor.pos } else { 0 };
        let records = slice_range(&batch, offset);

        *cursor = Cursor {
            idx,
            pos: HTTP_BATCH_SIZE,
        };

        Ok(records)
    }

    /// Records committed to in-flight batches since the last delivery, for
    /// every CPU, without waiting for doorbells.
    ///
    /// Full batches are closed and the walk continues with the next idx, so a
    /// CPU whose doorbells were lost still catches up here.
    pub fn get_pending_transactions(&mut self) -> Vec<HttpTransaction> {
        let mut out = Vec::new();

        for (cpu, cursor) in self.cursors.iter_mut().enumerate() {
            let cpu = cpu as u32;

            loop {
                let (idx, from) = if cursor.is_closed() {
                    (cursor.idx + 1, 0)
                } else {
                    (cursor.idx, cursor.pos)
                };

                let batch = match self.storage.lookup(BatchKey::new(cpu, idx)) {
                    Ok(batch) => batch,
                    Err(StorageError::NotFound { .. }) => break,
                    Err(e) => {
                        self.read_failures += 1;
                        debug!(cpu, idx, error = %e, "pending batch read failed");
                        break;
                    }
                };

                if batch.idx != idx {
                    break;
                }

                let live = usize::from(batch.pos).min(HTTP_BATCH_SIZE);
                if live <= from {
                    break;
                }

                out.extend(slice_range(&batch, from));
                *cursor = Cursor { idx, pos: live };

                if !cursor.is_closed() {
                    break;
                }
            }
        }

        out
    }

    /// Pending-read failures since the previous call.
    pub fn take_read_failures(&mut self) -> u64 {
        std::mem::take(&mut self.read_failures)
    }

    pub fn dump(&self) -> anyhow::Result<String> {
        self.storage.dump()
    }

    /// One `cpu=N idx=N pos=N` line per CPU.
    pub fn describe_cursors(&self) -> String {
        self.cursors
            .iter()
            .enumerate()
            .map(|(cpu, c)| format!("cpu={cpu} idx={} pos={}\n", c.idx, c.pos))
            .collect()
    }
}

fn slice_range(batch: &HttpBatch, from: usize) -> Vec<HttpTransaction> {
    let committed = batch.committed();
    committed[from.min(committed.len())..].to_vec()
}
