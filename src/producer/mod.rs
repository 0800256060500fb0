pub mod memory;

#[cfg(feature = "bpf")]
pub mod bpf;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::http::batch::BatchStorage;
use crate::http::types::{BatchNotification, LostNotification};

/// Everything the control loop needs from an opened producer.
pub struct ProducerChannels {
    /// Shared per-CPU batch storage.
    pub storage: Box<dyn BatchStorage>,
    /// Doorbells for batches that became ready.
    pub notifications: mpsc::Receiver<BatchNotification>,
    /// Notifications dropped before delivery.
    pub lost: mpsc::Receiver<LostNotification>,
    /// Number of per-CPU batch rings in the storage.
    pub num_cpus: usize,
}

/// Producer is the kernel-side writer of HTTP transaction batches.
///
/// Both notification channels must close once `close` has returned, which
/// is how the control loop learns there is no more work.
pub trait Producer: Send + 'static {
    /// Open the batch storage and notification channels. Called once.
    fn open(&mut self) -> Result<ProducerChannels>;

    /// Begin emitting notifications.
    fn start(&mut self) -> Result<()>;

    /// Stop emitting notifications and close both channels.
    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
