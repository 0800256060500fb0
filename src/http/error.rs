use thiserror::Error;

use super::parse::ParseError;

/// Failure reading a slot of the batch storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no batch at cpu {cpu} slot {num}")]
    NotFound { cpu: u32, num: u32 },

    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage value could not be decoded: {0}")]
    Decode(#[from] ParseError),
}

/// Transient failure turning a notification into records. Absorbed into
/// telemetry, never fatal to the control loop.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("missed batch on cpu {cpu}: expected idx {expected}, slot holds idx {found}")]
    MissedBatch { cpu: u32, expected: u64, found: u64 },

    #[error("reading batch {idx} on cpu {cpu}: {source}")]
    Storage {
        cpu: u32,
        idx: u64,
        #[source]
        source: StorageError,
    },

    #[error("notification for unknown cpu {cpu} (have {num_cpus})")]
    UnknownCpu { cpu: u32, num_cpus: usize },
}

impl BatchError {
    /// Telemetry label for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissedBatch { .. } => "missed_batch",
            Self::Storage { .. } => "storage_read",
            Self::UnknownCpu { .. } => "unknown_cpu",
        }
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the monitor facade.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("batch storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("monitor already started")]
    AlreadyStarted,

    #[error("monitor stopped")]
    Stopped,

    #[error("producer: {0}")]
    Producer(#[source] BoxError),

    #[error("invalid configuration: {0}")]
    Config(#[source] BoxError),
}
