pub mod batch;
pub mod error;
pub mod incomplete;
pub mod monitor;
pub mod parse;
pub mod statkeeper;
pub mod stats;
pub mod telemetry;
pub mod types;

pub use self::error::{BatchError, MonitorError, StorageError};
pub use self::monitor::{Monitor, MonitorStats};
pub use self::statkeeper::Key;
pub use self::stats::RequestStats;
