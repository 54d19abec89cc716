pub mod models;
pub mod scheduler;
pub mod simulator;

pub use models::{
    compute_duration, RunDuration, SnrRange, TestRecord, TestRequest, TestStatus, TestSubmission,
    ValidatedSubmission, ValidationError,
};
pub use scheduler::{Executor, QueueClosed, QueueHandle, QueueSettings, QueueSnapshot, TestQueue};
pub use simulator::Simulator;

/// Why a run ended in the Failed state
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("start command rejected: {0}")]
    Command(#[from] crate::serial::protocol::ProtocolError),

    #[error("results file error: {0}")]
    Sink(#[from] crate::results::SinkError),

    #[error("no completion from the device within {0:?}")]
    Timeout(std::time::Duration),

    #[error("store update failed: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("queue shut down while the run was active")]
    Shutdown,
}
