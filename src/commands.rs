use std::path::PathBuf;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::watch;

use crate::device::DeviceState;
use crate::queue::{QueueHandle, QueueSnapshot, TestRecord, TestRequest, TestSubmission};
use crate::results::{write_run_config, RunConfig};
use crate::serial::{ConnectionState, DeviceProtocol};
use crate::store::TestStore;

/// Shared handles the command surface operates on
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn TestStore>,
    pub queue: QueueHandle,
    pub tests_root: PathBuf,
    /// Present only when running against hardware
    pub protocol: Option<DeviceProtocol>,
    pub device_state: Option<watch::Receiver<DeviceState>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusReport {
    pub use_hardware: bool,
    pub connection: Option<ConnectionState>,
    pub device: Option<DeviceState>,
}

/// Validate a submission, persist it as Queued and hand it to the queue
pub async fn submit_test(submission: TestSubmission, ctx: &RunnerContext) -> Result<u64, String> {
    let validated = submission
        .validate()
        .map_err(|e| format!("Invalid submission: {}", e))?;

    let id = ctx
        .store
        .create_queued(&validated)
        .await
        .map_err(|e| format!("Failed to create test record: {}", e))?;

    let run_config = RunConfig {
        test_id: id,
        chip_id: validated.chip_id.clone(),
        snr_range: validated.snr_range.clone(),
        batch_size: validated.batch_size,
    };
    if let Err(e) = write_run_config(&ctx.tests_root, &validated.username, &run_config) {
        // The results file is what matters; a missing config copy is not fatal
        log::warn!("Failed to write run config for test {}: {}", id, e);
    }

    ctx.queue
        .enqueue(TestRequest::new(id, validated))
        .map_err(|e| format!("Failed to queue test {}: {}", id, e))?;

    log::info!("Accepted test {}", id);
    Ok(id)
}

/// Get the stored record of one test
pub async fn get_test(test_id: u64, ctx: &RunnerContext) -> Result<TestRecord, String> {
    ctx.store
        .get_by_id(test_id)
        .await
        .map_err(|e| format!("Failed to read test: {}", e))
}

/// Current queue snapshot
pub async fn queue_status(ctx: &RunnerContext) -> Result<QueueSnapshot, String> {
    Ok(ctx.queue.snapshot())
}

/// Link state and the last known controller state
pub async fn device_status(ctx: &RunnerContext) -> Result<DeviceStatusReport, String> {
    Ok(DeviceStatusReport {
        use_hardware: ctx.protocol.is_some(),
        connection: ctx.protocol.as_ref().map(|p| p.link().state()),
        device: ctx.device_state.as_ref().map(|rx| rx.borrow().clone()),
    })
}

/// Forward an admin chip status change to the controller
pub async fn set_chip_status(chip_id: String, status: String, ctx: &RunnerContext) -> Result<(), String> {
    let protocol = ctx
        .protocol
        .as_ref()
        .ok_or_else(|| "No test controller in simulation mode".to_string())?;

    protocol
        .send_chip_status(&chip_id, &status)
        .await
        .map_err(|e| format!("Failed to send chip status: {}", e))
}
