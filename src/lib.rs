pub mod beacon;
pub mod commands;
pub mod config;
pub mod device;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod results;
pub mod serial;
pub mod store;

use std::sync::Arc;
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use beacon::StatusBeacon;
use commands::RunnerContext;
use config::RunnerConfig;
use device::DeviceMonitor;
use notify::LogNotifier;
use queue::{Executor, Simulator, TestQueue, TestSubmission};
use serial::{DeviceProtocol, SerialLink};
use store::{JsonTestStore, TestStore};

/// Run the test runner until ctrl-c or until the submission feed on stdin ends.
///
/// Each stdin line is a JSON test submission
/// (`{"username":..,"chipId":..,"snrRange":..,"batchSize":..}`); the assigned
/// id or the rejection reason is logged.
pub async fn run(config: RunnerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn TestStore> = match &config.store_path {
        Some(path) => Arc::new(
            JsonTestStore::open(path)
                .await
                .with_context(|| format!("Failed to open test store '{}'", path.display()))?,
        ),
        None => Arc::new(JsonTestStore::in_memory()),
    };

    let protocol = if config.use_hardware {
        log::info!("Using test controller on {} at {} baud", config.serial_path, config.baud_rate);
        let link = SerialLink::open_or_degraded(&config.serial_path, config.baud_rate, config.link_options());
        Some(DeviceProtocol::new(link))
    } else {
        log::info!("Hardware disabled, results will be simulated");
        None
    };

    let monitor = protocol.clone().map(DeviceMonitor::start);
    let beacon = protocol
        .clone()
        .map(|p| StatusBeacon::start(p, config.beacon_interval()));

    let executor = match &protocol {
        Some(p) => Executor::Hardware(p.clone()),
        None => Executor::Simulated(Simulator::new()),
    };
    let queue = TestQueue::new(store.clone(), Arc::new(LogNotifier), executor, config.queue_settings());
    let (queue_handle, queue_task) = queue.spawn();

    let ctx = RunnerContext {
        store,
        queue: queue_handle.clone(),
        tests_root: config.tests_root.clone(),
        protocol: protocol.clone(),
        device_state: monitor.as_ref().map(|m| m.state_receiver()),
    };

    log::info!("DAQROC runner started, reading submissions from stdin");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            log::info!("Shutdown requested");
        }
        _ = submission_feed(&ctx) => {
            log::info!("Submission feed closed, waiting for the queue to drain");
            tokio::select! {
                drained = queue_handle.drained() => {
                    if drained.is_err() {
                        log::warn!("Test queue stopped before draining");
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for ctrl-c")?;
                }
            }
        }
    }

    // Beacon first so nothing new is written, then the queue, then the link
    if let Some(beacon) = beacon {
        beacon.stop().await;
    }
    queue_handle.shutdown();
    if let Err(e) = queue_task.await {
        log::error!("Queue task ended abnormally: {}", e);
    }
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    if let Some(protocol) = protocol {
        protocol.link().close().await;
    }

    log::info!("DAQROC runner stopped");
    Ok(())
}

async fn submission_feed(ctx: &RunnerContext) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read submission: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let submission: TestSubmission = match serde_json::from_str(&line) {
            Ok(submission) => submission,
            Err(e) => {
                log::warn!("Rejected submission: {}", e);
                continue;
            }
        };
        match commands::submit_test(submission, ctx).await {
            Ok(id) => log::info!("Submission accepted as test {}", id),
            Err(e) => log::warn!("Rejected submission: {}", e),
        }
    }
}
