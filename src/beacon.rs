use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::serial::DeviceProtocol;

pub const BEACON_STATUS: &str = "ONLINE";

/// Periodically announces server liveness to the test controller, regardless of
/// what the queue is doing. Failures are logged and never reach the queue.
pub struct StatusBeacon {
    task_handle: tokio::task::JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

impl StatusBeacon {
    pub fn start(protocol: DeviceProtocol, period: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task_handle = tokio::spawn(Self::beacon_loop(protocol, period, stop_rx));
        Self { task_handle, stop_tx }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.task_handle).await;
    }

    async fn beacon_loop(protocol: DeviceProtocol, period: Duration, mut stop_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Status beacon started, period {:?}", period);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = protocol.send_status(BEACON_STATUS).await {
                        log::warn!("Status beacon write failed: {}", e);
                    }
                }
            }
        }

        log::info!("Status beacon stopped");
    }
}
