use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

use crate::serial::{DeviceEvent, DeviceProtocol, EventStream};
use super::DeviceState;

/// Tracks controller liveness and chip status from the incoming event stream,
/// and answers `status_check` requests.
pub struct DeviceMonitor {
    state_rx: watch::Receiver<DeviceState>,
    stop_tx: mpsc::Sender<()>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl DeviceMonitor {
    pub fn start(protocol: DeviceProtocol) -> Self {
        let events = protocol.subscribe();
        let (state_tx, state_rx) = watch::channel(DeviceState::default());
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let task_handle = tokio::spawn(Self::monitoring_loop(protocol, events, state_tx, stop_rx));

        Self {
            state_rx,
            stop_tx,
            task_handle,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<DeviceState> {
        self.state_rx.clone()
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.task_handle).await;
    }

    async fn monitoring_loop(
        protocol: DeviceProtocol,
        mut events: EventStream,
        state_tx: watch::Sender<DeviceState>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        log::info!("Device monitor started");

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    log::info!("Device monitor received stop signal");
                    break;
                }
                event = events.next() => {
                    let Some(event) = event else {
                        log::info!("Device event stream closed");
                        break;
                    };

                    match &event {
                        DeviceEvent::Heartbeat => log::trace!("Heartbeat from test controller"),
                        DeviceEvent::StatusCheckRequest => {
                            if let Err(e) = protocol.send_status("ONLINE").await {
                                log::warn!("Failed to answer status check: {}", e);
                            }
                        }
                        DeviceEvent::ChipStatus(reports) => {
                            log::debug!("Chip status update for {} chip(s)", reports.len());
                        }
                        DeviceEvent::Unparseable { raw_line } => {
                            log::debug!("Ignoring device output: {}", raw_line);
                        }
                        _ => {}
                    }

                    state_tx.send_if_modified(|state| state.apply(&event, Utc::now()));
                }
            }
        }
    }
}
