//! Single-flight FIFO execution of test requests against one test controller.
//!
//! [`TestQueue`] is the state machine. It is owned by exactly one task (see
//! [`TestQueue::spawn`]), which is what makes the busy flag and the pending list
//! safe without locks: enqueue requests, device events, the run deadline and a
//! periodic re-check all arrive at that task and are handled one at a time.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::notify::Notifier;
use crate::results::{ResultsSink, STREAM_COLUMNS};
use crate::serial::{DeviceEvent, DeviceProtocol, EventStream};
use crate::store::TestStore;
use super::models::{compute_duration, format_timestamp, RunResults, TestRequest, TestStatus};
use super::simulator::Simulator;
use super::RunFailure;

/// Where runs are executed
#[derive(Clone)]
pub enum Executor {
    /// Real controller behind the serial link; results stream back as events
    Hardware(DeviceProtocol),
    /// Deterministic one-shot result synthesis, no device involved
    Simulated(Simulator),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub tests_root: PathBuf,
    pub run_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            tests_root: PathBuf::from("tests"),
            run_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub running: Option<u64>,
    pub pending: Vec<u64>,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("test queue is not running")]
pub struct QueueClosed;

struct ActiveRun {
    request: TestRequest,
    sink: ResultsSink,
    deadline: Instant,
}

pub struct TestQueue {
    pending: VecDeque<TestRequest>,
    active: Option<ActiveRun>,
    store: Arc<dyn TestStore>,
    notifier: Arc<dyn Notifier>,
    executor: Executor,
    settings: QueueSettings,
    completed: u64,
    failed: u64,
    status_tx: watch::Sender<QueueSnapshot>,
}

impl TestQueue {
    pub fn new(
        store: Arc<dyn TestStore>,
        notifier: Arc<dyn Notifier>,
        executor: Executor,
        settings: QueueSettings,
    ) -> Self {
        let (status_tx, _status_rx) = watch::channel(QueueSnapshot::default());
        Self {
            pending: VecDeque::new(),
            active: None,
            store,
            notifier,
            executor,
            settings,
            completed: 0,
            failed: 0,
            status_tx,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn running_test(&self) -> Option<u64> {
        self.active.as_ref().map(|run| run.request.id)
    }

    /// Nothing running and nothing waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<u64> {
        self.pending.iter().map(|r| r.id).collect()
    }

    /// When the active run times out, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|run| run.deadline)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running: self.running_test(),
            pending: self.pending_ids(),
            completed: self.completed,
            failed: self.failed,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueSnapshot> {
        self.status_tx.subscribe()
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    /// Append to the tail. Processing is started by the owner via `try_process_next`.
    pub fn enqueue(&mut self, request: TestRequest) {
        log::info!(
            "Queued test {} for {} on {} ({} ahead)",
            request.id,
            request.username,
            request.chip_id,
            self.pending.len() + usize::from(self.is_busy())
        );
        self.pending.push_back(request);
        self.publish();
    }

    /// Start pending runs in FIFO order until one is in flight or the queue is empty.
    /// A run that fails to start is finished as Failed and the next one is tried.
    pub async fn try_process_next(&mut self) {
        while self.active.is_none() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.start_run(request).await;
        }
        self.publish();
    }

    async fn start_run(&mut self, request: TestRequest) {
        if let Err(e) = self.store.set_status(request.id, TestStatus::Running).await {
            self.finish_run(&request, None, Some(e.into())).await;
            return;
        }
        log::info!("Test {} is running", request.id);

        let mut sink = match ResultsSink::open(&self.settings.tests_root, &request.username, request.id) {
            Ok(sink) => sink,
            Err(e) => {
                self.finish_run(&request, None, Some(e.into())).await;
                return;
            }
        };

        match self.executor.clone() {
            Executor::Hardware(protocol) => {
                if let Err(e) = sink.write_header(STREAM_COLUMNS) {
                    self.finish_run(&request, Some(sink), Some(e.into())).await;
                    return;
                }
                let started = protocol
                    .start_test(request.id, &request.chip_id, &request.snr_range, request.batch_size)
                    .await;
                match started {
                    Ok(()) => {
                        self.active = Some(ActiveRun {
                            deadline: Instant::now() + self.settings.run_timeout,
                            request,
                            sink,
                        });
                    }
                    Err(e) => self.finish_run(&request, Some(sink), Some(e.into())).await,
                }
            }
            Executor::Simulated(simulator) => {
                let failure = simulator.write_results(&request, &mut sink).err().map(RunFailure::from);
                self.finish_run(&request, Some(sink), failure).await;
            }
        }
    }

    /// Apply one decoded device event. Events for a test other than the running
    /// one are logged and dropped.
    pub async fn on_device_event(&mut self, event: DeviceEvent) {
        let running = self.running_test();
        match event {
            DeviceEvent::TestStarted { test_id } => {
                if running == Some(test_id) {
                    log::info!("Device acknowledged start of test {}", test_id);
                } else {
                    log::warn!("Start acknowledgement for test {} ignored (running: {:?})", test_id, running);
                }
            }
            DeviceEvent::ResultRow { test_id, row } => {
                let Some(active) = self.active.as_mut().filter(|run| run.request.id == test_id) else {
                    log::warn!("Dropping result row for test {} (running: {:?})", test_id, running);
                    return;
                };
                if let Err(e) = active.sink.append_row(row.to_record()) {
                    self.finish_active(Some(e.into())).await;
                    self.try_process_next().await;
                }
            }
            DeviceEvent::TestCompleted { test_id, chip_id } => {
                if running != Some(test_id) {
                    log::warn!("Completion for test {} ignored (running: {:?})", test_id, running);
                    return;
                }
                log::info!("Device reported test {} complete on {}", test_id, chip_id);
                self.finish_active(None).await;
                self.try_process_next().await;
            }
            // Liveness and chip status are the device monitor's business
            _ => {}
        }
    }

    /// Fail the active run if its deadline has passed, then move on
    pub async fn on_timeout(&mut self) {
        let expired = self.active.as_ref().is_some_and(|run| Instant::now() >= run.deadline);
        if !expired {
            return;
        }
        if let Some(id) = self.running_test() {
            log::warn!("Test {} timed out after {:?}", id, self.settings.run_timeout);
        }
        self.finish_active(Some(RunFailure::Timeout(self.settings.run_timeout))).await;
        self.try_process_next().await;
    }

    async fn finish_active(&mut self, failure: Option<RunFailure>) {
        if let Some(run) = self.active.take() {
            self.finish_run(&run.request, Some(run.sink), failure).await;
        }
    }

    /// Close the sink, record end time and duration, move the record to its
    /// terminal state and notify. Store errors here are logged; the queue
    /// always advances.
    async fn finish_run(&mut self, request: &TestRequest, sink: Option<ResultsSink>, failure: Option<RunFailure>) {
        let mut failure = failure;
        let results_path = sink.map(|mut sink| match sink.close() {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to close results for test {}: {}", request.id, e);
                let path = sink.path().to_path_buf();
                failure.get_or_insert(e.into());
                path
            }
        });

        let status = if failure.is_none() {
            TestStatus::Completed
        } else {
            TestStatus::Failed
        };
        let end_time = format_timestamp(Utc::now());
        let start_time = self.store.get_by_id(request.id).await.ok().and_then(|r| r.start_time);
        let duration = compute_duration(start_time.as_deref(), Some(&end_time));

        let results = RunResults {
            results_path,
            end_time,
            duration,
        };
        if let Err(e) = self.store.set_results(request.id, results).await {
            log::error!("Failed to record results for test {}: {}", request.id, e);
        }
        if let Err(e) = self.store.set_status(request.id, status).await {
            log::error!("Failed to mark test {} {}: {}", request.id, status, e);
        }

        match &failure {
            None => self.completed += 1,
            Some(reason) => {
                self.failed += 1;
                log::error!("Test {} failed: {}", request.id, reason);
            }
        }

        match self.store.get_by_id(request.id).await {
            Ok(record) => self.notifier.run_finished(&record, failure.as_ref()).await,
            Err(e) => log::warn!("No record to notify for test {}: {}", request.id, e),
        }
        self.publish();
    }

    /// Fail whatever is running. Pending requests stay Queued in the store.
    pub async fn shutdown(&mut self) {
        self.finish_active(Some(RunFailure::Shutdown)).await;
        if !self.pending.is_empty() {
            log::warn!("Test queue stopped with {} request(s) still pending", self.pending.len());
        }
    }

    /// Hand the queue to its own task and return a handle for submitting work
    pub fn spawn(self) -> (QueueHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status_rx = self.subscribe_status();
        let events = match &self.executor {
            Executor::Hardware(protocol) => Some(protocol.subscribe()),
            Executor::Simulated(_) => None,
        };
        let task = tokio::spawn(queue_loop(self, rx, events));
        (QueueHandle { tx, status_rx }, task)
    }
}

#[derive(Debug)]
enum QueueMessage {
    Enqueue(TestRequest),
    /// Answered once every request sent before it has finished
    Drain(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap, cloneable access to the queue task
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueMessage>,
    status_rx: watch::Receiver<QueueSnapshot>,
}

impl QueueHandle {
    /// Never blocks; processing starts asynchronously if the queue is idle
    pub fn enqueue(&self, request: TestRequest) -> Result<(), QueueClosed> {
        self.tx.send(QueueMessage::Enqueue(request)).map_err(|_| QueueClosed)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<QueueSnapshot> {
        self.status_rx.clone()
    }

    /// Wait until every request enqueued through this handle so far has reached
    /// a terminal state. Requests still in the channel are counted.
    pub async fn drained(&self) -> Result<(), QueueClosed> {
        let (responder, rx) = oneshot::channel();
        self.tx.send(QueueMessage::Drain(responder)).map_err(|_| QueueClosed)?;
        rx.await.map_err(|_| QueueClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueMessage::Shutdown);
    }
}

async fn queue_loop(
    mut queue: TestQueue,
    mut rx: mpsc::UnboundedReceiver<QueueMessage>,
    mut events: Option<EventStream>,
) {
    let mut poll = interval(queue.settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drain_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    log::info!("Test queue started");

    loop {
        if queue.is_idle() {
            for waiter in drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }

        let deadline = queue.deadline();
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(QueueMessage::Enqueue(request)) => {
                        queue.enqueue(request);
                        queue.try_process_next().await;
                    }
                    Some(QueueMessage::Drain(responder)) => drain_waiters.push(responder),
                    Some(QueueMessage::Shutdown) | None => break,
                }
            },
            event = next_event(&mut events) => {
                match event {
                    Some(event) => queue.on_device_event(event).await,
                    None => {
                        log::warn!("Device event stream closed, queue now relies on timeouts");
                        events = None;
                    }
                }
            },
            _ = wait_for_deadline(deadline) => queue.on_timeout().await,
            _ = poll.tick() => queue.try_process_next().await,
        }
    }

    queue.shutdown().await;
    log::info!("Test queue stopped");
}

async fn next_event(events: &mut Option<EventStream>) -> Option<DeviceEvent> {
    match events.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
