#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::timeout;

use daqroc_runner_lib::notify::Notifier;
use daqroc_runner_lib::queue::models::ValidatedSubmission;
use daqroc_runner_lib::queue::{QueueHandle, QueueSnapshot, RunFailure, TestRecord, TestStatus, TestSubmission};
use daqroc_runner_lib::serial::{DeviceProtocol, LinkOptions, SerialLink};

pub const WAIT: Duration = Duration::from_secs(5);

/// Device end of an in-memory serial line
pub struct Firmware {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Firmware {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Next line written by the server, panicking if none arrives in time
    pub async fn next_command(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a command")
            .expect("read failed")
            .expect("server closed the link")
    }

    /// Next line if one arrives within `wait`
    pub async fn try_next_command(&mut self, wait: Duration) -> Option<String> {
        match timeout(wait, self.lines.next_line()).await {
            Ok(Ok(line)) => line,
            _ => None,
        }
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

pub fn link_options() -> LinkOptions {
    LinkOptions {
        write_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn hardware() -> (DeviceProtocol, Firmware) {
    let (server, device) = tokio::io::duplex(64 * 1024);
    let link = SerialLink::from_stream(server, link_options());
    (DeviceProtocol::new(link), Firmware::new(device))
}

/// Stream whose next `fail` writes error out with BrokenPipe
pub struct FlakyStream {
    inner: DuplexStream,
    fail: Arc<AtomicUsize>,
}

impl FlakyStream {
    pub fn new(inner: DuplexStream, fail: Arc<AtomicUsize>) -> Self {
        Self { inner, fail }
    }
}

impl AsyncRead for FlakyStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let failing = self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled")));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub fn submission(username: &str, chip_id: &str, snr_range: &str, batch_size: i64) -> ValidatedSubmission {
    TestSubmission {
        username: username.to_string(),
        chip_id: chip_id.to_string(),
        snr_range: snr_range.to_string(),
        batch_size,
    }
    .validate()
    .expect("valid submission")
}

pub async fn wait_for(handle: &QueueHandle, what: &str, pred: impl FnMut(&QueueSnapshot) -> bool) -> QueueSnapshot {
    let mut status = handle.status_receiver();
    let snapshot = timeout(WAIT, status.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("queue task gone")
        .clone();
    snapshot
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub id: u64,
    pub status: TestStatus,
    pub failure: Option<String>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub finished: Mutex<Vec<Finished>>,
}

impl RecordingNotifier {
    pub fn finished(&self) -> Vec<Finished> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn run_finished(&self, record: &TestRecord, failure: Option<&RunFailure>) {
        self.finished.lock().unwrap().push(Finished {
            id: record.id,
            status: record.status,
            failure: failure.map(|f| f.to_string()),
        });
    }
}
