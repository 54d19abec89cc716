//! Line-oriented serial link.
//!
//! A single task owns the byte stream. Incoming bytes are split into lines and
//! fanned out on a broadcast channel; outgoing lines arrive on a command channel,
//! so writes from independent callers never interleave on the wire. When the read
//! side fails the link degrades: writes become no-ops and, if the link knows how
//! to re-open its port, reconnection is attempted with exponential backoff.
use std::time::Duration;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_serial::SerialStream;

use super::interface;
use super::{Result, SerialError};

const READ_CHUNK: usize = 512;
const MAX_PARTIAL: usize = 8192;
const KEEP_PARTIAL: usize = 4096;

/// Re-opens the underlying stream after the link degraded
pub type Opener<T> = Box<dyn FnMut() -> Result<T> + Send>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Degraded(String),
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max).max(self.initial)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub write_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub line_capacity: usize,
    pub command_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            line_capacity: 1024,
            command_capacity: 64,
        }
    }
}

#[derive(Debug)]
enum LinkCommand {
    Write {
        line: String,
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct SerialLink {
    cmd_tx: mpsc::Sender<LinkCommand>,
    lines_tx: broadcast::Sender<String>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SerialLink {
    /// Open the device file, failing with `ConnectionFailed` if it is unavailable
    pub fn open(path: &str, baud_rate: u32, options: LinkOptions) -> Result<Self> {
        let stream = interface::open_port(path, baud_rate)?;
        Ok(Self::spawn(Some(stream), Some(serial_opener(path, baud_rate)), options))
    }

    /// Open the device file, starting in the degraded state when it is unavailable.
    /// The connection error is logged and reconnection continues in the background.
    pub fn open_or_degraded(path: &str, baud_rate: u32, options: LinkOptions) -> Self {
        let mut opener = serial_opener(path, baud_rate);
        let initial = match opener() {
            Ok(stream) => Some(stream),
            Err(e) => {
                log::error!("Serial link unavailable, starting degraded: {}", e);
                None
            }
        };
        Self::spawn(initial, Some(opener), options)
    }

    /// Wrap an already-open stream. Without an opener the link cannot reconnect.
    pub fn from_stream<T>(stream: T, options: LinkOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(Some(stream), None, options)
    }

    pub fn spawn<T>(initial: Option<T>, opener: Option<Opener<T>>, options: LinkOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(options.command_capacity);
        let (lines_tx, _lines_rx) = broadcast::channel(options.line_capacity);
        let initial_state = match initial {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Degraded("not connected".to_string()),
        };
        let (state_tx, state_rx) = watch::channel(initial_state);

        tokio::spawn(link_task(initial, opener, options, cmd_rx, lines_tx.clone(), state_tx));

        Self { cmd_tx, lines_tx, state_rx }
    }

    /// Every newline-delimited frame received from now on, in arrival order
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.lines_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), ConnectionState::Connected)
    }

    /// Send one line to the device. A newline is appended.
    ///
    /// Returns `Ok` without touching the wire while the link is degraded.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Write { line: text.to_string(), responder })
            .await
            .map_err(|_| SerialError::LinkClosed)?;
        rx.await.map_err(|_| SerialError::LinkClosed)?
    }

    /// Release the port. Pending and later writes fail with `LinkClosed`.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Shutdown).await;
    }
}

fn serial_opener(path: &str, baud_rate: u32) -> Opener<SerialStream> {
    let path = path.to_string();
    Box::new(move || interface::open_port(&path, baud_rate))
}

async fn link_task<T>(
    initial: Option<T>,
    mut opener: Option<Opener<T>>,
    options: LinkOptions,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    lines_tx: broadcast::Sender<String>,
    state_tx: watch::Sender<ConnectionState>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = match initial {
        Some(stream) => {
            let (r, w) = tokio::io::split(stream);
            (Some(r), Some(w))
        }
        None => (None, None),
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut partial: Vec<u8> = Vec::new();
    let mut retry_delay = options.reconnect.initial;
    let mut next_retry = Instant::now() + retry_delay;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LinkCommand::Write { line, responder }) => {
                        let result = match writer.as_mut() {
                            Some(w) => write_frame(w, &line, options.write_timeout).await,
                            None => {
                                log::debug!("Serial link degraded, dropping write: {}", line);
                                Ok(())
                            }
                        };
                        if let Err(e) = &result {
                            log::warn!("Serial write of '{}' failed: {}", line, e);
                        }
                        let _ = responder.send(result);
                    }
                    Some(LinkCommand::Shutdown) | None => break,
                }
            },
            read = read_chunk(&mut reader, &mut chunk) => {
                let reason = match read {
                    Ok(0) => Some("device closed the connection".to_string()),
                    Ok(n) => {
                        partial.extend_from_slice(&chunk[..n]);
                        for line in split_lines(&mut partial) {
                            // No receivers is fine, nobody is listening yet
                            let _ = lines_tx.send(line);
                        }
                        if partial.len() > MAX_PARTIAL {
                            log::warn!("Discarding {} bytes of unterminated serial input", partial.len() - KEEP_PARTIAL);
                            partial.drain(..partial.len() - KEEP_PARTIAL);
                        }
                        None
                    }
                    Err(e) => Some(format!("read error: {}", e)),
                };
                if let Some(reason) = reason {
                    log::error!("Serial link degraded: {}", reason);
                    reader = None;
                    writer = None;
                    partial.clear();
                    retry_delay = options.reconnect.initial;
                    next_retry = Instant::now() + retry_delay;
                    let _ = state_tx.send(ConnectionState::Degraded(reason));
                }
            },
            _ = tokio::time::sleep_until(next_retry), if reader.is_none() && opener.is_some() => {
                if let Some(open) = opener.as_mut() {
                    match open() {
                        Ok(stream) => {
                            let (r, w) = tokio::io::split(stream);
                            reader = Some(r);
                            writer = Some(w);
                            retry_delay = options.reconnect.initial;
                            let _ = state_tx.send(ConnectionState::Connected);
                            log::info!("Serial link re-established");
                        }
                        Err(e) => {
                            retry_delay = options.reconnect.next_delay(retry_delay);
                            next_retry = Instant::now() + retry_delay;
                            log::warn!("Serial reconnect failed: {}; retrying in {:?}", e, retry_delay);
                        }
                    }
                }
            }
        }
    }

    let _ = state_tx.send(ConnectionState::Closed);
    log::info!("Serial link closed");
}

async fn read_chunk<T: AsyncRead>(reader: &mut Option<ReadHalf<T>>, chunk: &mut [u8]) -> std::io::Result<usize> {
    match reader.as_mut() {
        Some(r) => r.read(chunk).await,
        None => std::future::pending().await,
    }
}

async fn write_frame<T: AsyncWrite>(writer: &mut WriteHalf<T>, line: &str, limit: Duration) -> Result<()> {
    let frame = format!("{}\n", line);
    let write = async {
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await
    };
    match timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SerialError::WriteFailed(e.to_string())),
        Err(_) => Err(SerialError::WriteFailed(format!("write timed out after {:?}", limit))),
    }
}

/// Drain every complete line from `partial`, leaving any unterminated tail.
/// Both `\n` and `\r` terminate a frame; blank frames are skipped.
pub(crate) fn split_lines(partial: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = partial.iter().position(|b| *b == b'\n' || *b == b'\r') {
        let frame: Vec<u8> = partial.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&frame);
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_lines_keeps_unterminated_tail() {
        let mut partial = b"{\"type\":\"heartbeat\"}\r\n\r\nTEST ok\n{\"type\":".to_vec();
        let lines = split_lines(&mut partial);
        assert_eq!(lines, vec!["{\"type\":\"heartbeat\"}".to_string(), "TEST ok".to_string()]);
        assert_eq!(partial, b"{\"type\":".to_vec());
    }

    #[test]
    fn split_lines_replaces_invalid_utf8() {
        let mut partial = vec![0xFF, b'o', b'k', b'\n'];
        let lines = split_lines(&mut partial);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("ok"));
        assert!(partial.is_empty());
    }

    #[test]
    fn reconnect_backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        let second = policy.next_delay(policy.initial);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(policy.next_delay(second), Duration::from_millis(350));
        assert_eq!(policy.next_delay(Duration::from_millis(350)), Duration::from_millis(350));
    }
}
