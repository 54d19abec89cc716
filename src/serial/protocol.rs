use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::broadcast;

use super::{SerialError, SerialLink};

/// Text-based protocol spoken by the Teensy test controller.
///
/// Outgoing commands are plain text lines (`SERVER_ONLINE`,
/// `CHIP_STATUS <id> <status>`, `TEST<id> <chip> <snrRange> <batchSize>`).
/// Incoming lines are best-effort JSON objects discriminated by `type`; anything
/// else is firmware chatter and decodes to [`DeviceEvent::Unparseable`].
#[derive(Clone)]
pub struct DeviceProtocol {
    link: SerialLink,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid command argument: {0}")]
    Validation(String),

    #[error("Serial communication error: {0}")]
    Serial(#[from] SerialError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// One sample streamed by the device while a test runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub iteration: u32,
    pub snr: f64,
    pub ber: f64,
    pub fer: f64,
}

impl ResultRow {
    pub fn to_record(&self) -> [String; 4] {
        [
            self.iteration.to_string(),
            self.snr.to_string(),
            self.ber.to_string(),
            self.fer.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipReport {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Heartbeat,
    StatusCheckRequest,
    ChipStatus(Vec<ChipReport>),
    TestStarted { test_id: u64 },
    ResultRow { test_id: u64, row: ResultRow },
    TestCompleted { test_id: u64, chip_id: String },
    Unparseable { raw_line: String },
}

impl DeviceEvent {
    /// Test the event refers to, if any
    pub fn test_id(&self) -> Option<u64> {
        match self {
            DeviceEvent::TestStarted { test_id }
            | DeviceEvent::ResultRow { test_id, .. }
            | DeviceEvent::TestCompleted { test_id, .. } => Some(*test_id),
            _ => None,
        }
    }
}

// Wire shape of incoming frames. Unknown or missing `type` fails deserialization.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Heartbeat,
    StatusCheck,
    ChipStatus {
        chips: Vec<WireChip>,
    },
    TestStarted {
        #[serde(rename = "testId", deserialize_with = "de_test_id")]
        test_id: u64,
    },
    TestResult {
        #[serde(rename = "testId", deserialize_with = "de_test_id")]
        test_id: u64,
        iteration: u32,
        snr: f64,
        ber: f64,
        fer: f64,
    },
    TestCompleted {
        #[serde(rename = "testId", deserialize_with = "de_test_id")]
        test_id: u64,
        #[serde(rename = "chipId", deserialize_with = "de_text")]
        chip_id: String,
    },
}

#[derive(Debug, Deserialize)]
struct WireChip {
    #[serde(deserialize_with = "de_text")]
    id: String,
    #[serde(deserialize_with = "de_text")]
    status: String,
}

// Firmware is inconsistent about quoting ids, so accept numbers and strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

fn de_test_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match Scalar::deserialize(deserializer)? {
        Scalar::Int(v) => Ok(v),
        Scalar::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid test id '{}'", s))),
        Scalar::Float(f) => Err(serde::de::Error::custom(format!("invalid test id {}", f))),
    }
}

fn de_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Scalar::deserialize(deserializer)? {
        Scalar::Int(v) => Ok(v.to_string()),
        Scalar::Float(f) => Ok(f.to_string()),
        Scalar::Text(s) => Ok(s),
    }
}

impl From<WireEvent> for DeviceEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Heartbeat => DeviceEvent::Heartbeat,
            WireEvent::StatusCheck => DeviceEvent::StatusCheckRequest,
            WireEvent::ChipStatus { chips } => DeviceEvent::ChipStatus(
                chips
                    .into_iter()
                    .map(|c| ChipReport { id: c.id, status: c.status })
                    .collect(),
            ),
            WireEvent::TestStarted { test_id } => DeviceEvent::TestStarted { test_id },
            WireEvent::TestResult { test_id, iteration, snr, ber, fer } => DeviceEvent::ResultRow {
                test_id,
                row: ResultRow { iteration, snr, ber, fer },
            },
            WireEvent::TestCompleted { test_id, chip_id } => DeviceEvent::TestCompleted { test_id, chip_id },
        }
    }
}

/// Decode one line of serial input. Never fails: anything that is not a
/// recognised frame comes back as `Unparseable`.
pub fn parse(line: &str) -> DeviceEvent {
    match serde_json::from_str::<WireEvent>(line.trim()) {
        Ok(wire) => wire.into(),
        Err(_) => DeviceEvent::Unparseable { raw_line: line.to_string() },
    }
}

fn check_arg(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Validation(format!("{} must not be empty", name)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProtocolError::Validation(format!(
            "{} must not contain whitespace: '{}'",
            name,
            value.escape_debug()
        )));
    }
    Ok(())
}

/// `SERVER_<STATUS>`, status upper-cased
pub fn status_command(status: &str) -> Result<String> {
    check_arg("status", status)?;
    Ok(format!("SERVER_{}", status.to_ascii_uppercase()))
}

/// `CHIP_STATUS <id> <status>`
pub fn chip_status_command(chip_id: &str, status: &str) -> Result<String> {
    check_arg("chip id", chip_id)?;
    check_arg("chip status", status)?;
    Ok(format!("CHIP_STATUS {} {}", chip_id, status))
}

/// `TEST<id> <chipId> <snrRange> <batchSize>`
pub fn start_test_command(test_id: u64, chip_id: &str, snr_range: &str, batch_size: u32) -> Result<String> {
    check_arg("chip id", chip_id)?;
    check_arg("SNR range", snr_range)?;
    if batch_size == 0 {
        return Err(ProtocolError::Validation("batch size must be positive".to_string()));
    }
    Ok(format!("TEST{} {} {} {}", test_id, chip_id, snr_range, batch_size))
}

impl DeviceProtocol {
    pub fn new(link: SerialLink) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    /// Typed view of the incoming line stream
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.link.subscribe_lines())
    }

    /// Announce server state, e.g. `ONLINE`
    pub async fn send_status(&self, status: &str) -> Result<()> {
        let command = status_command(status)?;
        self.link.write_line(&command).await?;
        Ok(())
    }

    pub async fn send_chip_status(&self, chip_id: &str, status: &str) -> Result<()> {
        let command = chip_status_command(chip_id, status)?;
        self.link.write_line(&command).await?;
        Ok(())
    }

    pub async fn start_test(&self, test_id: u64, chip_id: &str, snr_range: &str, batch_size: u32) -> Result<()> {
        let command = start_test_command(test_id, chip_id, snr_range, batch_size)?;
        log::info!("Starting test {} on {}: {}", test_id, chip_id, command);
        self.link.write_line(&command).await?;
        Ok(())
    }
}

/// Subscription that yields one decoded event per incoming line, in arrival order
pub struct EventStream {
    lines: broadcast::Receiver<String>,
}

impl EventStream {
    pub fn new(lines: broadcast::Receiver<String>) -> Self {
        Self { lines }
    }

    /// Next event, or `None` once the link is gone. Cancel safe.
    pub async fn next(&mut self) -> Option<DeviceEvent> {
        loop {
            match self.lines.recv().await {
                Ok(line) => return Some(parse(&line)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, {} serial lines dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
