use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Upper bound on sweep points accepted at submission
pub const MAX_SNR_POINTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid username: {0}")]
    Username(String),

    #[error("Invalid chip id: {0}")]
    ChipId(String),

    #[error("Invalid SNR range: {0}")]
    SnrRange(String),

    #[error("Invalid batch size: {0}")]
    BatchSize(String),
}

/// SNR sweep written as `start:step:stop`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrRange {
    pub start: f64,
    pub step: f64,
    pub stop: f64,
}

impl SnrRange {
    /// Every point of the sweep, `start` and `stop` inclusive
    pub fn points(&self) -> Vec<f64> {
        let count = self.point_count();
        (0..count).map(|i| self.start + self.step * i as f64).collect()
    }

    pub fn point_count(&self) -> usize {
        let steps = self.step_count();
        if steps.is_finite() && steps >= 0.0 {
            (steps as usize).saturating_add(1)
        } else {
            0
        }
    }

    // Whole steps between start and stop; float error is tolerated so that
    // 0:0.1:1 still ends at 1.0
    fn step_count(&self) -> f64 {
        (((self.stop - self.start) / self.step) + 1e-9).floor()
    }
}

impl FromStr for SnrRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(ValidationError::SnrRange(format!("'{}' is not start:step:stop", s)));
        }

        let mut values = [0f64; 3];
        for (slot, part) in values.iter_mut().zip(parts.iter()) {
            *slot = part
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ValidationError::SnrRange(format!("'{}' is not a number", part)))?;
        }
        let [start, step, stop] = values;

        if step <= 0.0 {
            return Err(ValidationError::SnrRange("step must be positive".to_string()));
        }
        if start > stop {
            return Err(ValidationError::SnrRange(format!("start {} exceeds stop {}", start, stop)));
        }

        let range = SnrRange { start, step, stop };
        let steps = range.step_count();
        if !steps.is_finite() || steps + 1.0 > MAX_SNR_POINTS as f64 {
            return Err(ValidationError::SnrRange(format!(
                "sweep has more than {} points",
                MAX_SNR_POINTS
            )));
        }
        Ok(range)
    }
}

/// Raw test submission as received from the web layer, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSubmission {
    pub username: String,
    #[serde(alias = "testBench", alias = "chip_id")]
    pub chip_id: String,
    #[serde(alias = "snr_range")]
    pub snr_range: String,
    #[serde(alias = "batch_size", deserialize_with = "de_batch_size")]
    pub batch_size: i64,
}

// Form posts send the batch size as a string
fn de_batch_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("batch size '{}' is not an integer", s))),
    }
}

/// Submission fields after validation; the only shape allowed into the queue
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSubmission {
    pub username: String,
    pub chip_id: String,
    pub snr_range: String,
    pub sweep: SnrRange,
    pub batch_size: u32,
}

impl TestSubmission {
    pub fn validate(&self) -> Result<ValidatedSubmission, ValidationError> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(ValidationError::Username("username is required".to_string()));
        }
        if username == "." || username == ".." {
            return Err(ValidationError::Username(format!("'{}' is reserved", username)));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ValidationError::Username(format!(
                "'{}' may only contain letters, digits, '_', '-' and '.'",
                username
            )));
        }

        let chip_id = self.chip_id.trim();
        if chip_id.is_empty() {
            return Err(ValidationError::ChipId("chip id is required".to_string()));
        }
        if chip_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::ChipId(format!("'{}' contains whitespace", chip_id.escape_debug())));
        }

        let snr_range = self.snr_range.trim();
        let sweep: SnrRange = snr_range.parse()?;

        if self.batch_size < 1 || self.batch_size > u32::MAX as i64 {
            return Err(ValidationError::BatchSize(format!("{} is not a positive integer", self.batch_size)));
        }

        Ok(ValidatedSubmission {
            username: username.to_string(),
            chip_id: chip_id.to_string(),
            snr_range: snr_range.to_string(),
            sweep,
            batch_size: self.batch_size as u32,
        })
    }
}

/// Unit of work handed to the queue. `id` is assigned by the store and never changes.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRequest {
    pub id: u64,
    pub username: String,
    pub chip_id: String,
    pub snr_range: String,
    pub sweep: SnrRange,
    pub batch_size: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TestRequest {
    pub fn new(id: u64, submission: ValidatedSubmission) -> Self {
        Self {
            id,
            username: submission.username,
            chip_id: submission.chip_id,
            snr_range: submission.snr_range,
            sweep: submission.sweep,
            batch_size: submission.batch_size,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TestStatus) -> bool {
        matches!(
            (self, next),
            (TestStatus::Queued, TestStatus::Running)
                | (TestStatus::Queued, TestStatus::Failed)
                | (TestStatus::Running, TestStatus::Completed)
                | (TestStatus::Running, TestStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Queued => "Queued",
            TestStatus::Running => "Running",
            TestStatus::Completed => "Completed",
            TestStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duration of a finished run in whole seconds, or `N/A`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDuration {
    Seconds(i64),
    NotAvailable,
}

impl fmt::Display for RunDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDuration::Seconds(s) => write!(f, "{}", s),
            RunDuration::NotAvailable => f.write_str("N/A"),
        }
    }
}

/// `end - start` in whole seconds for two RFC 3339 timestamps.
/// Missing, unparseable or reversed timestamps give `N/A`.
pub fn compute_duration(start: Option<&str>, end: Option<&str>) -> RunDuration {
    let (Some(start), Some(end)) = (start, end) else {
        return RunDuration::NotAvailable;
    };
    match (DateTime::parse_from_rfc3339(start), DateTime::parse_from_rfc3339(end)) {
        (Ok(start), Ok(end)) => {
            let seconds = (end - start).num_seconds();
            if seconds < 0 {
                RunDuration::NotAvailable
            } else {
                RunDuration::Seconds(seconds)
            }
        }
        _ => RunDuration::NotAvailable,
    }
}

/// Timestamp format used in stored records, e.g. `2024-01-01T00:05:00.000Z`
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable view of a test as kept by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: u64,
    pub username: String,
    pub chip_id: String,
    pub snr_range: String,
    pub batch_size: u32,
    pub status: TestStatus,
    pub created_at: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<String>,
    pub results_path: Option<PathBuf>,
}

/// Outcome fields written when a run reaches a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct RunResults {
    pub results_path: Option<PathBuf>,
    pub end_time: String,
    pub duration: RunDuration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(snr: &str, batch: i64) -> TestSubmission {
        TestSubmission {
            username: "alice".to_string(),
            chip_id: "LDPC1".to_string(),
            snr_range: snr.to_string(),
            batch_size: batch,
        }
    }

    #[test]
    fn duration_of_five_minutes() {
        let d = compute_duration(Some("2024-01-01T00:00:00.000Z"), Some("2024-01-01T00:05:00.000Z"));
        assert_eq!(d, RunDuration::Seconds(300));
        assert_eq!(d.to_string(), "300");
    }

    #[test]
    fn duration_not_available_for_bad_input() {
        assert_eq!(compute_duration(None, Some("2024-01-01T00:05:00.000Z")), RunDuration::NotAvailable);
        assert_eq!(compute_duration(Some("yesterday"), Some("2024-01-01T00:05:00.000Z")), RunDuration::NotAvailable);
        assert_eq!(
            compute_duration(Some("2024-01-01T00:05:00.000Z"), Some("2024-01-01T00:00:00.000Z")),
            RunDuration::NotAvailable
        );
        assert_eq!(RunDuration::NotAvailable.to_string(), "N/A");
    }

    #[test]
    fn snr_range_points_are_inclusive() {
        let range: SnrRange = "0:1:5".parse().unwrap();
        assert_eq!(range.points(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let fine: SnrRange = "0:0.1:1".parse().unwrap();
        assert_eq!(fine.point_count(), 11);

        let huge = SnrRange { start: 0.0, step: 1.0, stop: 1e300 };
        assert_eq!(huge.point_count(), usize::MAX);
        let reversed = SnrRange { start: 5.0, step: 1.0, stop: 0.0 };
        assert_eq!(reversed.point_count(), 0);
    }

    #[test]
    fn snr_range_rejects_malformed() {
        for bad in ["", "0:1", "a:1:5", "0:0:5", "0:-1:5", "5:1:0", "0:1:inf", "0:0.00001:1000", "0:1:1e300", "0:1e-300:1", "-1e308:1:1e308"] {
            assert!(bad.parse::<SnrRange>().is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn submission_validation() {
        assert!(submission("0:1:5", 3).validate().is_ok());
        assert!(matches!(submission("0:1:5", 0).validate(), Err(ValidationError::BatchSize(_))));
        assert!(matches!(submission("0-1-5", 3).validate(), Err(ValidationError::SnrRange(_))));
        assert!(matches!(submission("0:1e-300:1", 3).validate(), Err(ValidationError::SnrRange(_))));

        let mut bad_user = submission("0:1:5", 3);
        bad_user.username = "../etc".to_string();
        assert!(matches!(bad_user.validate(), Err(ValidationError::Username(_))));

        let mut bad_chip = submission("0:1:5", 3);
        bad_chip.chip_id = "LDPC 1".to_string();
        assert!(matches!(bad_chip.validate(), Err(ValidationError::ChipId(_))));
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(TestStatus::Queued.can_transition_to(TestStatus::Running));
        assert!(TestStatus::Running.can_transition_to(TestStatus::Completed));
        assert!(!TestStatus::Completed.can_transition_to(TestStatus::Running));
        assert!(!TestStatus::Failed.can_transition_to(TestStatus::Completed));
        assert!(!TestStatus::Running.can_transition_to(TestStatus::Running));
    }
}
