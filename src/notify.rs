use async_trait::async_trait;

use crate::queue::models::{TestRecord, TestStatus};
use crate::queue::RunFailure;

/// Receives every run that reaches a terminal state. Delivery (email, web push)
/// lives outside this crate; implementations must not block the queue for long.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn run_finished(&self, record: &TestRecord, failure: Option<&RunFailure>);
}

/// Default notifier, writes one log line per finished run
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn run_finished(&self, record: &TestRecord, failure: Option<&RunFailure>) {
        match (record.status, failure) {
            (TestStatus::Completed, _) => log::info!(
                "Test {} for {} completed in {}, results at {}",
                record.id,
                record.username,
                elapsed(record.duration.as_deref()),
                record
                    .results_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            (_, Some(reason)) => log::error!("Test {} for {} failed: {}", record.id, record.username, reason),
            (status, None) => log::warn!("Test {} for {} finished as {}", record.id, record.username, status),
        }
    }
}

// Stored durations are whole seconds or "N/A"
fn elapsed(duration: Option<&str>) -> String {
    match duration {
        Some(secs) if secs.parse::<i64>().is_ok() => format!("{}s", secs),
        _ => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_only_adds_unit_to_seconds() {
        assert_eq!(elapsed(Some("300")), "300s");
        assert_eq!(elapsed(Some("0")), "0s");
        assert_eq!(elapsed(Some("N/A")), "N/A");
        assert_eq!(elapsed(None), "N/A");
    }
}
