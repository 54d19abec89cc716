use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::protocol::{ChipReport, DeviceEvent};

/// Last reported state of one chip on the test bench
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChipState {
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// What the server currently knows about the test controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_status_check: Option<DateTime<Utc>>,
    pub chips: BTreeMap<String, ChipState>,
    pub unparseable_lines: u64,
}

impl DeviceState {
    /// Fold one device event into the state. Returns true if anything changed.
    pub fn apply(&mut self, event: &DeviceEvent, now: DateTime<Utc>) -> bool {
        match event {
            DeviceEvent::Heartbeat => {
                self.last_heartbeat = Some(now);
                true
            }
            DeviceEvent::StatusCheckRequest => {
                self.last_status_check = Some(now);
                true
            }
            DeviceEvent::ChipStatus(reports) => {
                for ChipReport { id, status } in reports {
                    self.chips.insert(
                        id.clone(),
                        ChipState {
                            status: status.clone(),
                            updated_at: now,
                        },
                    );
                }
                !reports.is_empty()
            }
            DeviceEvent::Unparseable { .. } => {
                self.unparseable_lines += 1;
                true
            }
            // Test lifecycle events belong to the queue
            DeviceEvent::TestStarted { .. }
            | DeviceEvent::ResultRow { .. }
            | DeviceEvent::TestCompleted { .. } => false,
        }
    }

    pub fn chip_status(&self, chip_id: &str) -> Option<&str> {
        self.chips.get(chip_id).map(|c| c.status.as_str())
    }
}
