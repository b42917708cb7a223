use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::room::ParticipantId;

/// Aggregate focus time for one participant. Display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsSnapshot {
    pub participant_id: ParticipantId,
    pub daily_seconds: u64,
    pub weekly_seconds: u64,
    pub previous_weekly_seconds: u64,
    pub total_seconds: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserStatsSnapshot {
    pub fn empty(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            daily_seconds: 0,
            weekly_seconds: 0,
            previous_weekly_seconds: 0,
            total_seconds: 0,
            last_updated: None,
        }
    }

    /// Week-over-week change in focus seconds.
    pub fn weekly_delta_seconds(&self) -> i64 {
        self.weekly_seconds as i64 - self.previous_weekly_seconds as i64
    }
}
