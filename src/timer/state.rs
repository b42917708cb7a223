use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Phase;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    Running,
    Paused,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub phase: Phase,
    pub remaining_seconds: u32,
    pub running: bool,
    pub last_synced_at: DateTime<Utc>,
}

impl TimerState {
    pub fn synced(phase: Phase, remaining_seconds: u32, synced_at: DateTime<Utc>) -> Self {
        Self {
            phase,
            remaining_seconds,
            running: remaining_seconds > 0,
            last_synced_at: synced_at,
        }
    }

    pub fn status(&self) -> TimerStatus {
        if self.remaining_seconds == 0 {
            TimerStatus::Expired
        } else if self.running {
            TimerStatus::Running
        } else {
            TimerStatus::Paused
        }
    }

    /// Moves the countdown one second. Returns true when this call took it to zero.
    pub fn advance_one(&mut self) -> bool {
        if !self.running {
            return false;
        }
        if self.remaining_seconds == 0 {
            self.running = false;
            return false;
        }
        self.remaining_seconds -= 1;
        if self.remaining_seconds == 0 {
            self.running = false;
            return true;
        }
        false
    }

    pub fn toggle(&mut self) {
        self.running = !self.running;
    }
}
