use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TimerError, TimerResult};

/// Longest focus or break window a room may declare.
pub const MAX_PHASE_SECONDS: u32 = 24 * 60 * 60;

const FALLBACK_AVATAR_BASE: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub avatar: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            avatar,
        }
    }

    /// Avatar to render, falling back to a generated one seeded by the id.
    pub fn avatar_url(&self) -> String {
        match &self.avatar {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("{FALLBACK_AVATAR_BASE}{}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Focus,
    Break,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Focus
    }
}

impl Phase {
    pub fn from_is_break(is_break: bool) -> Self {
        if is_break {
            Phase::Break
        } else {
            Phase::Focus
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Focus => "focus",
            Phase::Break => "break",
        }
    }
}

/// Server-authoritative room state. Replaced wholesale on every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: i64,
    pub session_duration_seconds: u32,
    pub break_duration_seconds: u32,
    pub is_break: bool,
    pub session_started_at: DateTime<Utc>,
    participants: BTreeMap<ParticipantId, Participant>,
}

impl RoomSnapshot {
    pub fn new(
        room_id: i64,
        session_duration_seconds: u32,
        break_duration_seconds: u32,
        is_break: bool,
        session_started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            room_id,
            session_duration_seconds,
            break_duration_seconds,
            is_break,
            session_started_at,
            participants: BTreeMap::new(),
        }
    }

    /// Adds participants; a repeated id replaces the earlier entry.
    pub fn with_participants(mut self, participants: impl IntoIterator<Item = Participant>) -> Self {
        for participant in participants {
            self.participants.insert(participant.id.clone(), participant);
        }
        self
    }

    pub fn phase(&self) -> Phase {
        Phase::from_is_break(self.is_break)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn contains(&self, viewer_id: &ParticipantId) -> bool {
        self.participants.contains_key(viewer_id)
    }

    /// Length of the current phase window in seconds.
    pub fn phase_total_seconds(&self) -> u32 {
        match self.phase() {
            Phase::Focus => self.session_duration_seconds,
            Phase::Break => self.break_duration_seconds,
        }
    }

    pub fn validate(&self) -> TimerResult<()> {
        if self.session_duration_seconds > MAX_PHASE_SECONDS {
            return Err(TimerError::invalid(format!(
                "session duration {}s exceeds {}s",
                self.session_duration_seconds, MAX_PHASE_SECONDS
            )));
        }
        if self.break_duration_seconds > MAX_PHASE_SECONDS {
            return Err(TimerError::invalid(format!(
                "break duration {}s exceeds {}s",
                self.break_duration_seconds, MAX_PHASE_SECONDS
            )));
        }
        if self.participants.keys().any(|id| id.as_str().trim().is_empty()) {
            return Err(TimerError::invalid("participant with empty id"));
        }
        Ok(())
    }
}
