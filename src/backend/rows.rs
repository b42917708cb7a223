//! Row shapes as served by the hosted database, and their validation into
//! the typed snapshots the engine works with.

use std::convert::TryFrom;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TimerError, TimerResult};
use crate::models::{Participant, ParticipantId, RoomSnapshot, UserStatsSnapshot};

const ID_KEYS: [&str; 3] = ["user_id", "id", "participant_id"];
const AVATAR_KEYS: [&str; 2] = ["avatar", "avatar_url"];

/// Unit the `session_time` / `break_time` columns are stored in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Seconds,
    Minutes,
}

impl Default for DurationUnit {
    fn default() -> Self {
        DurationUnit::Seconds
    }
}

impl DurationUnit {
    fn factor(&self) -> i64 {
        match self {
            DurationUnit::Seconds => 1,
            DurationUnit::Minutes => 60,
        }
    }
}

/// `pomodoro_rooms` row. Every column is optional here so a missing one is
/// reported as an invalid snapshot instead of a decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomRow {
    pub room_id: Option<i64>,
    pub session_time: Option<i64>,
    pub break_time: Option<i64>,
    pub is_break: Option<bool>,
    pub started_at: Option<String>,
    pub user_data: Option<Value>,
}

impl RoomRow {
    pub fn into_snapshot(self, unit: DurationUnit) -> TimerResult<RoomSnapshot> {
        let room_id = require(self.room_id, "room_id")?;
        let session = to_seconds(require(self.session_time, "session_time")?, unit, "session_time")?;
        let rest = to_seconds(require(self.break_time, "break_time")?, unit, "break_time")?;
        let started_raw = require(self.started_at, "started_at")?;
        let started_at = parse_timestamp(&started_raw, "started_at")?;
        let participants = match self.user_data {
            Some(value) => parse_participants(&value)?,
            None => Vec::new(),
        };

        Ok(RoomSnapshot::new(
            room_id,
            session,
            rest,
            self.is_break.unwrap_or(false),
            started_at,
        )
        .with_participants(participants))
    }
}

/// `user_stats` row. Null counters read as zero.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserStatsRow {
    pub daily_voice_time: Option<i64>,
    pub weekly_voice_time: Option<i64>,
    pub previous_weekly_voice_time: Option<i64>,
    pub total_voice_time: Option<i64>,
    pub last_updated: Option<String>,
}

impl UserStatsRow {
    pub fn into_stats(self, participant_id: ParticipantId) -> TimerResult<UserStatsSnapshot> {
        Ok(UserStatsSnapshot {
            participant_id,
            daily_seconds: counter(self.daily_voice_time, "daily_voice_time")?,
            weekly_seconds: counter(self.weekly_voice_time, "weekly_voice_time")?,
            previous_weekly_seconds: counter(
                self.previous_weekly_voice_time,
                "previous_weekly_voice_time",
            )?,
            total_seconds: counter(self.total_voice_time, "total_voice_time")?,
            last_updated: self
                .last_updated
                .as_deref()
                .map(|raw| parse_timestamp(raw, "last_updated"))
                .transpose()?,
        })
    }
}

fn require<T>(value: Option<T>, field: &str) -> TimerResult<T> {
    value.ok_or_else(|| TimerError::invalid(format!("missing {field}")))
}

fn to_seconds(value: i64, unit: DurationUnit, field: &str) -> TimerResult<u32> {
    if value < 0 {
        return Err(TimerError::invalid(format!("{field} is negative ({value})")));
    }
    let seconds = value
        .checked_mul(unit.factor())
        .ok_or_else(|| TimerError::invalid(format!("{field} overflows")))?;
    u32::try_from(seconds).map_err(|_| TimerError::invalid(format!("{field} out of range ({value})")))
}

fn counter(value: Option<i64>, field: &str) -> TimerResult<u64> {
    let raw = value.unwrap_or(0);
    u64::try_from(raw).map_err(|_| TimerError::invalid(format!("{field} is negative ({raw})")))
}

/// Accepts RFC 3339 and the space-separated forms Postgres emits for
/// `timestamptz` / `timestamp` columns. Naive values are read as UTC.
pub fn parse_timestamp(value: &str, field: &str) -> TimerResult<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(TimerError::invalid(format!("unparsable {field} '{value}'")))
}

/// Reads the room's `user_data` column into participants.
///
/// Two layouts are in use: a list of member objects, or an object keyed by
/// member id.
pub fn parse_participants(value: &Value) -> TimerResult<Vec<Participant>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(participant_from_entry).collect(),
        Value::Object(map) => map
            .iter()
            .map(|(id, entry)| {
                let id = non_empty_id(id.clone())?;
                let avatar = match entry {
                    Value::String(url) => Some(url.clone()),
                    Value::Object(fields) => avatar_from(fields),
                    _ => None,
                };
                Ok(Participant::new(id, avatar))
            })
            .collect(),
        other => Err(TimerError::invalid(format!(
            "user_data must be a list or object, got {}",
            kind(other)
        ))),
    }
}

fn participant_from_entry(entry: &Value) -> TimerResult<Participant> {
    match entry {
        Value::Object(fields) => {
            let id = ID_KEYS
                .iter()
                .find_map(|key| fields.get(*key).and_then(id_from))
                .ok_or_else(|| TimerError::invalid("user_data entry without id"))?;
            Ok(Participant::new(non_empty_id(id)?, avatar_from(fields)))
        }
        scalar => {
            let id = id_from(scalar).ok_or_else(|| {
                TimerError::invalid(format!("user_data entry is {}", kind(scalar)))
            })?;
            Ok(Participant::new(non_empty_id(id)?, None))
        }
    }
}

fn id_from(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn non_empty_id(id: String) -> TimerResult<String> {
    if id.trim().is_empty() {
        Err(TimerError::invalid("user_data entry with empty id"))
    } else {
        Ok(id)
    }
}

fn avatar_from(fields: &Map<String, Value>) -> Option<String> {
    AVATAR_KEYS
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
