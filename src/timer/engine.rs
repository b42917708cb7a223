//! Countdown reconciliation against server-authoritative room state.
//!
//! The engine owns the viewer's [`TimerState`]. A sync replaces it from a
//! [`RoomSnapshot`] and the clock; ticks move it locally between syncs. It does
//! no I/O and never blocks, so callers can hold a lock across each call.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::TimerResult;
use crate::models::{ParticipantId, Phase, RoomSnapshot};

use super::state::TimerState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "state")]
pub enum SyncOutcome {
    InRoom(TimerState),
    NotInRoom,
}

impl SyncOutcome {
    pub fn state(&self) -> Option<&TimerState> {
        match self {
            SyncOutcome::InRoom(state) => Some(state),
            SyncOutcome::NotInRoom => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub state: TimerState,
    /// Set on the tick that took the countdown to zero; carries the phase that ended.
    pub expired: Option<Phase>,
}

/// Seconds left in the snapshot's current phase at `now`.
///
/// Break time is measured from the end of the focus window, both anchored on
/// `session_started_at`. A start time in the future counts as zero elapsed.
pub fn remaining_seconds(snapshot: &RoomSnapshot, now: DateTime<Utc>) -> u32 {
    let elapsed = (now - snapshot.session_started_at).num_seconds().max(0);
    let session = i64::from(snapshot.session_duration_seconds);

    let remaining = match snapshot.phase() {
        Phase::Focus => (session - elapsed).max(0),
        Phase::Break => {
            let rest = i64::from(snapshot.break_duration_seconds);
            (session + rest - elapsed).clamp(0, rest)
        }
    };

    // bounded by a u32 duration above
    remaining as u32
}

/// Fraction of the phase already spent, in `0.0..=1.0`. Zero for an empty phase.
pub fn progress_ratio(total_seconds: u32, remaining_seconds: u32) -> f64 {
    if total_seconds == 0 {
        return 0.0;
    }
    let spent = total_seconds.saturating_sub(remaining_seconds);
    f64::from(spent) / f64::from(total_seconds)
}

pub struct ReconciliationEngine {
    clock: SharedClock,
    room: Option<RoomSnapshot>,
    state: Option<TimerState>,
}

impl ReconciliationEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            room: None,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&TimerState> {
        self.state.as_ref()
    }

    pub fn room(&self) -> Option<&RoomSnapshot> {
        self.room.as_ref()
    }

    pub fn in_room(&self) -> bool {
        self.state.is_some()
    }

    /// Replaces the local countdown from `snapshot`.
    ///
    /// An invalid snapshot leaves the current state untouched.
    pub fn sync(
        &mut self,
        snapshot: Option<&RoomSnapshot>,
        viewer_id: &ParticipantId,
    ) -> TimerResult<SyncOutcome> {
        let Some(snapshot) = snapshot else {
            self.leave();
            return Ok(SyncOutcome::NotInRoom);
        };

        snapshot.validate()?;

        if !snapshot.contains(viewer_id) {
            self.leave();
            return Ok(SyncOutcome::NotInRoom);
        }

        let state = self.derive(snapshot);
        self.room = Some(snapshot.clone());
        self.state = Some(state.clone());
        Ok(SyncOutcome::InRoom(state))
    }

    /// Advances one second while running. `None` when the viewer is not in a room.
    pub fn tick(&mut self) -> Option<TickOutcome> {
        let state = self.state.as_mut()?;
        let phase = state.phase;
        let expired = state.advance_one().then_some(phase);
        Some(TickOutcome {
            state: state.clone(),
            expired,
        })
    }

    /// Local pause/resume. Not shared with the room; the next sync overrides it.
    pub fn toggle(&mut self) -> Option<TimerState> {
        let state = self.state.as_mut()?;
        state.toggle();
        Some(state.clone())
    }

    /// Recomputes from the last snapshot, dropping locally ticked time.
    pub fn reset(&mut self) -> Option<TimerState> {
        let room = self.room.as_ref()?;
        let state = self.derive(room);
        self.state = Some(state.clone());
        Some(state)
    }

    pub fn progress(&self) -> f64 {
        match (&self.room, &self.state) {
            (Some(room), Some(state)) => {
                let total = match state.phase {
                    Phase::Focus => room.session_duration_seconds,
                    Phase::Break => room.break_duration_seconds,
                };
                progress_ratio(total, state.remaining_seconds)
            }
            _ => 0.0,
        }
    }

    fn derive(&self, snapshot: &RoomSnapshot) -> TimerState {
        let now = self.clock.now();
        TimerState::synced(snapshot.phase(), remaining_seconds(snapshot, now), now)
    }

    fn leave(&mut self) {
        self.room = None;
        self.state = None;
    }
}
