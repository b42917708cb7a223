use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{SnapshotFetcher, Subscription},
    clock::SharedClock,
    error::{TimerError, TimerResult},
    models::{Participant, Phase, RoomSnapshot, Session, UserStatsSnapshot},
    settings::SyncSettings,
};

use super::{
    display::format_countdown,
    engine::{ReconciliationEngine, SyncOutcome},
    TimerState, TimerStatus,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What the presentation layer renders.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub room_id: i64,
    pub state: TimerState,
    pub status: TimerStatus,
    pub progress: f64,
    pub display: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RoomTimerEvent {
    StateChanged { view: TimerView },
    Heartbeat { view: TimerView },
    PhaseExpired { phase: Phase },
    LeftRoom,
    StatsUpdated { stats: UserStatsSnapshot },
    SyncFailed { message: String },
}

/// Drops fetch responses retrieved before the last one applied. Only a
/// response the engine accepted moves the mark forward.
#[derive(Debug, Default)]
pub struct SyncGate {
    last_applied: Option<DateTime<Utc>>,
}

impl SyncGate {
    pub fn is_stale(&self, retrieved_at: DateTime<Utc>) -> bool {
        matches!(self.last_applied, Some(last) if retrieved_at < last)
    }

    pub fn commit(&mut self, retrieved_at: DateTime<Utc>) {
        if !self.is_stale(retrieved_at) {
            self.last_applied = Some(retrieved_at);
        }
    }

    pub fn last_applied(&self) -> Option<DateTime<Utc>> {
        self.last_applied
    }
}

struct RoomState {
    engine: ReconciliationEngine,
    gate: SyncGate,
    stats: Option<UserStatsSnapshot>,
}

impl RoomState {
    fn view(&self) -> Option<TimerView> {
        let state = self.engine.state()?.clone();
        let room = self.engine.room()?;
        Some(TimerView {
            room_id: room.room_id,
            status: state.status(),
            progress: self.engine.progress(),
            display: format_countdown(state.remaining_seconds),
            participants: room.participants().cloned().collect(),
            state,
        })
    }
}

fn backoff_with_jitter(settings: &SyncSettings, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    let backoff = settings
        .base_backoff_ms
        .saturating_mul(1_u64 << exp)
        .min(settings.max_backoff_ms);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}

/// Keeps one viewer's countdown in step with the shared room.
///
/// Re-syncs on every change signal, on a fallback interval, and on a shorter
/// poll after a phase runs out, and ticks the engine once per second in
/// between. Engine access is serialized through one lock that is never held
/// across I/O.
#[derive(Clone)]
pub struct RoomTimerController {
    state: Arc<Mutex<RoomState>>,
    fetcher: Arc<dyn SnapshotFetcher>,
    clock: SharedClock,
    session: Arc<Session>,
    settings: SyncSettings,
    events: broadcast::Sender<RoomTimerEvent>,
    resync_due: Arc<watch::Sender<bool>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RoomTimerController {
    pub fn new(
        fetcher: Arc<dyn SnapshotFetcher>,
        clock: SharedClock,
        session: Session,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (resync_due, _) = watch::channel(false);

        Self {
            state: Arc::new(Mutex::new(RoomState {
                engine: ReconciliationEngine::new(clock.clone()),
                gate: SyncGate::default(),
                stats: None,
            })),
            fetcher,
            clock,
            session: Arc::new(session),
            settings,
            events,
            resync_due: Arc::new(resync_due),
            ticker: Arc::new(Mutex::new(None)),
            driver: Arc::new(Mutex::new(None)),
            started: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomTimerEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn view(&self) -> Option<TimerView> {
        self.state.lock().await.view()
    }

    pub async fn stats(&self) -> Option<UserStatsSnapshot> {
        self.state.lock().await.stats.clone()
    }

    /// True while a phase has run out and the room has not moved on yet.
    pub fn resync_due(&self) -> bool {
        *self.resync_due.borrow()
    }

    /// Initial sync, then the ticker and the driver loop.
    pub async fn start(&self, subscription: Subscription) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("controller has been shut down");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("room driver already running");
        }

        if let Err(err) = self.refresh().await {
            log_warn!("Initial room sync failed: {err}");
        }
        self.refresh_stats().await;

        self.spawn_ticker().await;

        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.drive(subscription).await });
        *self.driver.lock().await = Some(handle);

        log_info!("Room driver started for viewer {}", self.session.viewer_id);
        Ok(())
    }

    /// Stops the loop and the ticker and closes the change subscription.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log_error!("Room driver task failed to join: {err}");
            }
        }
        self.cancel_ticker().await;
    }

    /// Fetches the room and applies it.
    ///
    /// `Ok(None)` means a newer response had already been applied.
    pub async fn refresh(&self) -> TimerResult<Option<SyncOutcome>> {
        let retrieved_at = self.clock.now();
        let fetcher = self.fetcher.clone();
        let snapshot = match self
            .with_retry("room snapshot", || fetcher.fetch_room_snapshot())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.emit(RoomTimerEvent::SyncFailed {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        self.apply(snapshot, retrieved_at).await
    }

    /// Applies a snapshot retrieved at `retrieved_at`.
    pub async fn apply(
        &self,
        snapshot: Option<RoomSnapshot>,
        retrieved_at: DateTime<Utc>,
    ) -> TimerResult<Option<SyncOutcome>> {
        let (outcome, view, was_in_room) = {
            let mut guard = self.state.lock().await;
            if guard.gate.is_stale(retrieved_at) {
                log_info!("Discarding room snapshot retrieved at {retrieved_at}; newer one applied");
                return Ok(None);
            }
            let was_in_room = guard.engine.in_room();
            match guard.engine.sync(snapshot.as_ref(), &self.session.viewer_id) {
                Ok(outcome) => {
                    guard.gate.commit(retrieved_at);
                    (outcome, guard.view(), was_in_room)
                }
                Err(err) => {
                    drop(guard);
                    log_warn!("Keeping previous timer state: {err}");
                    self.emit(RoomTimerEvent::SyncFailed {
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        };

        match &outcome {
            SyncOutcome::InRoom(state) => {
                self.resync_due.send_replace(state.remaining_seconds == 0);
                if let Some(view) = view {
                    self.emit(RoomTimerEvent::StateChanged { view });
                }
            }
            SyncOutcome::NotInRoom => {
                self.resync_due.send_replace(false);
                if was_in_room {
                    log_info!("Viewer {} is no longer in the room", self.session.viewer_id);
                    self.emit(RoomTimerEvent::LeftRoom);
                }
            }
        }

        Ok(Some(outcome))
    }

    /// Fetches the viewer's focus statistics. Failures are reported, not returned.
    pub async fn refresh_stats(&self) -> Option<UserStatsSnapshot> {
        let fetcher = self.fetcher.clone();
        let viewer = self.session.viewer_id.clone();
        let fetched = self
            .with_retry("user stats", || fetcher.fetch_user_stats(&viewer))
            .await;

        match fetched {
            Ok(stats) => {
                let stats = stats.unwrap_or_else(|| UserStatsSnapshot::empty(viewer.clone()));
                self.state.lock().await.stats = Some(stats.clone());
                self.emit(RoomTimerEvent::StatsUpdated {
                    stats: stats.clone(),
                });
                Some(stats)
            }
            Err(err) => {
                log_warn!("Failed to refresh stats for {viewer}: {err}");
                self.emit(RoomTimerEvent::SyncFailed {
                    message: err.to_string(),
                });
                None
            }
        }
    }

    pub async fn toggle(&self) -> Option<TimerState> {
        let (state, view) = {
            let mut guard = self.state.lock().await;
            let state = guard.engine.toggle()?;
            (state, guard.view())
        };
        if let Some(view) = view {
            self.emit(RoomTimerEvent::StateChanged { view });
        }
        Some(state)
    }

    pub async fn reset(&self) -> Option<TimerState> {
        let (state, view) = {
            let mut guard = self.state.lock().await;
            let state = guard.engine.reset()?;
            (state, guard.view())
        };
        self.resync_due.send_replace(state.remaining_seconds == 0);
        if let Some(view) = view {
            self.emit(RoomTimerEvent::StateChanged { view });
        }
        Some(state)
    }

    async fn drive(&self, mut subscription: Subscription) {
        let fallback_every = self.settings.fallback_interval();
        let expiry_every = self.settings.expiry_poll_interval();

        let mut fallback = time::interval_at(Instant::now() + fallback_every, fallback_every);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry_poll = time::interval_at(Instant::now() + expiry_every, expiry_every);
        expiry_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync_rx = self.resync_due.subscribe();

        loop {
            let awaiting_resync = *resync_rx.borrow();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log_info!("Room driver shutting down");
                    break;
                }
                signal = subscription.next() => match signal {
                    Some(_) => self.refresh_logged("change notification").await,
                    None => {
                        log_info!("Change subscription {} closed; stopping room driver", subscription.id());
                        break;
                    }
                },
                _ = fallback.tick() => {
                    self.refresh_logged("fallback interval").await;
                    self.refresh_stats().await;
                }
                changed = resync_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *resync_rx.borrow_and_update() {
                        expiry_poll.reset();
                    }
                }
                _ = expiry_poll.tick(), if awaiting_resync => {
                    self.refresh_logged("phase expiry").await;
                }
            }
        }

        subscription.close();
        self.cancel.cancel();
        self.cancel_ticker().await;
    }

    async fn refresh_logged(&self, reason: &str) {
        match self.refresh().await {
            Ok(Some(SyncOutcome::InRoom(state))) => log_info!(
                "Synced on {reason}: {} {} left (running={})",
                state.phase.as_str(),
                format_countdown(state.remaining_seconds),
                state.running
            ),
            Ok(Some(SyncOutcome::NotInRoom)) => log_info!("Synced on {reason}: not in room"),
            Ok(None) => {}
            Err(err) => log_warn!("Sync on {reason} failed: {err}"),
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> TimerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TimerResult<T>>,
    {
        let max_attempts = self.settings.max_fetch_attempts.max(1);
        let timeout = self.settings.fetch_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TimerError::Transient(format!("{what} fetch cancelled")));
                }
                timed = time::timeout(timeout, op()) => match timed {
                    Ok(result) => result,
                    Err(_) => Err(TimerError::Transient(format!(
                        "{what} fetch timed out after {}s",
                        timeout.as_secs()
                    ))),
                },
            };

            match result {
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = backoff_with_jitter(&self.settings, attempt);
                    log_warn!(
                        "{what} fetch attempt {attempt}/{max_attempts} failed: {err}; retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(err),
                        _ = time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let events = self.events.clone();
        let resync_due = self.resync_due.clone();
        let cancel = self.cancel.clone();
        let tick_interval = self.settings.tick_interval();
        let heartbeat_every = self.settings.heartbeat_every_ticks.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
            let mut ticks: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let (outcome, view) = {
                    let mut guard = state.lock().await;
                    let outcome = guard.engine.tick();
                    (outcome, guard.view())
                };
                let (Some(outcome), Some(view)) = (outcome, view) else {
                    continue;
                };

                if let Some(phase) = outcome.expired {
                    log_info!("{} phase ran out; waiting for the room to move on", phase.as_str());
                    resync_due.send_replace(true);
                    let _ = events.send(RoomTimerEvent::StateChanged { view });
                    let _ = events.send(RoomTimerEvent::PhaseExpired { phase });
                    continue;
                }

                if !outcome.state.running {
                    continue;
                }

                ticks = ticks.wrapping_add(1);
                if ticks % heartbeat_every == 0 {
                    let _ = events.send(RoomTimerEvent::Heartbeat { view: view.clone() });
                }
                let _ = events.send(RoomTimerEvent::StateChanged { view });
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    fn emit(&self, event: RoomTimerEvent) {
        let _ = self.events.send(event);
    }
}
