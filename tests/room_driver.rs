use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use studyroom_lib::backend::{ChangeNotifier, ChannelNotifier, SnapshotFetcher};
use studyroom_lib::clock::ManualClock;
use studyroom_lib::error::{TimerError, TimerResult};
use studyroom_lib::models::{
    Participant, ParticipantId, Phase, RoomSnapshot, Session, UserStatsSnapshot,
    MAX_PHASE_SECONDS,
};
use studyroom_lib::settings::SyncSettings;
use studyroom_lib::timer::{RoomTimerController, RoomTimerEvent, SyncOutcome};

const VIEWER: &str = "1001";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn room(is_break: bool, members: &[&str]) -> RoomSnapshot {
    RoomSnapshot::new(5, 1500, 300, is_break, t0())
        .with_participants(members.iter().map(|id| Participant::new(*id, None)))
}

/// Serves queued responses in order; the last one repeats.
#[derive(Default)]
struct ScriptedFetcher {
    rooms: Mutex<VecDeque<TimerResult<Option<RoomSnapshot>>>>,
    room_calls: Mutex<usize>,
    stats_calls: Mutex<usize>,
}

impl ScriptedFetcher {
    fn push(&self, response: TimerResult<Option<RoomSnapshot>>) {
        self.rooms.lock().unwrap().push_back(response);
    }

    fn replace(&self, response: TimerResult<Option<RoomSnapshot>>) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.clear();
        rooms.push_back(response);
    }

    fn room_calls(&self) -> usize {
        *self.room_calls.lock().unwrap()
    }

    fn stats_calls(&self) -> usize {
        *self.stats_calls.lock().unwrap()
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedFetcher {
    async fn fetch_room_snapshot(&self) -> TimerResult<Option<RoomSnapshot>> {
        *self.room_calls.lock().unwrap() += 1;
        let mut rooms = self.rooms.lock().unwrap();
        if rooms.len() > 1 {
            rooms.pop_front().unwrap()
        } else {
            rooms.front().cloned().unwrap_or(Ok(None))
        }
    }

    async fn fetch_user_stats(
        &self,
        participant: &ParticipantId,
    ) -> TimerResult<Option<UserStatsSnapshot>> {
        *self.stats_calls.lock().unwrap() += 1;
        let mut stats = UserStatsSnapshot::empty(participant.clone());
        stats.daily_seconds = 1800;
        Ok(Some(stats))
    }
}

fn controller(fetcher: Arc<ScriptedFetcher>, clock: &ManualClock) -> RoomTimerController {
    RoomTimerController::new(
        fetcher,
        Arc::new(clock.clone()),
        Session::new(VIEWER),
        SyncSettings::default(),
    )
}

async fn wait_for<F>(events: &mut broadcast::Receiver<RoomTimerEvent>, mut pred: F) -> RoomTimerEvent
where
    F: FnMut(&RoomTimerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test(start_paused = true)]
async fn start_syncs_and_ticks_locally() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(100));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER, "2002"]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);

    controller.start(notifier.subscribe().unwrap()).await.unwrap();

    let view = controller.view().await.unwrap();
    assert_eq!(view.state.remaining_seconds, 1400);
    assert_eq!(view.display, "23:20");
    assert_eq!(view.participants.len(), 2);
    assert_eq!(controller.stats().await.unwrap().daily_seconds, 1800);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let view = controller.view().await.unwrap();
    assert_eq!(view.state.remaining_seconds, 1397);
    assert_eq!(fetcher.room_calls(), 1);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn notification_triggers_resync() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(1500));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);
    let mut events = controller.subscribe();

    controller.start(notifier.subscribe().unwrap()).await.unwrap();
    let view = controller.view().await.unwrap();
    assert_eq!(view.state.remaining_seconds, 0);
    assert!(!view.state.running);
    assert!(controller.resync_due());

    clock.advance_secs(100);
    fetcher.replace(Ok(Some(room(true, &[VIEWER]))));
    notifier.notify();

    let event = wait_for(&mut events, |event| {
        matches!(event, RoomTimerEvent::StateChanged { view } if view.state.phase == Phase::Break)
    })
    .await;
    let RoomTimerEvent::StateChanged { view } = event else {
        unreachable!()
    };
    assert_eq!(view.state.remaining_seconds, 200);
    assert!(view.state.running);
    assert!(!controller.resync_due());

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_polls_until_room_moves_on() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(1498));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);
    let mut events = controller.subscribe();

    controller.start(notifier.subscribe().unwrap()).await.unwrap();

    let expired = wait_for(&mut events, |event| {
        matches!(event, RoomTimerEvent::PhaseExpired { .. })
    })
    .await;
    assert_eq!(expired, RoomTimerEvent::PhaseExpired { phase: Phase::Focus });
    assert!(controller.resync_due());

    clock.advance_secs(12);
    fetcher.replace(Ok(Some(room(true, &[VIEWER]))));

    wait_for(&mut events, |event| {
        matches!(event, RoomTimerEvent::StateChanged { view } if view.state.phase == Phase::Break)
    })
    .await;
    let view = controller.view().await.unwrap();
    assert!(view.state.running);
    assert!(view.state.remaining_seconds <= 290);
    assert!(!controller.resync_due());
    // initial sync plus at least one expiry poll, well before the 30s fallback
    assert!(fetcher.room_calls() >= 2);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_viewer_leaves_room() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER, "2002"]))));
    let controller = controller(fetcher.clone(), &clock);
    let mut events = controller.subscribe();

    controller.refresh().await.unwrap();
    assert!(controller.view().await.is_some());

    fetcher.replace(Ok(Some(room(false, &["2002"]))));
    clock.advance_secs(1);
    let outcome = controller.refresh().await.unwrap();
    assert_eq!(outcome, Some(SyncOutcome::NotInRoom));
    assert!(controller.view().await.is_none());
    assert!(controller.toggle().await.is_none());

    wait_for(&mut events, |event| matches!(event, RoomTimerEvent::LeftRoom)).await;
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Err(TimerError::Transient("connection reset".into())));
    fetcher.push(Err(TimerError::Transient("503".into())));
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let controller = controller(fetcher.clone(), &clock);

    let outcome = controller.refresh().await.unwrap();
    assert!(matches!(outcome, Some(SyncOutcome::InRoom(_))));
    assert_eq!(fetcher.room_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_state_untouched() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let controller = controller(fetcher.clone(), &clock);
    controller.refresh().await.unwrap();
    let before = controller.view().await;

    fetcher.replace(Err(TimerError::Transient("timeout".into())));
    let err = controller.refresh().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(fetcher.room_calls(), 1 + SyncSettings::default().max_fetch_attempts as usize);
    assert_eq!(controller.view().await, before);
}

#[tokio::test]
async fn backend_errors_are_not_retried() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Err(TimerError::Backend("401 Unauthorized".into())));
    let controller = controller(fetcher.clone(), &clock);

    assert!(controller.refresh().await.is_err());
    assert_eq!(fetcher.room_calls(), 1);
}

#[tokio::test]
async fn invalid_snapshot_keeps_last_good_state() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(60));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    fetcher.push(Err(TimerError::invalid("missing started_at")));
    let controller = controller(fetcher.clone(), &clock);

    controller.refresh().await.unwrap();
    let err = controller.refresh().await.unwrap_err();
    assert!(matches!(err, TimerError::InvalidSnapshot(_)));
    assert_eq!(controller.view().await.unwrap().state.remaining_seconds, 1440);
}

#[tokio::test]
async fn stale_response_is_discarded() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(1600));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let controller = controller(fetcher, &clock);

    let newer = room(true, &[VIEWER]);
    let older = room(false, &[VIEWER]);
    let applied = controller
        .apply(Some(newer), t0() + chrono::Duration::seconds(1599))
        .await
        .unwrap();
    assert!(applied.is_some());

    let discarded = controller
        .apply(Some(older), t0() + chrono::Duration::seconds(1590))
        .await
        .unwrap();
    assert_eq!(discarded, None);
    assert_eq!(controller.view().await.unwrap().state.phase, Phase::Break);
}

#[tokio::test]
async fn rejected_snapshot_does_not_block_older_valid_one() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(100));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let controller = controller(fetcher, &clock);

    let oversized = RoomSnapshot::new(5, MAX_PHASE_SECONDS + 1, 300, false, t0())
        .with_participants([Participant::new(VIEWER, None)]);
    let err = controller
        .apply(Some(oversized), t0() + chrono::Duration::seconds(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TimerError::InvalidSnapshot(_)));

    let applied = controller
        .apply(Some(room(false, &[VIEWER])), t0() + chrono::Duration::seconds(90))
        .await
        .unwrap();
    assert!(matches!(applied, Some(SyncOutcome::InRoom(_))));
    assert_eq!(controller.view().await.unwrap().state.remaining_seconds, 1400);
}

#[tokio::test]
async fn toggle_and_reset_are_local() {
    let clock = ManualClock::new(t0() + chrono::Duration::seconds(300));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let controller = controller(fetcher.clone(), &clock);
    controller.refresh().await.unwrap();

    let paused = controller.toggle().await.unwrap();
    assert!(!paused.running);
    assert_eq!(paused.remaining_seconds, 1200);

    clock.advance_secs(20);
    let reset = controller.reset().await.unwrap();
    assert!(reset.running);
    assert_eq!(reset.remaining_seconds, 1180);
    assert_eq!(fetcher.room_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_subscription_stops_the_driver() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);

    controller.start(notifier.subscribe().unwrap()).await.unwrap();
    drop(notifier);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let remaining = controller.view().await.unwrap().state.remaining_seconds;

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(fetcher.room_calls(), 1);
    assert_eq!(controller.view().await.unwrap().state.remaining_seconds, remaining);

    assert!(controller.start(ChannelNotifier::new().subscribe().unwrap()).await.is_err());
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fallback_interval_resyncs_without_notifications() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);

    controller.start(notifier.subscribe().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(fetcher.room_calls(), 2);

    controller.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fetcher.room_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn busy_room_still_gets_fallback_syncs_and_stats() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);

    controller.start(notifier.subscribe().unwrap()).await.unwrap();
    assert_eq!(fetcher.stats_calls(), 1);

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        notifier.notify();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    // fallback fired at 30, 60, 90 and 120 s despite a signal every 20 s
    assert!(fetcher.stats_calls() >= 5);
    assert!(fetcher.room_calls() >= 1 + 6 + 4);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_spawn_one_driver() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(Some(room(false, &[VIEWER]))));
    let notifier = ChannelNotifier::new();
    let controller = controller(fetcher.clone(), &clock);

    let (first, second) = tokio::join!(
        controller.start(notifier.subscribe().unwrap()),
        controller.start(notifier.subscribe().unwrap()),
    );
    assert!(first.is_ok() != second.is_ok());
    assert_eq!(fetcher.room_calls(), 1);

    controller.shutdown().await;
}

/// Never answers; counts how often it was asked.
#[derive(Default)]
struct HangingFetcher {
    calls: Mutex<usize>,
}

#[async_trait]
impl SnapshotFetcher for HangingFetcher {
    async fn fetch_room_snapshot(&self) -> TimerResult<Option<RoomSnapshot>> {
        *self.calls.lock().unwrap() += 1;
        std::future::pending().await
    }

    async fn fetch_user_stats(
        &self,
        _participant: &ParticipantId,
    ) -> TimerResult<Option<UserStatsSnapshot>> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_an_in_flight_fetch() {
    let clock = ManualClock::new(t0());
    let fetcher = Arc::new(HangingFetcher::default());
    let controller = RoomTimerController::new(
        fetcher.clone(),
        Arc::new(clock.clone()),
        Session::new(VIEWER),
        SyncSettings::default(),
    );

    let refreshing = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.refresh().await })
    };
    while *fetcher.calls.lock().unwrap() == 0 {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    controller.shutdown().await;
    let result = refreshing.await.unwrap();

    assert!(result.unwrap_err().is_transient());
    assert!(started.elapsed() < SyncSettings::default().fetch_timeout());
    assert_eq!(*fetcher.calls.lock().unwrap(), 1);
}
