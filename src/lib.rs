pub mod backend;
pub mod clock;
pub mod error;
pub mod models;
pub mod settings;
pub mod timer;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};

use backend::{ChangeNotifier, ChannelNotifier, RealtimeNotifier, RestFetcher};
use clock::SystemClock;
use models::Session;
use settings::SettingsStore;
use timer::{display::format_focus_time, RoomTimerController, RoomTimerEvent};

pub use utils::logging::init as init_logging;

#[derive(Debug, Parser)]
#[command(name = "studyroom", about = "Follow a shared pomodoro room from the terminal")]
pub struct Cli {
    /// Settings file; created with defaults by `--init-settings`.
    #[arg(long, default_value = "settings.json")]
    pub settings: PathBuf,

    /// Participant id of the signed-in viewer.
    #[arg(long)]
    pub viewer: Option<String>,

    /// Access token from the auth provider.
    #[arg(long, env = "STUDYROOM_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Follow this room from now on; saved to the settings file.
    #[arg(long)]
    pub room: Option<i64>,

    /// Write the settings file and exit.
    #[arg(long)]
    pub init_settings: bool,
}

pub fn run() -> Result<()> {
    init_logging(LevelFilter::Info);
    info!("Study room starting up...");

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(watch_room(cli))
}

async fn watch_room(cli: Cli) -> Result<()> {
    let store = SettingsStore::new(cli.settings.clone())?;
    if cli.init_settings {
        store.save()?;
        info!("Wrote settings to {}", store.path().display());
        return Ok(());
    }

    if let Some(room_id) = cli.room {
        store.update(|saved| saved.backend.room_id = Some(room_id))?;
        info!("Following room {room_id}");
    }

    let settings = store.settings();
    let viewer = cli
        .viewer
        .context("--viewer is required to join a room")?;
    let mut session = Session::new(viewer);
    if let Some(token) = cli.token {
        session = session.with_access_token(token);
    }

    let fetcher = RestFetcher::new(&settings.backend, &session, settings.sync.fetch_timeout())?;
    let notifier = ChannelNotifier::new();
    let realtime = if settings.backend.realtime {
        Some(RealtimeNotifier::spawn(&settings.backend, &session, notifier.clone())?)
    } else {
        info!("Realtime updates disabled; polling every {}s", settings.sync.fallback_interval_secs);
        None
    };
    let controller = RoomTimerController::new(
        Arc::new(fetcher),
        Arc::new(SystemClock),
        session,
        settings.sync.clone(),
    );

    let printer = tokio::spawn(print_events(controller.subscribe()));
    controller.start(notifier.subscribe()?).await?;
    info!("Commands: r = refresh, p = pause/resume, 0 = reset, q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "r" => {
                        notifier.notify();
                    }
                    "p" => {
                        if controller.toggle().await.is_none() {
                            warn!("Not in a room");
                        }
                    }
                    "0" => {
                        if controller.reset().await.is_none() {
                            warn!("Not in a room");
                        }
                    }
                    "q" => break,
                    "" => {}
                    other => warn!("Unknown command '{other}'"),
                },
                None => break,
            },
        }
    }

    controller.shutdown().await;
    if let Some(realtime) = realtime {
        realtime.shutdown().await;
    }
    printer.abort();
    info!("Study room stopped");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<RoomTimerEvent>) {
    loop {
        match events.recv().await {
            Ok(RoomTimerEvent::Heartbeat { view }) => info!(
                "room {} | {} {} | {:.0}% | {} here",
                view.room_id,
                view.state.phase.as_str(),
                view.display,
                view.progress * 100.0,
                view.participants.len()
            ),
            Ok(RoomTimerEvent::StateChanged { view }) => {
                debug!("{} {} ({:?})", view.state.phase.as_str(), view.display, view.status)
            }
            Ok(RoomTimerEvent::PhaseExpired { phase }) => {
                info!("Time's up: {} phase finished", phase.as_str())
            }
            Ok(RoomTimerEvent::LeftRoom) => warn!("You are no longer in the room"),
            Ok(RoomTimerEvent::StatsUpdated { stats }) => info!(
                "Focus today {} | this week {} ({:+}m vs last week) | total {}",
                format_focus_time(stats.daily_seconds),
                format_focus_time(stats.weekly_seconds),
                stats.weekly_delta_seconds() / 60,
                format_focus_time(stats.total_seconds)
            ),
            Ok(RoomTimerEvent::SyncFailed { message }) => warn!("Sync failed: {message}"),
            Err(RecvError::Lagged(skipped)) => debug!("Skipped {skipped} timer events"),
            Err(RecvError::Closed) => break,
        }
    }
}
