//! Change signals pushed over the hosted database's realtime websocket
//! (Phoenix channel protocol, `postgres_changes` on `pomodoro_rooms`).

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::models::Session;
use crate::settings::BackendSettings;

use super::notifier::{ChangeNotifier, ChannelNotifier, Subscription};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const TOPIC: &str = "realtime:public:pomodoro_rooms";
const JOIN_REF: &str = "1";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChannelMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Joined,
    Rejected(String),
    Change,
    Other,
}

fn classify(text: &str) -> Frame {
    let Ok(message) = serde_json::from_str::<ChannelMessage>(text) else {
        return Frame::Other;
    };
    if message.topic != TOPIC {
        return Frame::Other;
    }
    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(JOIN_REF) => {
            match message.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Frame::Joined,
                _ => Frame::Rejected(message.payload["response"].to_string()),
            }
        }
        "postgres_changes" | "INSERT" | "UPDATE" | "DELETE" => Frame::Change,
        "phx_error" | "phx_close" => Frame::Rejected(message.event.clone()),
        _ => Frame::Other,
    }
}

/// `{base}/realtime/v1/websocket` with the websocket scheme matching the
/// REST scheme.
fn realtime_url(backend: &BackendSettings) -> Result<Url> {
    let base = backend.url.trim().trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/realtime/v1/websocket"))
        .with_context(|| format!("invalid backend url '{base}'"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("unsupported backend scheme '{other}'"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch '{base}' to {scheme}"))?;
    url.query_pairs_mut()
        .append_pair("apikey", &backend.anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

fn join_message(room_id: Option<i64>, access_token: &str) -> String {
    let mut change = json!({ "event": "*", "schema": "public", "table": "pomodoro_rooms" });
    if let Some(room_id) = room_id {
        change["filter"] = json!(format!("room_id=eq.{room_id}"));
    }
    json!({
        "topic": TOPIC,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
    })
    .to_string()
}

fn heartbeat_message(sequence: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": format!("hb-{sequence}"),
    })
    .to_string()
}

fn reconnect_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    RECONNECT_BASE.saturating_mul(1 << exp).min(RECONNECT_MAX)
}

/// Listens for `pomodoro_rooms` changes and forwards each one as a
/// [`RoomChanged`](super::RoomChanged) signal. Reconnects until shut down;
/// every successful (re)join also emits a signal since changes may have been
/// missed while disconnected.
pub struct RealtimeNotifier {
    channel: ChannelNotifier,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RealtimeNotifier {
    pub fn spawn(
        backend: &BackendSettings,
        session: &Session,
        channel: ChannelNotifier,
    ) -> Result<Self> {
        let url = realtime_url(backend)?;
        let token = session
            .access_token
            .clone()
            .unwrap_or_else(|| backend.anon_key.clone());
        let join = join_message(backend.room_id, &token);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(url, join, channel.clone(), cancel.clone()));
        Ok(Self {
            channel,
            cancel,
            task,
        })
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            log_warn!("Realtime listener failed to join: {err}");
        }
    }
}

impl ChangeNotifier for RealtimeNotifier {
    fn subscribe(&self) -> Result<Subscription> {
        self.channel.subscribe()
    }
}

async fn run(url: Url, join: String, channel: ChannelNotifier, cancel: CancellationToken) {
    let mut failures: u32 = 0;
    loop {
        let result = listen(&url, &join, &channel, &cancel).await;
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(()) => {
                failures = 1;
                log_info!("Realtime connection closed; reconnecting");
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                log_warn!("Realtime connection failed: {err:#}");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(reconnect_delay(failures)) => {}
        }
    }
    log_info!("Realtime listener stopped");
}

async fn listen(
    url: &Url,
    join: &str,
    channel: &ChannelNotifier,
    cancel: &CancellationToken,
) -> Result<()> {
    let (ws, _response) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = tokio_tungstenite::connect_async(url.as_str()) => {
            connected.context("realtime connect failed")?
        }
    };
    let (mut write, mut read) = ws.split();
    write.send(Message::text(join.to_string())).await?;

    let mut heartbeat = time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                sequence += 1;
                write.send(Message::text(heartbeat_message(sequence))).await?;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => match classify(text.as_str()) {
                    Frame::Joined => {
                        log_info!("Subscribed to room changes");
                        channel.notify();
                    }
                    Frame::Change => {
                        channel.notify();
                    }
                    Frame::Rejected(reason) => bail!("realtime channel rejected: {reason}"),
                    Frame::Other => {}
                },
                Some(Ok(Message::Close(frame))) => {
                    log_info!("Realtime server closed the connection: {frame:?}");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            },
        }
    }
}
