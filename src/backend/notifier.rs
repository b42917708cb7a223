use anyhow::Result;
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;

/// "The room table changed" with no payload. May arrive spuriously or more
/// than once per actual change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomChanged;

pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self) -> Result<Subscription>;
}

/// Live feed of change signals. Closed explicitly or when the source goes away.
pub struct Subscription {
    id: Uuid,
    receiver: broadcast::Receiver<RoomChanged>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn from_receiver(receiver: broadcast::Receiver<RoomChanged>) -> Self {
        Self {
            id: Uuid::new_v4(),
            receiver,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next signal, or `None` once closed. Signals dropped while lagging are
    /// folded into a single one since each only means "re-fetch".
    pub async fn next(&mut self) -> Option<RoomChanged> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            received = self.receiver.recv() => match received {
                Ok(signal) => Some(signal),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("subscription {} skipped {skipped} change signals", self.id);
                    Some(RoomChanged)
                }
                Err(RecvError::Closed) => None,
            },
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// In-process notifier. [`RealtimeNotifier`](super::RealtimeNotifier)
/// forwards table-change pushes into [`ChannelNotifier::notify`].
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<RoomChanged>,
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Returns how many subscriptions received the signal.
    pub fn notify(&self) -> usize {
        self.sender.send(RoomChanged).unwrap_or(0)
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn subscribe(&self) -> Result<Subscription> {
        Ok(Subscription::from_receiver(self.sender.subscribe()))
    }
}
