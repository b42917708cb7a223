pub mod notifier;
pub mod realtime;
pub mod rest;
pub mod rows;

use async_trait::async_trait;

use crate::error::TimerResult;
use crate::models::{ParticipantId, RoomSnapshot, UserStatsSnapshot};

pub use notifier::{ChangeNotifier, ChannelNotifier, RoomChanged, Subscription};
pub use realtime::RealtimeNotifier;
pub use rest::RestFetcher;
pub use rows::DurationUnit;

/// Read side of the hosted database. Rows are validated before they leave
/// the implementation; `Ok(None)` means there is no such row.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_room_snapshot(&self) -> TimerResult<Option<RoomSnapshot>>;

    async fn fetch_user_stats(
        &self,
        participant: &ParticipantId,
    ) -> TimerResult<Option<UserStatsSnapshot>>;
}
