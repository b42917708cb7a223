mod room;
mod session;
mod stats;

pub use room::{Participant, ParticipantId, Phase, RoomSnapshot, MAX_PHASE_SECONDS};
pub use session::Session;
pub use stats::UserStatsSnapshot;
