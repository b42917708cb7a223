pub mod controller;
pub mod display;
pub mod engine;
pub mod state;

pub use controller::{RoomTimerController, RoomTimerEvent, SyncGate, TimerView};
pub use engine::{progress_ratio, remaining_seconds, ReconciliationEngine, SyncOutcome, TickOutcome};
pub use state::{TimerState, TimerStatus};
