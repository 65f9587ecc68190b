pub mod counters;

pub use counters::{CaptureStats, FailureStreak, PublishStats, StreakAction};
