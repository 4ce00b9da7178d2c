//! Fire-and-forget side effects: analytics and audio feedback.

use crate::types::{DisconnectCause, ErrorCategory};
use serde::Serialize;

/// Analytics events emitted by the orchestrator
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    RoomOpened,
    SessionStarted { workout_id: u64 },
    Repetition { label: String, progress: f64 },
    NextExercise { label: String, count: u32, position: usize },
    ReplaceRequested { position: usize },
    ExerciseReplaced { label: String, count: u32, position: usize },
    Disconnected { cause: DisconnectCause },
    Error { category: ErrorCategory },
    Completed { total_time_secs: u64 },
}

/// Side-effect triggers; every method defaults to a no-op
pub trait SessionHooks: Send + Sync {
    fn track(&self, _event: &AnalyticsEvent) {}

    /// Milestone sound
    fn play_chime(&self) {}
}

/// Hooks that write every event to the `analytics` tracing target
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingHooks;

impl SessionHooks for TracingHooks {
    fn track(&self, event: &AnalyticsEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::info!(target: "analytics", "{}", json),
            Err(e) => tracing::warn!(target: "analytics", "Unserializable event {:?}: {}", event, e),
        }
    }

    fn play_chime(&self) {
        tracing::info!(target: "feedback", "chime");
    }
}
