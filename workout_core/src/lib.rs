#![forbid(unsafe_code)]

//! Core session engine for the workout room.
//!
//! This crate provides:
//! - Domain types (segments, frames, workouts, session states, errors)
//! - Exercise pipeline and repetition debouncer
//! - Proof-of-work batching and ordered delivery with retry
//! - The duplex session protocol and its websocket transport
//! - The session orchestrator tying them together

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod catalog;
pub mod pipeline;
pub mod counter;
pub mod batch;
pub mod queue;
pub mod protocol;
pub mod transport;
pub mod api;
pub mod recognizer;
pub mod hooks;
pub mod timers;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use catalog::ExerciseCatalog;
pub use pipeline::ExercisePipeline;
pub use counter::RepetitionCounter;
pub use batch::{BatchAccumulator, BatchBody, SessionBatch};
pub use queue::{enqueue_with_retry, DeliveryQueue, RetryPolicy};
pub use protocol::{SessionEvent, SessionEventSink, SessionProtocol};
pub use transport::{Connector, SessionLink, WsConnector};
pub use api::{HttpWorkoutApi, WorkoutApi};
pub use recognizer::{FrameClassifier, NullClassifier, ScriptedClassifier};
pub use hooks::{AnalyticsEvent, SessionHooks, TracingHooks};
pub use orchestrator::{FrameOutcome, SessionOrchestrator, SessionReport};
