//! Core domain types for the workout session engine.
//!
//! This module defines the fundamental types used throughout the system:
//! - Exercise segments and the workout program they come from
//! - Pose frames, completion records and frame metadata
//! - Room/workout models returned by the session service
//! - Session states, disconnect causes and user-facing errors

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Program Types
// ============================================================================

/// One exercise/repetition-count pair within the pipeline
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExerciseSegment {
    pub label: String,
    pub count: u32,
}

impl ExerciseSegment {
    pub fn new(label: impl Into<String>, count: u32) -> Self {
        Self {
            label: label.into(),
            count,
        }
    }
}

/// A set of exercises repeated `repeats` times
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkoutSet {
    #[serde(default)]
    pub name: String,
    pub repeats: u32,
    pub exercises: Vec<ExerciseSegment>,
}

/// The program attached to a workout
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct WorkoutProgram {
    pub sets: Vec<WorkoutSet>,
}

/// Lifecycle status of a workout as reported by the session service
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkoutStatus {
    Pending,
    Active,
    Done,
    Banned,
    Recognizing,
    #[serde(other)]
    Unknown,
}

/// A workout as returned by the room endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkoutModel {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub status: WorkoutStatus,
    /// Number of pipeline segments already completed server-side
    #[serde(default)]
    pub exercises_num: usize,
    /// Last frame id the server has seen for this workout
    #[serde(default)]
    pub frame_id: u64,
    #[serde(default)]
    pub save_photos: bool,
    pub program: WorkoutProgram,
}

/// Response of the room endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub workout: Option<WorkoutModel>,
    /// Blocking condition reported instead of a workout (e.g. "locked")
    #[serde(default)]
    pub error: Option<String>,
}

/// Which side of the body the camera should see
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraSide {
    Left,
    #[default]
    Front,
    Right,
}

/// Presentation details of an exercise, keyed by label in the service dictionary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseDetails {
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub side: CameraSide,
}

// ============================================================================
// Frame Types
// ============================================================================

/// A single pose landmark
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PosePoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Landmark confidence
    #[serde(rename = "p")]
    pub confidence: f32,
}

/// Pose landmarks for one camera frame, tagged with a monotonically increasing id
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameSnapshot {
    pub frame_id: u64,
    pub points: Vec<PosePoint>,
}

impl FrameSnapshot {
    /// Whether every landmark is confidently in frame
    pub fn in_frame(&self, min_confidence: f32) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.confidence > min_confidence)
    }
}

/// Camera orientation of the captured frames
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

/// Dimensions of the captured frames
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
}

impl FrameMeta {
    pub fn new(width: u32, height: u32) -> Self {
        let orientation = if width >= height {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        };
        Self {
            width,
            height,
            orientation,
        }
    }
}

/// One detected repetition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionRecord {
    pub frame_id: u64,
    pub label: String,
}

// ============================================================================
// Session State Types
// ============================================================================

/// Top-level state of a workout session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Loading,
    Running,
    Hint,
    Replacing,
    Blocked,
    Error,
    Complete,
}

impl SessionState {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Complete)
    }
}

/// Classified reason a duplex connection closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    AlreadyCompleted,
    AlreadyStarted,
    NoFreeCapacity,
    TransportError,
    NormalCompletion,
}

impl DisconnectCause {
    /// Map a websocket close code onto a cause
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(3002) => DisconnectCause::AlreadyCompleted,
            Some(3003) => DisconnectCause::AlreadyStarted,
            Some(3005) => DisconnectCause::NoFreeCapacity,
            Some(3006) => DisconnectCause::NormalCompletion,
            _ => DisconnectCause::TransportError,
        }
    }

    /// User-facing error for this cause, `None` for a normal completion
    pub fn error_category(self) -> Option<ErrorCategory> {
        match self {
            DisconnectCause::AlreadyCompleted => Some(ErrorCategory::AlreadyCompleted),
            DisconnectCause::AlreadyStarted => Some(ErrorCategory::AlreadyStarted),
            DisconnectCause::NoFreeCapacity => Some(ErrorCategory::NoFreeCapacity),
            DisconnectCause::TransportError => Some(ErrorCategory::ConnectionLost),
            DisconnectCause::NormalCompletion => None,
        }
    }
}

/// User-facing error categories
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InitializeFailed,
    QuotaExhausted,
    AlreadyFinished,
    Banned,
    UnderReview,
    AlreadyCompleted,
    AlreadyStarted,
    NoFreeCapacity,
    ConnectionLost,
    DeliveryFailed,
}

impl ErrorCategory {
    pub fn title(self) -> &'static str {
        match self {
            ErrorCategory::InitializeFailed => "Could not start the workout",
            ErrorCategory::QuotaExhausted => "No minutes left",
            ErrorCategory::AlreadyFinished => "Workout already finished",
            ErrorCategory::Banned => "Workout blocked",
            ErrorCategory::UnderReview => "Checking your workout",
            ErrorCategory::AlreadyCompleted => "Workout already completed",
            ErrorCategory::AlreadyStarted => "Workout already running",
            ErrorCategory::NoFreeCapacity => "No free capacity",
            ErrorCategory::ConnectionLost => "Connection problems",
            ErrorCategory::DeliveryFailed => "No internet connection",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCategory::InitializeFailed => {
                "This workout does not exist or the server is unreachable"
            }
            ErrorCategory::QuotaExhausted => "Ask your coach to top up your plan",
            ErrorCategory::AlreadyFinished => "This workout has already been finished",
            ErrorCategory::Banned => {
                "The workout was flagged as not performed honestly; contact support if this is a mistake"
            }
            ErrorCategory::UnderReview => {
                "The workout is finished and we are checking it was performed correctly"
            }
            ErrorCategory::AlreadyCompleted => "You have already completed this workout",
            ErrorCategory::AlreadyStarted => "The workout may be open in another window",
            ErrorCategory::NoFreeCapacity => "Too many active workouts right now, try again later",
            ErrorCategory::ConnectionLost => "Try reloading the page",
            ErrorCategory::DeliveryFailed => "Your progress could not be saved, check your connection",
        }
    }

    /// Whether reloading the page could help
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::InitializeFailed
                | ErrorCategory::NoFreeCapacity
                | ErrorCategory::ConnectionLost
                | ErrorCategory::DeliveryFailed
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Error shown to the user when the session lands in `SessionState::Error`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub title: String,
    pub description: String,
}

impl From<ErrorCategory> for ErrorDetail {
    fn from(category: ErrorCategory) -> Self {
        Self {
            category,
            title: category.title().to_string(),
            description: category.description().to_string(),
        }
    }
}

// ============================================================================
// Recognition Mode
// ============================================================================

/// Where repetitions are decided
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Local classifier + debouncer; frames are batched and uploaded
    #[default]
    OnDevice,
    /// Frames are streamed to the service, which reports repetitions
    Remote,
}
