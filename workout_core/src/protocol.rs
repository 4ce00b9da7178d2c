//! Duplex session protocol.
//!
//! `SessionProtocol` is the connection state machine
//! (`Connecting → Open → Closed(cause)`). It turns transport-level events
//! into [`SessionEvent`]s delivered to a single [`SessionEventSink`], and
//! encodes outbound frames/commands only while the connection is open.

use crate::Error;
use crate::types::{DisconnectCause, ExerciseSegment, FrameMeta, FrameSnapshot, PosePoint};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Session-level events produced by the protocol
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started,
    RepetitionFound { frame_id: Option<u64> },
    NextExercise { segment: ExerciseSegment, position: usize },
    ReplaceExercise { segment: ExerciseSegment, position: usize },
    Disconnected { cause: DisconnectCause },
}

/// Receiver of protocol events
pub trait SessionEventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl SessionEventSink for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Session event receiver dropped");
        }
    }
}

/// Server → client messages
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(alias = "NEW_REPEAT_FOUND")]
    RepetitionFound {
        #[serde(default)]
        frame_id: Option<u64>,
    },
    NextExercise {
        label: String,
        count: u32,
        #[serde(alias = "exercise_num")]
        position: usize,
    },
    ReplaceExercise {
        label: String,
        count: u32,
        #[serde(alias = "exercise_num")]
        position: usize,
    },
    #[serde(other)]
    Unknown,
}

/// Client → server messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage<'a> {
    Frame {
        frame_id: u64,
        data: &'a [PosePoint],
        width: u32,
        height: u32,
    },
    ReplaceExercise,
}

/// Connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    Connecting,
    Open,
    Closed(DisconnectCause),
}

/// Connection state machine and message codec
pub struct SessionProtocol {
    state: ProtocolState,
    sink: Box<dyn SessionEventSink>,
}

impl SessionProtocol {
    pub fn new(sink: Box<dyn SessionEventSink>) -> Self {
        Self {
            state: ProtocolState::Connecting,
            sink,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ProtocolState::Open
    }

    /// Transport handshake succeeded
    pub fn on_open(&mut self) {
        if self.state != ProtocolState::Connecting {
            tracing::warn!("Ignoring open in state {:?}", self.state);
            return;
        }
        tracing::info!("Session channel open");
        self.state = ProtocolState::Open;
        self.sink.on_event(SessionEvent::Started);
    }

    /// Inbound text message; unknown or malformed messages are ignored
    pub fn on_message(&mut self, text: &str) {
        if !self.is_open() {
            tracing::debug!("Dropping inbound message in state {:?}", self.state);
            return;
        }

        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed server message: {}", e);
                return;
            }
        };

        let event = match message {
            ServerMessage::RepetitionFound { frame_id } => {
                SessionEvent::RepetitionFound { frame_id }
            }
            ServerMessage::NextExercise {
                label,
                count,
                position,
            } => SessionEvent::NextExercise {
                segment: ExerciseSegment::new(label, count),
                position,
            },
            ServerMessage::ReplaceExercise {
                label,
                count,
                position,
            } => SessionEvent::ReplaceExercise {
                segment: ExerciseSegment::new(label, count),
                position,
            },
            ServerMessage::Unknown => {
                tracing::debug!("Ignoring unknown server message type");
                return;
            }
        };
        self.sink.on_event(event);
    }

    /// Transport-level failure (including a failed handshake)
    pub fn on_error(&mut self, error: &Error) {
        tracing::warn!("Session transport error: {}", error);
        self.close_with(DisconnectCause::TransportError);
    }

    /// Close frame received or stream ended
    pub fn on_close(&mut self, code: Option<u16>) {
        let cause = DisconnectCause::from_close_code(code);
        tracing::info!(?code, ?cause, "Session channel closed");
        self.close_with(cause);
    }

    fn close_with(&mut self, cause: DisconnectCause) {
        if let ProtocolState::Closed(previous) = self.state {
            tracing::debug!(?previous, ?cause, "Already closed");
            return;
        }
        self.state = ProtocolState::Closed(cause);
        self.sink.on_event(SessionEvent::Disconnected { cause });
    }

    /// Encode a frame, or `None` unless the channel is open
    pub fn encode_frame(&self, frame: &FrameSnapshot, meta: FrameMeta) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        encode(&ClientMessage::Frame {
            frame_id: frame.frame_id,
            data: &frame.points,
            width: meta.width,
            height: meta.height,
        })
    }

    /// Encode a replace request, or `None` unless the channel is open
    pub fn encode_replace(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        encode(&ClientMessage::ReplaceExercise)
    }
}

fn encode(message: &ClientMessage<'_>) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to encode client message: {}", e);
            None
        }
    }
}
