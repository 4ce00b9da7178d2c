//! WebSocket transport for the session protocol.
//!
//! Each connection runs on its own task that owns the socket and the
//! [`SessionProtocol`] state machine. Outbound commands reach it through a
//! channel; commands issued before the handshake completes are dropped.

use crate::protocol::{SessionEventSink, SessionProtocol};
use crate::types::{FrameMeta, FrameSnapshot};
use crate::Error;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Outbound side of a session channel, as seen by the orchestrator
pub trait SessionLink: Send {
    /// Fire-and-forget; dropped unless the channel is open
    fn send_frame(&self, frame: &FrameSnapshot, meta: FrameMeta);
    /// Fire-and-forget; dropped unless the channel is open
    fn request_replace(&self);
    fn close(&self);
}

/// Opens session channels
pub trait Connector: Send + Sync {
    fn connect(&self, workout_id: u64, sink: Box<dyn SessionEventSink>) -> Box<dyn SessionLink>;
}

#[derive(Debug)]
enum Outbound {
    Frame(FrameSnapshot, FrameMeta),
    Replace,
    Close,
}

/// Handle to a running websocket connection task
pub struct ProtocolHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl ProtocolHandle {
    fn send(&self, command: Outbound) {
        if self.tx.send(command).is_err() {
            tracing::trace!("Session channel task finished, dropping command");
        }
    }
}

impl SessionLink for ProtocolHandle {
    fn send_frame(&self, frame: &FrameSnapshot, meta: FrameMeta) {
        self.send(Outbound::Frame(frame.clone(), meta));
    }

    fn request_replace(&self) {
        self.send(Outbound::Replace);
    }

    fn close(&self) {
        self.send(Outbound::Close);
    }
}

impl Drop for ProtocolHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            self.send(Outbound::Close);
        }
    }
}

/// Connects to `<ws_url>/api/v2/workout/ws/recognizer/<workout_id>`
#[derive(Clone, Debug)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(ws_url: &str) -> Self {
        Self {
            base_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, workout_id: u64) -> String {
        format!("{}/api/v2/workout/ws/recognizer/{}", self.base_url, workout_id)
    }
}

impl Connector for WsConnector {
    fn connect(&self, workout_id: u64, sink: Box<dyn SessionEventSink>) -> Box<dyn SessionLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = self.url_for(workout_id);
        let task = tokio::spawn(drive(url, SessionProtocol::new(sink), rx));
        Box::new(ProtocolHandle { tx, task })
    }
}

async fn drive(
    url: String,
    mut protocol: SessionProtocol,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    tracing::info!("Connecting to {}", url);

    let connect = tokio_tungstenite::connect_async(url.as_str());
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            command = rx.recv() => match command {
                Some(Outbound::Close) | None => {
                    tracing::debug!("Connection abandoned before handshake");
                    return;
                }
                Some(other) => tracing::trace!("Not open yet, dropping {:?}", other),
            },
        }
    };

    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            protocol.on_error(&Error::from(e));
            return;
        }
    };
    protocol.on_open();

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            command = rx.recv() => {
                let text = match command {
                    Some(Outbound::Frame(frame, meta)) => protocol.encode_frame(&frame, meta),
                    Some(Outbound::Replace) => protocol.encode_replace(),
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        tracing::debug!("Session channel closed locally");
                        return;
                    }
                };
                if let Some(text) = text {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        protocol.on_error(&Error::from(e));
                        return;
                    }
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => protocol.on_message(&text),
                Some(Ok(Message::Close(frame))) => {
                    protocol.on_close(frame.map(|f| u16::from(f.code)));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    protocol.on_error(&Error::from(e));
                    return;
                }
                None => {
                    protocol.on_close(None);
                    return;
                }
            },
        }
    }
}
