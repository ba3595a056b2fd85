//! # Remote Streaming
//!
//! The seam between the session and the hosted speech-to-speech service.
//!
//! A [`RemoteConnector`] opens a [`RemoteSession`]. From then on the service
//! talks back through a [`RemoteEventSink`] (open, message, error, close) and
//! the session talks to the service through
//! [`RemoteSession::send_realtime_input`] and [`RemoteSession::close`].
//!
//! - `protocol`: wire JSON for the Gemini Live API
//! - `gemini`: WebSocket client for the Gemini Live API
//! - `retry`: optional connect timeout and bounded retry with jitter

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::audio::TransportBlob;

pub mod gemini;
pub mod protocol;
pub mod retry;

pub use gemini::GeminiLiveConnector;
pub use protocol::{ServerEvent, ServerMessage};
pub use retry::{connect_with_policy, ConnectPolicy};

/// Default Live API model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-native-audio-dialog";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Orus";

/// What the service should answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Handshake parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectParams {
    pub model: String,
    pub voice_name: String,
    pub response_modalities: Vec<Modality>,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            response_modalities: vec![Modality::Audio],
        }
    }
}

/// One realtime input sent to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeInput {
    Media(TransportBlob),
    Text(String),
}

/// Callbacks from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Open,
    Message(ServerMessage),
    Error(String),
    /// Connection closed, with the peer's reason when it gave one
    Close(Option<String>),
}

/// Receives service callbacks. Invoked from the connection's reader task.
pub type RemoteEventSink = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// A live connection to the service.
pub trait RemoteSession: Send {
    /// Queue one realtime input. Fails when the connection is gone.
    fn send_realtime_input(&mut self, input: RealtimeInput) -> Result<(), RemoteError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Opens remote sessions.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, params: ConnectParams, events: RemoteEventSink) -> BoxFuture<'static, Result<Box<dyn RemoteSession>, RemoteError>>;

    fn name(&self) -> &'static str;
}

/// Errors from connecting to or talking with the service.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// No API key configured
    MissingApiKey,

    /// The handshake failed
    Connect(String),

    /// The handshake did not finish in time
    Timeout(Duration),

    /// An outbound message could not be queued
    Send(String),

    /// The connection is already closed
    Closed,

    /// The service sent something we could not understand
    Protocol(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::MissingApiKey => write!(f, "API key is not configured"),
            RemoteError::Connect(msg) => write!(f, "Failed to connect: {}", msg),
            RemoteError::Timeout(after) => write!(f, "Connect timed out after {:?}", after),
            RemoteError::Send(msg) => write!(f, "Failed to send: {}", msg),
            RemoteError::Closed => write!(f, "Remote session is closed"),
            RemoteError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connect_params() {
        let params = ConnectParams::default();
        assert_eq!(params.model, "gemini-2.5-flash-preview-native-audio-dialog");
        assert_eq!(params.voice_name, "Orus");
        assert_eq!(params.response_modalities, vec![Modality::Audio]);
        assert_eq!(serde_json::to_string(&Modality::Audio).unwrap(), "\"AUDIO\"");
    }
}
