//! # Live Voice Session
//!
//! The duplex streaming orchestrator: microphone frames go up to the remote
//! service, audio chunks come back and are scheduled for gap-free playback,
//! interruptions cancel whatever is still queued.
//!
//! - `state`: session states and error sub-codes
//! - `events`: status, speech and analyzer notifications
//! - `schedule`: playback schedule and active source set
//! - `orchestrator`: the state machine itself
//! - `driver`: the task that owns the orchestrator and serialises its inputs

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::audio::{AudioError, MicConstraints};
use crate::remote::{ConnectParams, ConnectPolicy, RemoteConnector, RemoteError};

pub mod driver;
pub mod events;
pub mod orchestrator;
pub mod schedule;
pub mod state;

pub use driver::{SessionDriver, SessionHandle};
pub use events::{AnalyzerFrame, SessionEvent, SpeechEvent, StatusEvent};
pub use orchestrator::{LiveVoiceSession, SessionInput};
pub use schedule::{ActiveSourceSet, PlaybackSchedule};
pub use state::{ErrorCode, SessionState};

/// Builds the remote connector. Called at start-up and again on reset, so a
/// changed API key is picked up.
pub type ConnectorFactory = Box<dyn Fn() -> Result<Arc<dyn RemoteConnector>, RemoteError> + Send>;

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub connect: ConnectParams,
    /// Sent as realtime text as soon as the remote session opens
    pub initial_prompt: Option<String>,
    pub connect_policy: ConnectPolicy,
    pub microphone: MicConstraints,
}

/// Running counters, exposed through the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub activations: u64,
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
    pub interruptions: u64,
    pub playback_errors: u64,
}

/// Point-in-time view of the session, published after every step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub last_status: Option<StatusEvent>,
    pub stats: SessionStats,
    pub analyzers: AnalyzerFrame,
    pub active_sources: usize,
    pub next_start_time: f64,
    pub has_initial_prompt: bool,
}

/// Errors returned to callers of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// An activation is in flight or a session is already running
    AlreadyActive,

    /// No API key, so no connector
    ApiKeyMissing,

    /// The connector could not be built
    SdkInit(String),

    /// Audio contexts could not be created or resumed
    AudioContext(AudioError),

    /// Microphone permission or device failure
    MicAccessDenied(String),

    /// Remote handshake failed
    ConnectFailed(String),

    /// The remote reported an error
    Remote(String),

    /// Sending captured audio failed
    AudioSend(String),

    /// The activation was cancelled by `stop()` or a remote close
    Cancelled,

    /// The session driver is no longer running
    DriverUnavailable,
}

impl SessionError {
    /// Error matching a session that ended up in [`SessionState::Error`].
    pub fn from_state(code: ErrorCode, message: &str) -> Self {
        let message = message.to_string();
        match code {
            ErrorCode::ApiKeyMissing => SessionError::ApiKeyMissing,
            ErrorCode::SdkInitFailed => SessionError::SdkInit(message),
            ErrorCode::MicAccessDenied => SessionError::MicAccessDenied(message),
            ErrorCode::AudioContextFailure => SessionError::AudioContext(AudioError::ContextCreation(message)),
            ErrorCode::ConnectFailed => SessionError::ConnectFailed(message),
            ErrorCode::SessionErrorCallback => SessionError::Remote(message),
            ErrorCode::AudioSendError | ErrorCode::AiAudioPlayError => SessionError::AudioSend(message),
        }
    }

    /// Sub-code reported alongside this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::ApiKeyMissing => Some(ErrorCode::ApiKeyMissing),
            SessionError::SdkInit(_) => Some(ErrorCode::SdkInitFailed),
            SessionError::AudioContext(_) => Some(ErrorCode::AudioContextFailure),
            SessionError::MicAccessDenied(_) => Some(ErrorCode::MicAccessDenied),
            SessionError::ConnectFailed(_) => Some(ErrorCode::ConnectFailed),
            SessionError::Remote(_) => Some(ErrorCode::SessionErrorCallback),
            SessionError::AudioSend(_) => Some(ErrorCode::AudioSendError),
            SessionError::AlreadyActive | SessionError::Cancelled | SessionError::DriverUnavailable => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive => write!(f, "A live session is already active or starting"),
            SessionError::ApiKeyMissing => write!(f, "API key is missing; the live session cannot start"),
            SessionError::SdkInit(msg) => write!(f, "Failed to initialise the Live API client: {}", msg),
            SessionError::AudioContext(e) => write!(f, "Audio context failure: {}", e),
            SessionError::MicAccessDenied(msg) => write!(f, "Microphone access error: {}", msg),
            SessionError::ConnectFailed(msg) => write!(f, "Failed to open Live API session: {}", msg),
            SessionError::Remote(msg) => write!(f, "Live API session error: {}", msg),
            SessionError::AudioSend(msg) => write!(f, "Failed to send audio: {}", msg),
            SessionError::Cancelled => write!(f, "Activation was cancelled"),
            SessionError::DriverUnavailable => write!(f, "Session driver is not running"),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip_through_state() {
        for code in [
            ErrorCode::MicAccessDenied,
            ErrorCode::ConnectFailed,
            ErrorCode::SessionErrorCallback,
            ErrorCode::ApiKeyMissing,
        ] {
            assert_eq!(SessionError::from_state(code, "x").code(), Some(code));
        }
        assert_eq!(SessionError::AlreadyActive.code(), None);
    }
}
