//! Session states and error sub-codes.

use std::fmt;

use serde::{Serialize, Serializer};

/// Why a session ended up in [`SessionState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "api_key_missing")]
    ApiKeyMissing,
    #[serde(rename = "ai_sdk_init_failed")]
    SdkInitFailed,
    #[serde(rename = "mic_access_denied")]
    MicAccessDenied,
    #[serde(rename = "audiocontext_failure")]
    AudioContextFailure,
    #[serde(rename = "ai_session_connect_failed")]
    ConnectFailed,
    #[serde(rename = "api_session_error_callback")]
    SessionErrorCallback,
    #[serde(rename = "audio_send_error")]
    AudioSendError,
    #[serde(rename = "ai_audio_play_error")]
    AiAudioPlayError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ApiKeyMissing => "api_key_missing",
            ErrorCode::SdkInitFailed => "ai_sdk_init_failed",
            ErrorCode::MicAccessDenied => "mic_access_denied",
            ErrorCode::AudioContextFailure => "audiocontext_failure",
            ErrorCode::ConnectFailed => "ai_session_connect_failed",
            ErrorCode::SessionErrorCallback => "api_session_error_callback",
            ErrorCode::AudioSendError => "audio_send_error",
            ErrorCode::AiAudioPlayError => "ai_audio_play_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the live voice session is in its lifecycle.
///
/// ```text
/// Idle -> RequestingMic -> MicGranted -> Connecting -> SessionOpen -> StreamingUser
/// StreamingUser <-> PlayingAiAudio, both -> ProcessingMessage (transient)
/// any active -> Error, any active -> Closing -> Idle
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    RequestingMic,
    MicGranted,
    Connecting,
    SessionOpen,
    StreamingUser,
    PlayingAiAudio,
    ProcessingMessage,
    Closing,
    Error { code: ErrorCode, message: String },
}

impl SessionState {
    /// Wire name, as sent to the host UI.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::RequestingMic => "requesting_mic",
            SessionState::MicGranted => "mic_access_granted",
            SessionState::Connecting => "connecting_ai",
            SessionState::SessionOpen => "ai_session_open",
            SessionState::StreamingUser => "streaming_user_audio",
            SessionState::PlayingAiAudio => "playing_ai_audio",
            SessionState::ProcessingMessage => "processing_ai_message",
            SessionState::Closing => "closing_session",
            SessionState::Error { .. } => "error",
        }
    }

    /// Status text used when a transition does not supply its own.
    pub fn default_status_text(&self) -> &'static str {
        match self {
            SessionState::Idle => "Ready.",
            SessionState::RequestingMic => "Requesting microphone access...",
            SessionState::MicGranted => "Microphone access granted.",
            SessionState::Connecting => "Connecting to the Live API...",
            SessionState::SessionOpen => "Live API session open. You can speak.",
            SessionState::StreamingUser => "Recording and sending audio...",
            SessionState::PlayingAiAudio => "AI is speaking...",
            SessionState::ProcessingMessage => "Processing AI message...",
            SessionState::Closing => "Closing Live API session...",
            SessionState::Error { .. } => "Live API error.",
        }
    }

    /// Activation in flight, or a session up and running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::RequestingMic
                | SessionState::MicGranted
                | SessionState::Connecting
                | SessionState::SessionOpen
                | SessionState::StreamingUser
                | SessionState::PlayingAiAudio
                | SessionState::ProcessingMessage
                | SessionState::Closing
        )
    }

    /// Still waiting on the microphone or the remote handshake.
    pub fn is_activating(&self) -> bool {
        matches!(
            self,
            SessionState::RequestingMic | SessionState::MicGranted | SessionState::Connecting
        )
    }

    /// States in which captured frames are forwarded to the remote.
    pub fn is_streaming_eligible(&self) -> bool {
        matches!(
            self,
            SessionState::SessionOpen | SessionState::StreamingUser | SessionState::PlayingAiAudio
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            SessionState::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error { code, message } => write!(f, "error({}): {}", code, message),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
