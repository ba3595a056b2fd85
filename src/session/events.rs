//! Notifications the session pushes to its observers.

use serde::Serialize;

use super::state::SessionState;
use crate::audio::analyzer::AnalyzerSnapshot;

/// Emitted on every state transition, and for non-fatal playback errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Human-readable status line
    pub status: String,
    /// Error sub-code when there is one, otherwise the new state's wire name
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub old_state: SessionState,
}

/// Text the model produced, forwarded for the avatar layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechEvent {
    pub text: Option<String>,
    /// Filled in by the conversational layer, never by the voice session
    pub directives: Option<serde_json::Value>,
}

impl SpeechEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            directives: None,
        }
    }
}

/// Latest visualizer snapshots for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AnalyzerFrame {
    pub input: AnalyzerSnapshot,
    pub output: AnalyzerSnapshot,
}

impl AnalyzerFrame {
    pub fn is_silent(&self) -> bool {
        self.input.iter().chain(self.output.iter()).all(|&b| b == 0)
    }
}

/// Everything observers can receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "detail")]
pub enum SessionEvent {
    #[serde(rename = "live-audio-status")]
    Status(StatusEvent),

    #[serde(rename = "ai-speech")]
    Speech(SpeechEvent),

    #[serde(rename = "analyzers")]
    Analyzers(AnalyzerFrame),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_event_json() {
        let event = SessionEvent::Status(StatusEvent {
            status: "Connecting to the Live API...".to_string(),
            code: "connecting_ai".to_string(),
            error: None,
            old_state: SessionState::MicGranted,
        });
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({
                "type": "live-audio-status",
                "detail": {
                    "status": "Connecting to the Live API...",
                    "code": "connecting_ai",
                    "oldState": "mic_access_granted"
                }
            })
        );
    }

    #[test]
    fn test_speech_event_has_null_directives() {
        let value = serde_json::to_value(SessionEvent::Speech(SpeechEvent::text("hello"))).unwrap();
        assert_eq!(value, json!({ "type": "ai-speech", "detail": { "text": "hello", "directives": null } }));
    }

    #[test]
    fn test_analyzer_frame_silence() {
        let mut frame = AnalyzerFrame::default();
        assert!(frame.is_silent());
        frame.output[3] = 12;
        assert!(!frame.is_silent());
    }
}
