//! Gemini Live wire format.
//!
//! Outbound: one `setup` message, then `realtimeInput` messages carrying
//! either media chunks or text. Inbound: `setupComplete`, and
//! `serverContent` with model turn parts, `interrupted` and `turnComplete`
//! flags. Inbound messages are flattened into an ordered list of
//! [`ServerEvent`]s so the session handles each case exhaustively.

use serde::{Deserialize, Serialize};

use super::{ConnectParams, RealtimeInput, RemoteError};
use crate::audio::TransportBlob;

// ---- client -> server ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<super::Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    pub fn from_params(params: &ConnectParams) -> Self {
        let model = if params.model.starts_with("models/") {
            params.model.clone()
        } else {
            format!("models/{}", params.model)
        };
        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: params.response_modalities.clone(),
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: params.voice_name.clone(),
                            },
                        },
                    },
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInputPayload,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_chunks: Option<Vec<TransportBlob>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl From<RealtimeInput> for RealtimeInputMessage {
    fn from(input: RealtimeInput) -> Self {
        let realtime_input = match input {
            RealtimeInput::Media(blob) => RealtimeInputPayload {
                media_chunks: Some(vec![blob]),
                ..Default::default()
            },
            RealtimeInput::Text(text) => RealtimeInputPayload {
                text: Some(text),
                ..Default::default()
            },
        };
        Self { realtime_input }
    }
}

// ---- server -> client ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

/// One thing the service told us, in handling order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Base64 PCM16 audio at the output rate
    Audio { mime_type: String, data: String },
    Interrupted,
    Text { text: String },
    TurnComplete,
    SetupComplete,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerMessage {
    pub events: Vec<ServerEvent>,
    pub has_model_turn: bool,
}

impl ServerMessage {
    pub fn new(events: Vec<ServerEvent>) -> Self {
        let has_model_turn = events
            .iter()
            .any(|e| matches!(e, ServerEvent::Audio { .. } | ServerEvent::Text { .. }));
        Self { events, has_model_turn }
    }

    /// Short label used in the processing status text.
    pub fn description(&self) -> &'static str {
        if self.has_model_turn {
            "model response"
        } else if self.events.contains(&ServerEvent::Interrupted) {
            "interruption"
        } else {
            "server message"
        }
    }

    pub fn is_setup_complete(&self) -> bool {
        self.events.contains(&ServerEvent::SetupComplete)
    }

    /// The message without its setup acknowledgement.
    pub fn without_setup(mut self) -> Self {
        self.events.retain(|e| *e != ServerEvent::SetupComplete);
        self
    }
}

impl From<LiveServerMessage> for ServerMessage {
    fn from(message: LiveServerMessage) -> Self {
        let mut audio = Vec::new();
        let mut text = Vec::new();
        let mut interrupted = false;
        let mut turn_complete = false;
        let mut has_model_turn = false;

        if let Some(content) = message.server_content {
            if let Some(turn) = content.model_turn {
                has_model_turn = true;
                for part in turn.parts {
                    if let Some(inline) = part.inline_data {
                        let mime_type = inline.mime_type.unwrap_or_default();
                        match inline.data {
                            Some(data) if !data.is_empty() && mime_type.starts_with("audio/") => {
                                audio.push(ServerEvent::Audio { mime_type, data });
                            }
                            _ => {}
                        }
                    }
                    if let Some(t) = part.text {
                        text.push(ServerEvent::Text { text: t });
                    }
                }
            }
            interrupted = content.interrupted.unwrap_or(false);
            turn_complete = content.turn_complete.unwrap_or(false);
        }

        let mut events = audio;
        if interrupted {
            events.push(ServerEvent::Interrupted);
        }
        events.extend(text);
        if turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
        if message.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        Self { events, has_model_turn }
    }
}

/// Parse one inbound frame.
pub fn parse_server_message(payload: &[u8]) -> Result<ServerMessage, RemoteError> {
    let message: LiveServerMessage =
        serde_json::from_slice(payload).map_err(|e| RemoteError::Protocol(e.to_string()))?;
    Ok(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let value = serde_json::to_value(SetupMessage::from_params(&ConnectParams::default())).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-2.5-flash-preview-native-audio-dialog",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Orus" } }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_shapes() {
        let media = RealtimeInputMessage::from(RealtimeInput::Media(TransportBlob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAA=".to_string(),
        }));
        assert_eq!(
            serde_json::to_value(media).unwrap(),
            json!({ "realtimeInput": { "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAA=" }] } })
        );

        let text = RealtimeInputMessage::from(RealtimeInput::Text("hello".to_string()));
        assert_eq!(
            serde_json::to_value(text).unwrap(),
            json!({ "realtimeInput": { "text": "hello" } })
        );
    }

    #[test]
    fn test_parse_model_turn_with_audio_and_text() {
        let payload = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "Hi there" }
                ]},
                "turnComplete": true
            }
        });
        let message = parse_server_message(payload.to_string().as_bytes()).unwrap();
        assert_eq!(message.description(), "model response");
        assert_eq!(
            message.events,
            vec![
                ServerEvent::Audio { mime_type: "audio/pcm;rate=24000".to_string(), data: "AAAA".to_string() },
                ServerEvent::Text { text: "Hi there".to_string() },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_interruption() {
        let message = parse_server_message(br#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(message.events, vec![ServerEvent::Interrupted]);
        assert_eq!(message.description(), "interruption");
    }

    #[test]
    fn test_audio_is_handled_before_interruption_and_text() {
        let payload = json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "text": "cut", "inlineData": { "mimeType": "audio/pcm", "data": "AAAA" } }] },
                "interrupted": true
            }
        });
        let message = parse_server_message(payload.to_string().as_bytes()).unwrap();
        assert!(matches!(message.events[0], ServerEvent::Audio { .. }));
        assert_eq!(message.events[1], ServerEvent::Interrupted);
        assert_eq!(message.events[2], ServerEvent::Text { text: "cut".to_string() });
    }

    #[test]
    fn test_non_audio_inline_data_is_ignored() {
        let payload = json!({
            "serverContent": { "modelTurn": { "parts": [{ "inlineData": { "mimeType": "image/png", "data": "AAAA" } }] } }
        });
        let message = parse_server_message(payload.to_string().as_bytes()).unwrap();
        assert!(message.events.is_empty());
        assert_eq!(message.description(), "model response");
    }

    #[test]
    fn test_setup_complete_and_unknown_fields() {
        let message = parse_server_message(br#"{"setupComplete":{},"usageMetadata":{"totalTokenCount":3}}"#).unwrap();
        assert!(message.is_setup_complete());
        assert_eq!(message.description(), "server message");
        assert!(message.without_setup().events.is_empty());
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        assert!(matches!(parse_server_message(b"not json"), Err(RemoteError::Protocol(_))));
    }
}
