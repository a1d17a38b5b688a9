//! # Live Protocol Messages
//!
//! JSON frames exchanged with the live conversational engine.
//!
//! ## Client → Server:
//! - **setup**: first frame after connecting (model, voice, modality, system instruction)
//! - **realtimeInput**: base64 PCM chunks from the microphone
//! - **clientContent**: a text turn, used for the opening prompt
//!
//! ## Server → Client:
//! - **setupComplete**: acknowledgment that the session is ready
//! - **serverContent**: model audio parts plus `turnComplete` / `interrupted` markers
//! - **goAway**: the server will disconnect soon

use crate::audio::pcm::AudioFrame;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
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

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

/// Base64 audio carried inline in a model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAudio {
    pub mime_type: String,
    pub data: String,
}

/// The parts of one server frame the session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub audio: Vec<InlineAudio>,
    pub text: Vec<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
}

impl InboundMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.text.is_empty() && !self.turn_complete && !self.interrupted
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    SetupComplete,
    Content(InboundMessage),
    GoAway,
    /// Valid JSON with nothing the session acts on (usage metadata, tool calls, ...)
    Ignored,
}

/// Build the setup frame.
pub fn setup_message(model: &str, voice: &str, system_instruction: &str) -> ClientMessage {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    };

    let speech_config = (!voice.is_empty()).then(|| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: voice.to_string(),
            },
        },
    });

    let system_instruction = (!system_instruction.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part {
            text: Some(system_instruction.to_string()),
            inline_data: None,
        }],
    });

    ClientMessage::Setup(Setup {
        model,
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config,
        },
        system_instruction,
    })
}

/// Wrap one encoded microphone frame.
pub fn audio_message(frame: &AudioFrame) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: frame.mime_type.clone(),
            data: frame.to_base64(),
        }],
    })
}

/// Wrap a complete user text turn.
pub fn text_message(text: &str) -> ClientMessage {
    ClientMessage::ClientContent(ClientContent {
        turns: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }],
        turn_complete: true,
    })
}

/// Parse a server frame. The engine sends JSON in both text and binary frames.
pub fn parse_server_frame(raw: &[u8]) -> Result<ServerFrame, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(raw)?;

    if message.setup_complete.is_some() {
        return Ok(ServerFrame::SetupComplete);
    }
    if message.go_away.is_some() {
        return Ok(ServerFrame::GoAway);
    }

    let Some(content) = message.server_content else {
        return Ok(ServerFrame::Ignored);
    };

    let mut inbound = InboundMessage {
        turn_complete: content.turn_complete,
        interrupted: content.interrupted,
        ..Default::default()
    };

    for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
        if let Some(blob) = part.inline_data {
            if blob.mime_type.starts_with("audio/") {
                inbound.audio.push(InlineAudio {
                    mime_type: blob.mime_type,
                    data: blob.data,
                });
            }
        }
        if let Some(text) = part.text {
            inbound.text.push(text);
        }
    }

    if inbound.is_empty() {
        Ok(ServerFrame::Ignored)
    } else {
        Ok(ServerFrame::Content(inbound))
    }
}
