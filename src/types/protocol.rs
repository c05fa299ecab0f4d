//! Wire frames for the `BidiGenerateContent` stream.
//!
//! Every message on the socket is a JSON object with exactly one top-level
//! key naming the frame kind. Serde's externally tagged representation maps
//! that shape directly onto the two enums below, so serialization and
//! classification are the same `serde_json` call.

use serde::{Deserialize, Serialize};

use crate::types::config::LiveConfig;

/// MIME type for outbound microphone chunks.
pub const REALTIME_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// MIME prefix that marks an inline-data part as raw PCM audio.
pub const AUDIO_PCM_PREFIX: &str = "audio/pcm";

/// Frames the client writes to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientFrame {
    Setup(LiveConfig),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

/// Frames the server sends back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ServerFrame {
    SetupComplete(SetupComplete),
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation(ToolCallCancellation),
}

impl ServerFrame {
    /// Wire name of the frame kind, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::SetupComplete(_) => "setupComplete",
            ServerFrame::ServerContent(_) => "serverContent",
            ServerFrame::ToolCall(_) => "toolCall",
            ServerFrame::ToolCallCancellation(_) => "toolCallCancellation",
        }
    }
}

/// Acknowledges the `Setup` frame; carries no payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetupComplete {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Content produced by the model. The three fields are mutually exclusive
/// on the wire; `interrupted` and `turn_complete` arrive without a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub turn_complete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

/// One party's contiguous contribution: an ordered list of parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

/// A unit of content within a turn: inline text or tagged inline data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(Blob {
                mime_type: mime_type.into(),
                data: data.into(),
            }),
        }
    }

    /// True if the part carries inline PCM audio.
    pub fn is_audio(&self) -> bool {
        self.inline_data
            .as_ref()
            .is_some_and(|blob| blob.mime_type.starts_with(AUDIO_PCM_PREFIX))
    }
}

/// Inline binary data, base64-encoded with its MIME type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

/// A single function invocation requested by the model. The `id` must be
/// echoed back in the matching [`FunctionResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCancellation {
    pub ids: Vec<String>,
}
