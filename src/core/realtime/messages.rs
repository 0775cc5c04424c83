//! Realtime data-channel message types.
//!
//! All events are JSON text frames on the `oai-events` data channel.
//!
//! # Protocol Overview
//!
//! Client events (sent to the provider):
//! - session.update - Update session configuration (tools, tool_choice, ...)
//! - conversation.item.create - Add an item (user text, function output)
//! - response.create - Generate a response
//! - response.cancel - Cancel the current response
//! - input_audio_buffer.commit / input_audio_buffer.clear
//!
//! Server events (received from the provider):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / input_audio_buffer.speech_stopped
//! - response.created / response.done
//! - response.output_item.added / response.output_item.done
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.delta / response.audio_transcript.done
//! - response.text.delta / response.text.done
//! - response.function_call_arguments.done
//! - error
//!
//! Anything else decodes to [`ServerEvent::Unknown`] and is never dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Tools
// =============================================================================

fn function_tool_type() -> String {
    "function".to_string()
}

/// A callable capability advertised to the remote session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool type (always "function")
    #[serde(rename = "type", default = "function_tool_type")]
    pub tool_type: String,
    /// Function name
    pub name: String,
    /// Function description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            tool_type: function_tool_type(),
            name: name.into(),
            description: Some(description.into()),
            parameters: Some(parameters),
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Payload of a `session.update` event. Unset fields are left untouched remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Tool choice strategy ("auto", "none", "required")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl SessionUpdate {
    /// Register `tools` with automatic tool choice.
    pub fn tools(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools: Some(tools),
            tool_choice: Some("auto".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// Semantic VAD
    #[serde(rename = "semantic_vad")]
    SemanticVad {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eagerness: Option<String>,
    },
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item, also used for response output entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type ("message", "function_call", "function_call_output")
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    /// Call ID for function call items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name for function call items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON-encoded function arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// JSON-encoded function output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    pub fn is_function_call(&self) -> bool {
        self.item_type == "function_call"
    }

    /// A `function_call_output` item answering `call_id`.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    /// A user text message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.into()),
                transcript: None,
            }]),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

// =============================================================================
// Client Events (sent to the provider)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
}

// =============================================================================
// Server Events (received from the provider)
// =============================================================================

/// Inbound protocol event.
///
/// Fields are lenient: missing ids default to empty so that a partial event
/// still reaches its subscribers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },

    /// VAD detected the start of user speech
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    /// VAD detected the end of user speech
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: Response },

    /// Response complete, including any function call items
    #[serde(rename = "response.done")]
    ResponseDone { response: Response },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        response_id: String,
        item: ConversationItem,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        /// Base64 audio chunk (audio normally arrives on the media track)
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },

    /// Any event type this client does not model
    #[serde(other)]
    Unknown,
}

/// Discriminant of [`ServerEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Error,
    SessionCreated,
    SessionUpdated,
    SpeechStarted,
    SpeechStopped,
    ResponseCreated,
    ResponseDone,
    OutputItemDone,
    AudioDelta,
    AudioDone,
    AudioTranscriptDelta,
    AudioTranscriptDone,
    TextDelta,
    TextDone,
    FunctionCallArgumentsDone,
}

impl ServerEventKind {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerEventKind::Error => "error",
            ServerEventKind::SessionCreated => "session.created",
            ServerEventKind::SessionUpdated => "session.updated",
            ServerEventKind::SpeechStarted => "input_audio_buffer.speech_started",
            ServerEventKind::SpeechStopped => "input_audio_buffer.speech_stopped",
            ServerEventKind::ResponseCreated => "response.created",
            ServerEventKind::ResponseDone => "response.done",
            ServerEventKind::OutputItemDone => "response.output_item.done",
            ServerEventKind::AudioDelta => "response.audio.delta",
            ServerEventKind::AudioDone => "response.audio.done",
            ServerEventKind::AudioTranscriptDelta => "response.audio_transcript.delta",
            ServerEventKind::AudioTranscriptDone => "response.audio_transcript.done",
            ServerEventKind::TextDelta => "response.text.delta",
            ServerEventKind::TextDone => "response.text.done",
            ServerEventKind::FunctionCallArgumentsDone => "response.function_call_arguments.done",
        }
    }
}

impl std::fmt::Display for ServerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    /// Subscription key, or `None` for events that are never dispatched.
    pub fn kind(&self) -> Option<ServerEventKind> {
        let kind = match self {
            ServerEvent::Error { .. } => ServerEventKind::Error,
            ServerEvent::SessionCreated { .. } => ServerEventKind::SessionCreated,
            ServerEvent::SessionUpdated { .. } => ServerEventKind::SessionUpdated,
            ServerEvent::SpeechStarted { .. } => ServerEventKind::SpeechStarted,
            ServerEvent::SpeechStopped { .. } => ServerEventKind::SpeechStopped,
            ServerEvent::ResponseCreated { .. } => ServerEventKind::ResponseCreated,
            ServerEvent::ResponseDone { .. } => ServerEventKind::ResponseDone,
            ServerEvent::OutputItemDone { .. } => ServerEventKind::OutputItemDone,
            ServerEvent::AudioDelta { .. } => ServerEventKind::AudioDelta,
            ServerEvent::AudioDone { .. } => ServerEventKind::AudioDone,
            ServerEvent::AudioTranscriptDelta { .. } => ServerEventKind::AudioTranscriptDelta,
            ServerEvent::AudioTranscriptDone { .. } => ServerEventKind::AudioTranscriptDone,
            ServerEvent::TextDelta { .. } => ServerEventKind::TextDelta,
            ServerEvent::TextDone { .. } => ServerEventKind::TextDone,
            ServerEvent::FunctionCallArgumentsDone { .. } => {
                ServerEventKind::FunctionCallArgumentsDone
            }
            ServerEvent::Unknown => return None,
        };
        Some(kind)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Response information carried by `response.created` / `response.done`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Vec<ConversationItem>,
}

impl Response {
    /// First function-call item in the output, if any.
    pub fn first_function_call(&self) -> Option<&ConversationItem> {
        self.output.iter().find(|item| item.is_function_call())
    }
}

// =============================================================================
// Tests
// =============================================================================
