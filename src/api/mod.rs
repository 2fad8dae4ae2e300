use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::message::{FinalResult, Message, MessageKind, ProcessingInfo, QuestionExt};
use crate::utils::json::null_as_default;

pub mod client;

pub type ConversationId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentFile {
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mime_type: String,
}

/// A component the user picked manually for this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedComponent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of the streaming `POST` that opens one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub attachments: Vec<AttachmentFile>,
    pub debug: bool,
    pub selected_components: Vec<SelectedComponent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable_params: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Processing,
    Message,
    FinalResult,
    Error,
    #[serde(other)]
    Unknown,
}

/// One decoded chunk of the turn stream, before its `data` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub event_type: EventType,
    #[serde(default, deserialize_with = "null_as_default")]
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completed: bool,
}

/// `MESSAGE` event payload.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: MessageKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub finished: bool,
    #[serde(default)]
    pub ext: Option<Vec<QuestionExt>>,
}

impl MessageChunk {
    /// Inner message id as a string; the server sends numbers or strings.
    pub fn inner_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Typed view of a [`ConversationEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Processing(ProcessingInfo),
    Message(MessageChunk),
    FinalResult(FinalResult),
    Error(Option<String>),
}

#[derive(Debug)]
pub enum DecodeError {
    UnknownEventType,
    Payload {
        event_type: EventType,
        source: serde_json::Error,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownEventType => write!(f, "unknown event type"),
            DecodeError::Payload { event_type, source } => {
                write!(f, "malformed {event_type:?} payload: {source}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::UnknownEventType => None,
            DecodeError::Payload { source, .. } => Some(source),
        }
    }
}

impl ConversationEvent {
    pub fn decode(&self) -> Result<TurnEvent, DecodeError> {
        let payload = |event_type| {
            move |source| DecodeError::Payload { event_type, source }
        };
        match self.event_type {
            EventType::Processing => serde_json::from_value(self.data.clone())
                .map(TurnEvent::Processing)
                .map_err(payload(EventType::Processing)),
            EventType::Message => serde_json::from_value(self.data.clone())
                .map(TurnEvent::Message)
                .map_err(payload(EventType::Message)),
            EventType::FinalResult => {
                if self.data.is_null() {
                    return Ok(TurnEvent::FinalResult(FinalResult::default()));
                }
                serde_json::from_value(self.data.clone())
                    .map(TurnEvent::FinalResult)
                    .map_err(payload(EventType::FinalResult))
            }
            EventType::Error => Ok(TurnEvent::Error(self.error.clone())),
            EventType::Unknown => Err(DecodeError::UnknownEventType),
        }
    }
}

/// Envelope wrapping every non-streaming response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenClose {
    Open,
    #[default]
    #[serde(other)]
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideQuestion {
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: String,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub open_suggest: OpenClose,
    #[serde(default, deserialize_with = "null_as_default")]
    pub manual_components: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variables: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub guid_question_dtos: Vec<GuideQuestion>,
}

impl AgentInfo {
    pub fn suggestions_enabled(&self) -> bool {
        self.open_suggest == OpenClose::Open
    }
}

/// Result of the conversation query.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    pub id: ConversationId,
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub topic_updated: Option<i32>,
    #[serde(default)]
    pub agent: Option<AgentInfo>,
    #[serde(default)]
    pub variables: Option<HashMap<String, Value>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_list: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicUpdate {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub topic_updated: Option<i32>,
}

/// Row of a history list.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticFileInfo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub file_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_dir: bool,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopSession {
    #[serde(default)]
    pub pod_id: Option<String>,
    #[serde(default)]
    pub vnc_url: Option<String>,
}
