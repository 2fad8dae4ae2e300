use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::api::AttachmentFile;
use crate::utils::json::null_as_default;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
    Function,
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Function => "function",
            Role::Unknown => "unknown",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an assistant message while its turn streams.
///
/// `None` on a [`Message`] means the server marked the chunk finished and the
/// running indicator should disappear without claiming the turn completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Loading,
    Incomplete,
    Complete,
    Stopped,
    Error,
}

impl MessageStatus {
    /// Loading and incomplete messages belong to a turn that is still running.
    pub fn is_active(self) -> bool {
        matches!(self, MessageStatus::Loading | MessageStatus::Incomplete)
    }
}

/// Sub-kind carried by `MESSAGE` events and stored on history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Chat,
    Think,
    Guid,
    Question,
    Answer,
    /// Tool and workflow output, plus anything the server adds later.
    #[serde(other)]
    Other,
}

impl MessageKind {
    /// Chat and question replies drop their status when finished instead of
    /// claiming completion; the turn's final result decides that.
    pub fn clears_status_on_finish(self) -> bool {
        matches!(self, MessageKind::Chat | MessageKind::Question)
    }

    /// Whether chunks of this kind take part in inner message id tracking.
    pub fn tracks_inner_id(self) -> bool {
        !matches!(self, MessageKind::Think | MessageKind::Question)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Executing,
    Finished,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComponentKind {
    Plugin,
    Workflow,
    Knowledge,
    Page,
    Event,
    ToolCall,
    #[serde(rename = "MCP")]
    Mcp,
    Agent,
    Table,
    Skill,
    Model,
    #[default]
    #[serde(other)]
    Other,
}

/// One agent execution step as delivered by a `PROCESSING` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingInfo {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub execute_id: Option<String>,
    pub status: ProcessingStatus,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_bind_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_data: Option<Value>,
}

impl ProcessingInfo {
    pub fn new(status: ProcessingStatus, kind: ComponentKind) -> Self {
        Self {
            execute_id: None,
            status,
            kind,
            sub_event_type: None,
            name: None,
            target_id: None,
            result: None,
            card_bind_config: None,
            card_data: None,
        }
    }

    /// The execute id from the step itself, falling back to the nested result.
    pub fn resolved_execute_id(&self) -> Option<String> {
        self.execute_id.clone().or_else(|| {
            self.result
                .as_ref()
                .and_then(|result| result.get("executeId"))
                .and_then(value_to_id)
        })
    }
}

/// Follow-up question offered by a `QUESTION` message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionExt {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

/// Payload of a `FINAL_RESULT` event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub component_execute_results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// A single timeline entry.
///
/// User messages never change after they are appended. Assistant messages are
/// rewritten only through the event applier, always addressed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub role: Role,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: MessageKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub think: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub attachments: Vec<AttachmentFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub ext: Vec<QuestionExt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub processing_list: Vec<ProcessingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Server-side position, used as the cursor when paging older history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

impl Message {
    fn minted(role: Role, text: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind: MessageKind::Chat,
            text,
            think: String::new(),
            time: Some(chrono::Utc::now().to_rfc3339()),
            attachments: Vec::new(),
            ext: Vec::new(),
            status: None,
            processing_list: Vec::new(),
            final_result: None,
            request_id: None,
            index: None,
        }
    }

    pub fn user(text: impl Into<String>, attachments: Vec<AttachmentFile>) -> Self {
        Self {
            attachments,
            ..Self::minted(Role::User, text.into())
        }
    }

    /// Empty assistant entry that the turn's events stream into.
    pub fn assistant_placeholder() -> Self {
        Self {
            status: Some(MessageStatus::Loading),
            ..Self::minted(Role::Assistant, String::new())
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_some_and(MessageStatus::is_active)
    }
}

/// Ordered conversation transcript.
///
/// Cloning is cheap: the message list sits behind an `Arc`, and every update
/// produces a new list that replaces the old one wholesale.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Arc<Vec<Message>>,
}

impl Timeline {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(messages),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// True when both handles point at the same committed list.
    pub fn same_version(&self, other: &Timeline) -> bool {
        Arc::ptr_eq(&self.messages, &other.messages)
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.as_ref().clone()
    }

    /// Whether the tail of the timeline is still receiving a turn.
    pub fn is_turn_active(&self) -> bool {
        self.last().is_some_and(Message::is_active)
    }

    pub fn active_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_active()).count()
    }

    /// Copy-on-write update of one message. Returns `None` when `id` is absent.
    pub fn with_updated<F>(&self, id: &str, update: F) -> Option<Timeline>
    where
        F: FnOnce(&mut Message),
    {
        let index = self.position(id)?;
        let mut messages = self.to_vec();
        update(&mut messages[index]);
        Some(Timeline::new(messages))
    }

    pub fn with_appended<I>(&self, extra: I) -> Timeline
    where
        I: IntoIterator<Item = Message>,
    {
        let mut messages = self.to_vec();
        messages.extend(extra);
        Timeline::new(messages)
    }

    pub fn with_prepended(&self, older: Vec<Message>) -> Timeline {
        let mut messages = older;
        messages.extend(self.messages.iter().cloned());
        Timeline::new(messages)
    }

    /// Every `Incomplete` message becomes `Complete`; used before a new turn.
    pub fn with_incomplete_completed(&self) -> Timeline {
        if !self
            .messages
            .iter()
            .any(|m| m.status == Some(MessageStatus::Incomplete))
        {
            return self.clone();
        }
        let messages = self
            .messages
            .iter()
            .cloned()
            .map(|mut message| {
                if message.status == Some(MessageStatus::Incomplete) {
                    message.status = Some(MessageStatus::Complete);
                }
                message
            })
            .collect();
        Timeline::new(messages)
    }
}

impl From<Vec<Message>> for Timeline {
    fn from(messages: Vec<Message>) -> Self {
        Timeline::new(messages)
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Server ids arrive as either strings or numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value)
        .ok_or_else(|| serde::de::Error::custom("message id must be a string or number"))
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_id))
}
