use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{AgentInfo, ChatRequest, ConversationId, ConversationInfo};
use crate::core::message::{FinalResult, Message, MessageKind};

/// Monotonic id of one streaming exchange inside a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Preview,
    Desktop,
}

/// What the side panel next to the timeline is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewState {
    pub panel_visible: bool,
    pub mode: ViewMode,
}

impl ViewState {
    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn preview() -> Self {
        Self {
            panel_visible: true,
            mode: ViewMode::Preview,
        }
    }

    pub fn desktop() -> Self {
        Self {
            panel_visible: true,
            mode: ViewMode::Desktop,
        }
    }

    pub fn shows_file_preview(&self) -> bool {
        self.panel_visible && self.mode == ViewMode::Preview
    }
}

/// The last final result seen in this session, kept for debug inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugResult {
    pub request_id: String,
    pub final_result: FinalResult,
}

/// State of the conversation the user is looking at.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationSession {
    pub conversation_id: ConversationId,
    pub topic: Option<String>,
    pub agent_id: Option<i64>,
    pub agent: Option<AgentInfo>,
    pub variables: HashMap<String, Value>,
    /// Whether the topic has been set already, by the server or by this engine.
    pub topic_updated: bool,
    pub suggestions: Vec<String>,
    pub has_more_messages: bool,
    pub last_result: Option<DebugResult>,
}

impl ConversationSession {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }

    /// Builds the session from a conversation query, seeding suggestions from
    /// the last question or, for a fresh conversation, the agent's guide
    /// questions.
    pub fn from_info(info: &ConversationInfo, page_size: usize) -> Self {
        let messages = &info.message_list;
        let guide_questions = || {
            info.agent
                .as_ref()
                .map(|agent| {
                    agent
                        .guid_question_dtos
                        .iter()
                        .map(|q| q.info.clone())
                        .filter(|q| !q.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let suggestions = match messages.last() {
            Some(last) if last.kind == MessageKind::Question && !last.ext.is_empty() => {
                last.ext.iter().map(|e| e.content.clone()).collect()
            }
            Some(_) if messages.len() == 1 => guide_questions(),
            Some(_) => Vec::new(),
            None => guide_questions(),
        };

        Self {
            conversation_id: info.id,
            topic: info.topic.clone(),
            agent_id: info.agent_id,
            agent: info.agent.clone(),
            variables: info.variables.clone().unwrap_or_default(),
            topic_updated: info.topic_updated == Some(1),
            suggestions,
            has_more_messages: page_size > 0 && messages.len() >= page_size,
            last_result: None,
        }
    }

    pub fn suggestions_enabled(&self) -> bool {
        self.agent.as_ref().is_some_and(AgentInfo::suggestions_enabled)
    }
}

/// Per-turn bookkeeping of the side-effect router.
#[derive(Debug, Clone, Default)]
pub struct RouterState {
    pub desktop_opened: bool,
    pub previewed: HashSet<String>,
    pub last_file_refresh: Option<Instant>,
}

/// Mutable scratch the event applier keeps for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnScratch {
    /// Inner message id of the chunk currently streaming into the reply.
    pub tracked_inner_id: Option<String>,
    /// Set by `ERROR`; nothing is applied afterwards.
    pub halted: bool,
    /// Set once `FINAL_RESULT` or `ERROR` was applied.
    pub terminal: bool,
    pub router: RouterState,
}

/// Everything a turn captured when it started.
///
/// Every later decision for the turn reads from here, never from whatever
/// conversation the session happens to show at that point.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_id: TurnId,
    pub conversation_id: ConversationId,
    pub agent_id: Option<i64>,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub request: ChatRequest,
    /// Learned from the first event of the stream.
    pub request_id: Option<String>,
    pub suggestions_enabled: bool,
    /// The conversation still needs its topic when this turn closes.
    pub topic_pending: bool,
    pub cancelled: bool,
    pub cancel_token: CancellationToken,
    pub scratch: TurnScratch,
}

impl TurnContext {
    pub fn new(
        turn_id: TurnId,
        session: &ConversationSession,
        request: ChatRequest,
        user_message: &Message,
        assistant_message: &Message,
    ) -> Self {
        Self {
            turn_id,
            conversation_id: request.conversation_id,
            agent_id: session.agent_id,
            user_message_id: user_message.id.clone(),
            assistant_message_id: assistant_message.id.clone(),
            suggestions_enabled: session.suggestions_enabled(),
            topic_pending: !session.topic_updated,
            request,
            request_id: None,
            cancelled: false,
            cancel_token: CancellationToken::new(),
            scratch: TurnScratch::default(),
        }
    }

    pub fn first_message(&self) -> &str {
        &self.request.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GuideQuestion, OpenClose};
    use crate::core::message::QuestionExt;

    fn agent_with_guides() -> AgentInfo {
        AgentInfo {
            open_suggest: OpenClose::Open,
            guid_question_dtos: vec![GuideQuestion {
                info: "What can you do?".into(),
                icon: None,
            }],
            ..AgentInfo::default()
        }
    }

    #[test]
    fn fresh_conversation_seeds_guide_questions() {
        let info = ConversationInfo {
            id: 3,
            agent: Some(agent_with_guides()),
            ..ConversationInfo::default()
        };
        let session = ConversationSession::from_info(&info, 20);
        assert_eq!(session.suggestions, vec!["What can you do?".to_string()]);
        assert!(!session.topic_updated);
        assert!(!session.has_more_messages);
        assert!(session.suggestions_enabled());
    }

    #[test]
    fn last_question_ext_wins_over_guides() {
        let mut question = Message::assistant_placeholder();
        question.kind = MessageKind::Question;
        question.ext = vec![QuestionExt {
            uuid: None,
            content: "Next?".into(),
        }];
        let info = ConversationInfo {
            id: 3,
            topic_updated: Some(1),
            agent: Some(agent_with_guides()),
            message_list: vec![Message::user("hi", Vec::new()), question],
            ..ConversationInfo::default()
        };
        let session = ConversationSession::from_info(&info, 2);
        assert_eq!(session.suggestions, vec!["Next?".to_string()]);
        assert!(session.topic_updated);
        assert!(session.has_more_messages);
    }

    #[test]
    fn file_preview_needs_a_visible_preview_panel() {
        assert!(ViewState::preview().shows_file_preview());
        assert!(!ViewState::desktop().shows_file_preview());
        assert!(!ViewState::hidden().shows_file_preview());
    }
}
