use tracing::{debug, info, warn};

use super::{EngineCommand, EngineError, EngineNotice, SessionEngine};
use crate::api::{ConversationId, ConversationInfo, TopicUpdate};
use crate::core::cards::CardBoard;
use crate::core::message::{Message, Timeline};
use crate::core::session::{ConversationSession, ViewMode, ViewState};

impl SessionEngine {
    /// Drops the current conversation. A running turn is cancelled; its close
    /// finds nothing left to settle.
    pub fn reset_session(&mut self) -> Vec<EngineCommand> {
        self.supersede_active_turn();
        self.clear_conversation_state();
        self.session = None;
        self.commit_timeline(Timeline::default());
        self.set_view_state(ViewState::hidden())
    }

    /// Replaces the session with a conversation fetched from the server.
    pub fn load_conversation(&mut self, info: ConversationInfo) -> Vec<EngineCommand> {
        self.supersede_active_turn();
        self.clear_conversation_state();

        let session = ConversationSession::from_info(&info, self.config.message_page_size);
        info!(
            conversation_id = session.conversation_id,
            messages = info.message_list.len(),
            "conversation loaded"
        );
        let suggestions = session.suggestions.clone();
        let topic = session.topic.clone();
        let conversation_id = session.conversation_id;
        self.session = Some(session);
        self.commit_timeline(Timeline::new(info.message_list));
        self.notices
            .push(EngineNotice::SuggestionsChanged(suggestions));
        self.notices.push(EngineNotice::TopicChanged {
            conversation_id,
            topic,
        });

        // The desktop keepalive belongs to the conversation it was started for.
        self.set_view_state(self.view)
    }

    fn clear_conversation_state(&mut self) {
        self.queue.retain(|_| false);
        self.cards = CardBoard::default();
        self.pending_confirmation = None;
        self.loading_more = false;
    }

    /// Asks for the page of history before the oldest loaded message.
    pub fn load_more_messages(&mut self) -> Result<Vec<EngineCommand>, EngineError> {
        let Some(session) = self.session.as_ref() else {
            return Err(EngineError::NoSession);
        };
        if self.loading_more || !session.has_more_messages || self.timeline.is_empty() {
            return Ok(Vec::new());
        }
        let before_index = self
            .timeline
            .messages()
            .first()
            .map(|message| message.index.unwrap_or(0));
        self.loading_more = true;
        Ok(vec![EngineCommand::FetchMessages {
            conversation_id: session.conversation_id,
            before_index,
            size: self.config.message_page_size,
        }])
    }

    pub(super) fn messages_page_loaded(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) {
        if self.current_conversation() != Some(conversation_id) {
            debug!(conversation_id, "page for a conversation no longer shown");
            return;
        }
        self.loading_more = false;
        let page_size = self.config.message_page_size;
        let has_more = !messages.is_empty() && messages.len() >= page_size;
        if let Some(session) = self.session.as_mut() {
            session.has_more_messages = has_more;
        }
        if messages.is_empty() {
            return;
        }
        let timeline = self.timeline.with_prepended(messages);
        self.commit_timeline(timeline);
    }

    pub(super) fn messages_page_failed(&mut self, conversation_id: ConversationId, error: &str) {
        warn!(conversation_id, error, "loading older messages failed");
        if self.current_conversation() == Some(conversation_id) {
            self.loading_more = false;
            self.notices.push(EngineNotice::Error(format!(
                "Could not load older messages: {error}"
            )));
        }
    }

    /// Records the server-generated topic and asks for fresh history lists.
    pub(super) fn topic_updated(
        &mut self,
        conversation_id: ConversationId,
        agent_id: Option<i64>,
        update: TopicUpdate,
    ) -> Vec<EngineCommand> {
        if let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.conversation_id == conversation_id)
        {
            if update.topic.is_some() {
                session.topic = update.topic.clone();
            }
            session.topic_updated = true;
            self.notices.push(EngineNotice::TopicChanged {
                conversation_id,
                topic: session.topic.clone(),
            });
        }

        let limit = self.config.history_limit;
        let mut commands = vec![EngineCommand::RefreshHistory {
            agent_id: None,
            limit,
        }];
        if agent_id.is_some() {
            commands.push(EngineCommand::RefreshHistory { agent_id, limit });
        }
        commands
    }

    pub(super) fn suggestions_loaded(
        &mut self,
        conversation_id: ConversationId,
        suggestions: Vec<String>,
    ) {
        if self.current_conversation() == Some(conversation_id) {
            self.set_suggestions(suggestions);
        }
    }

    /// Answers the agent-busy prompt. Accepting stops the running task on
    /// the server; either way new turns are allowed again.
    pub fn resolve_busy_confirmation(&mut self, accept: bool) -> Vec<EngineCommand> {
        let Some(confirmation) = self.pending_confirmation.take() else {
            return Vec::new();
        };
        if !accept {
            debug!(conversation_id = confirmation.conversation_id, "busy prompt dismissed");
            return Vec::new();
        }
        vec![EngineCommand::StopConversation {
            conversation_id: confirmation.conversation_id,
            request_id: confirmation.request_id,
        }]
    }

    /// Switches the side panel. The desktop keepalive runs exactly while the
    /// current conversation's desktop is on screen.
    pub fn set_view_state(&mut self, view: ViewState) -> Vec<EngineCommand> {
        if view != self.view {
            self.view = view;
            self.notices.push(EngineNotice::ViewChanged(view));
        }

        let wanted = self
            .current_conversation()
            .filter(|_| view.panel_visible && view.mode == ViewMode::Desktop);
        if wanted == self.keepalive_for {
            return Vec::new();
        }

        let mut commands = Vec::new();
        if self.keepalive_for.take().is_some() {
            commands.push(EngineCommand::StopKeepalive);
        }
        if let Some(conversation_id) = wanted {
            self.keepalive_for = Some(conversation_id);
            commands.push(EngineCommand::StartKeepalive { conversation_id });
        }
        commands
    }
}
