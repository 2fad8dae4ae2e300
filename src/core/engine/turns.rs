use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    BusyConfirmation, EngineCommand, EngineError, EngineNotice, SessionEngine, TurnRequest,
};
use crate::api::{ChatRequest, ConversationEvent};
use crate::core::message::{Message, Timeline};
use crate::core::reconciler::{fail_turn_message, reconcile_close, stop_turn_message};
use crate::core::reducer::{apply_event, EventEnv};
use crate::core::router::SideEffect;
use crate::core::session::{ConversationSession, TurnContext, TurnId, ViewState};

impl SessionEngine {
    /// Appends the user message and a loading reply, then asks for the stream.
    ///
    /// A turn still running is cancelled first; its late close only ever
    /// touches its own reply.
    pub fn start_turn(&mut self, request: TurnRequest) -> Result<Vec<EngineCommand>, EngineError> {
        if self.pending_confirmation.is_some() {
            return Err(EngineError::ConfirmationPending);
        }
        if request.message.trim().is_empty() && request.attachments.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        self.supersede_active_turn();

        let conversation_id = request.conversation_id;
        if self.current_conversation() != Some(conversation_id) {
            self.session = Some(ConversationSession::new(conversation_id));
            self.timeline = Timeline::default();
            self.cards = Default::default();
        }
        self.set_suggestions(Vec::new());

        let user = Message::user(request.message.clone(), request.attachments.clone());
        let reply = Message::assistant_placeholder();
        let timeline = self
            .timeline
            .with_incomplete_completed()
            .with_appended([user.clone(), reply.clone()]);

        let chat_request = ChatRequest {
            conversation_id,
            message: request.message,
            attachments: request.attachments,
            debug: self.config.debug,
            selected_components: request.selected_components,
            variable_params: request.variable_params,
        };

        self.next_turn_id += 1;
        let turn_id = TurnId(self.next_turn_id);
        let Some(session) = self.session.as_ref() else {
            return Err(EngineError::NoSession);
        };
        let mut turn = TurnContext::new(turn_id, session, chat_request.clone(), &user, &reply);
        if self.topic_attempted.contains(&conversation_id) {
            turn.topic_pending = false;
        }

        debug!(turn_id = %turn_id, conversation_id, "starting turn");
        let command = EngineCommand::SpawnStream {
            turn_id,
            request: chat_request,
            cancel_token: turn.cancel_token.clone(),
        };
        self.active = Some(turn);
        self.commit_timeline(timeline);
        Ok(vec![command])
    }

    /// Aborts the running turn's stream. Events still buffered for it are
    /// discarded; its reply settles when the stream reports `End`.
    pub fn cancel_turn(&mut self) {
        let Some(turn) = self.active.as_mut() else {
            return;
        };
        if turn.cancelled {
            return;
        }
        debug!(turn_id = %turn.turn_id, "cancelling turn");
        turn.cancelled = true;
        turn.cancel_token.cancel();
        let turn_id = turn.turn_id;
        self.queue.retain(|(id, _)| *id != turn_id);
    }

    pub(super) fn supersede_active_turn(&mut self) {
        let Some(mut turn) = self.active.take() else {
            return;
        };
        turn.cancelled = true;
        turn.cancel_token.cancel();
        let turn_id = turn.turn_id;
        self.queue.retain(|(id, _)| *id != turn_id);
        let timeline = stop_turn_message(&self.timeline, &turn);
        self.commit_timeline(timeline);
        self.closing.insert(turn_id, turn);
    }

    pub(super) fn enqueue_event(&mut self, turn_id: TurnId, event: ConversationEvent) {
        match self.active.as_ref() {
            Some(turn) if turn.turn_id == turn_id && !turn.cancelled => {
                self.queue.push((turn_id, event), Instant::now());
            }
            _ => debug!(turn_id = %turn_id, "dropping event for inactive turn"),
        }
    }

    /// Applies every buffered event in arrival order as one timeline update.
    pub fn flush(&mut self) -> Vec<EngineCommand> {
        let batch = self.queue.take_batch();
        if batch.is_empty() {
            return Vec::new();
        }
        if self.timeline.is_empty() {
            debug!(dropped = batch.len(), "timeline reset under pending flush");
            if self.turn_active {
                self.turn_active = false;
                self.notices
                    .push(EngineNotice::TimelineChanged { turn_active: false });
            }
            return Vec::new();
        }

        let mut timeline = self.timeline.clone();
        let mut effects = Vec::new();
        let now = Instant::now();
        let debounce = self.config.file_refresh_debounce();
        let current = self.current_conversation();

        for (turn_id, event) in batch {
            let Some(turn) = self.active.as_mut().filter(|t| t.turn_id == turn_id) else {
                continue;
            };
            let env = EventEnv {
                cards: &self.cards,
                view: &self.view,
                now,
                file_refresh_debounce: debounce,
            };
            let applied = apply_event(&timeline, &event, turn, &env);
            let owns_view = current == Some(turn.conversation_id);
            let request_id = turn.request_id.clone();
            timeline = applied.timeline;

            if owns_view {
                if let Some(cards) = applied.cards {
                    self.notices
                        .push(EngineNotice::CardsChanged(cards.cards.clone()));
                    self.cards = cards;
                }
                if let Some(suggestions) = applied.suggestions {
                    self.set_suggestions(suggestions);
                }
                if let Some(result) = applied.final_result {
                    if let Some(session) = self.session.as_mut() {
                        session.last_result = Some(result);
                    }
                }
            }
            effects.extend(applied.effects.into_iter().map(|e| (e, request_id.clone())));
        }

        self.commit_timeline(timeline);

        let mut commands = Vec::new();
        for (effect, request_id) in effects {
            self.apply_side_effect(effect, request_id, &mut commands);
        }
        commands
    }

    fn apply_side_effect(
        &mut self,
        effect: SideEffect,
        request_id: Option<String>,
        commands: &mut Vec<EngineCommand>,
    ) {
        let current = self.current_conversation();
        match effect {
            SideEffect::OpenDesktop { conversation_id } => {
                commands.push(EngineCommand::EnsureDesktop { conversation_id });
                self.notices
                    .push(EngineNotice::DesktopOpened { conversation_id });
                if current == Some(conversation_id) {
                    commands.extend(self.set_view_state(ViewState::desktop()));
                }
            }
            SideEffect::RefreshFileList { conversation_id } => {
                commands.push(EngineCommand::RefreshFileList { conversation_id });
            }
            SideEffect::PagePreview(preview) => {
                self.notices.push(EngineNotice::PagePreview(preview));
            }
            SideEffect::OpenLink { url } => self.notices.push(EngineNotice::OpenLink(url)),
            SideEffect::PreviewTaskFile {
                conversation_id,
                file_id,
            } => {
                if current == Some(conversation_id) {
                    commands.extend(self.set_view_state(ViewState::preview()));
                }
                self.notices.push(EngineNotice::TaskFileSelected {
                    conversation_id,
                    file_id,
                });
            }
            SideEffect::ConfirmBusy {
                conversation_id,
                message,
            } => {
                let confirmation = BusyConfirmation {
                    conversation_id,
                    request_id,
                    message,
                };
                self.pending_confirmation = Some(confirmation.clone());
                self.notices.push(EngineNotice::ConfirmBusy(confirmation));
            }
            SideEffect::RequestSuggestions => {
                if let Some(turn) = self.active.as_ref() {
                    commands.push(EngineCommand::RequestSuggestions {
                        conversation_id: turn.conversation_id,
                        request: turn.request.clone(),
                    });
                }
            }
        }
    }

    pub(super) fn stream_errored(
        &mut self,
        turn_id: TurnId,
        message: String,
    ) -> Vec<EngineCommand> {
        let cancelled = self.turn(turn_id).map(|turn| turn.cancelled);
        match cancelled {
            None => {
                debug!(turn_id = %turn_id, "error for unknown turn");
                return Vec::new();
            }
            Some(true) => {
                debug!(turn_id = %turn_id, %message, "ignoring error from cancelled turn");
                return Vec::new();
            }
            Some(false) => {}
        }

        let commands = self.flush();
        warn!(turn_id = %turn_id, %message, "turn stream failed");
        let Some(turn) = self.turn_mut(turn_id) else {
            return commands;
        };
        turn.scratch.halted = true;
        turn.scratch.terminal = true;
        let turn = turn.clone();

        if let Some(timeline) = fail_turn_message(&self.timeline, &turn) {
            self.commit_timeline(timeline);
        }
        self.notices.push(EngineNotice::Error(message));
        commands
    }

    /// Settles a turn whose stream ended, then runs post-stream bookkeeping.
    pub(super) fn stream_closed(&mut self, turn_id: TurnId) -> Vec<EngineCommand> {
        let mut commands = Vec::new();
        let is_active = self.active.as_ref().is_some_and(|t| t.turn_id == turn_id);
        if is_active && self.active.as_ref().is_some_and(|t| !t.cancelled) {
            commands.extend(self.flush());
        }

        let turn = if is_active {
            self.active.take()
        } else {
            self.closing.remove(&turn_id)
        };
        let Some(turn) = turn else {
            debug!(turn_id = %turn_id, "close for unknown turn");
            return commands;
        };

        let outcome = reconcile_close(&self.timeline, &turn);
        self.commit_timeline(outcome.timeline);
        if outcome.transport_failure && !turn.scratch.terminal {
            self.notices.push(EngineNotice::Error(
                "The connection closed before the agent finished".to_string(),
            ));
        }
        debug!(
            turn_id = %turn_id,
            conversation_id = turn.conversation_id,
            cancelled = turn.cancelled,
            "turn closed"
        );

        if outcome.topic_eligible {
            commands.extend(self.topic_update_for(&turn));
        }
        commands
    }

    fn topic_update_for(&mut self, turn: &TurnContext) -> Option<EngineCommand> {
        if !turn.topic_pending || self.topic_attempted.contains(&turn.conversation_id) {
            return None;
        }
        let already_set = self
            .session
            .as_ref()
            .is_some_and(|s| s.conversation_id == turn.conversation_id && s.topic_updated);
        if already_set {
            return None;
        }
        self.topic_attempted.insert(turn.conversation_id);
        Some(EngineCommand::UpdateTopic {
            conversation_id: turn.conversation_id,
            agent_id: turn.agent_id,
            first_message: turn.first_message().to_string(),
        })
    }

    fn turn(&self, turn_id: TurnId) -> Option<&TurnContext> {
        self.active
            .as_ref()
            .filter(|t| t.turn_id == turn_id)
            .or_else(|| self.closing.get(&turn_id))
    }

    fn turn_mut(&mut self, turn_id: TurnId) -> Option<&mut TurnContext> {
        match self.active.as_mut() {
            Some(turn) if turn.turn_id == turn_id => Some(turn),
            _ => self.closing.get_mut(&turn_id),
        }
    }
}
