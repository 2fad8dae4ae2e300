//! Applies one stream event to the timeline.
//!
//! `apply_event` never mutates the timeline it is given. It returns a new
//! version, or the very same `Arc` when the event changed nothing, together
//! with everything the event asked for outside the timeline.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ConversationEvent, MessageChunk, TurnEvent};
use crate::core::cards::{merge_cards, CardBoard};
use crate::core::constants::{AGENT_BUSY_MARKER, USER_CANCELLED_MARKER};
use crate::core::message::{
    FinalResult, Message, MessageKind, MessageStatus, ProcessingInfo, Role, Timeline,
};
use crate::core::router::{route_step, task_file_id, RouteInput, SideEffect};
use crate::core::session::{DebugResult, TurnContext, ViewState};

/// Session state the applier reads but does not own.
pub struct EventEnv<'a> {
    pub cards: &'a CardBoard,
    pub view: &'a ViewState,
    pub now: Instant,
    pub file_refresh_debounce: Duration,
}

#[derive(Debug)]
pub struct Applied {
    pub timeline: Timeline,
    pub effects: Vec<SideEffect>,
    pub cards: Option<CardBoard>,
    pub suggestions: Option<Vec<String>>,
    pub final_result: Option<DebugResult>,
    pub turn_active: bool,
}

impl Applied {
    fn unchanged(timeline: &Timeline) -> Self {
        Self {
            timeline: timeline.clone(),
            effects: Vec::new(),
            cards: None,
            suggestions: None,
            final_result: None,
            turn_active: timeline.is_turn_active(),
        }
    }
}

pub fn apply_event(
    timeline: &Timeline,
    event: &ConversationEvent,
    turn: &mut TurnContext,
    env: &EventEnv<'_>,
) -> Applied {
    if turn.scratch.halted {
        debug!(turn_id = %turn.turn_id, "turn halted, dropping event");
        return Applied::unchanged(timeline);
    }
    if turn.request_id.is_none() && !event.request_id.is_empty() {
        turn.request_id = Some(event.request_id.clone());
    }

    let Some(index) = timeline.position(&turn.assistant_message_id) else {
        debug!(
            turn_id = %turn.turn_id,
            request_id = %event.request_id,
            "assistant message gone, dropping stale event"
        );
        return Applied::unchanged(timeline);
    };

    let decoded = match event.decode() {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(turn_id = %turn.turn_id, error = %err, "skipping undecodable event");
            return Applied::unchanged(timeline);
        }
    };

    let mut messages = timeline.to_vec();
    let mut applied = Applied::unchanged(timeline);

    match decoded {
        TurnEvent::Processing(step) => {
            apply_processing(&mut messages[index], &step);
            let input = RouteInput {
                conversation_id: turn.conversation_id,
                view: env.view,
                now: env.now,
                file_refresh_debounce: env.file_refresh_debounce,
            };
            applied.effects = route_step(&step, &input, &mut turn.scratch.router);
            applied.cards = merge_cards(env.cards, &step, &event.request_id);
        }
        TurnEvent::Message(chunk) => {
            if let Some(ext) = chunk
                .ext
                .as_ref()
                .filter(|ext| chunk.kind == MessageKind::Question && !ext.is_empty())
            {
                applied.suggestions = Some(ext.iter().map(|e| e.content.clone()).collect());
                messages[index].ext = ext.clone();
            }
            match split_off_entry(&messages, &chunk, turn, &event.request_id) {
                Some(entry) => messages.insert(index, entry),
                None => apply_chunk(&mut messages[index], &chunk),
            }
        }
        TurnEvent::FinalResult(result) => {
            turn.scratch.tracked_inner_id = None;
            turn.scratch.terminal = true;
            applied.effects = final_result_effects(event, &result, turn);
            applied.final_result = Some(DebugResult {
                request_id: event.request_id.clone(),
                final_result: result.clone(),
            });

            let cancelled_empty = !result.success
                && result
                    .error
                    .as_deref()
                    .is_some_and(|e| e.contains(USER_CANCELLED_MARKER))
                && messages[index].text.is_empty()
                && result.output_text.as_deref().unwrap_or_default().is_empty();

            if cancelled_empty {
                messages.remove(index);
            } else {
                let message = &mut messages[index];
                message.status = Some(MessageStatus::Complete);
                message.request_id = Some(event.request_id.clone());
                message.final_result = Some(result);
            }
        }
        TurnEvent::Error(error) => {
            debug!(turn_id = %turn.turn_id, error = ?error, "turn reported an error");
            turn.scratch.halted = true;
            turn.scratch.terminal = true;
            messages[index].status = Some(MessageStatus::Error);
        }
    }

    applied.timeline = Timeline::new(messages);
    applied.turn_active = applied.timeline.is_turn_active();
    applied
}

fn apply_processing(message: &mut Message, step: &ProcessingInfo) {
    let mut step = step.clone();
    if step.execute_id.is_none() {
        step.execute_id = step.resolved_execute_id();
    }
    message.processing_list.push(step);
    if message.status.is_none() || message.status == Some(MessageStatus::Loading) {
        message.status = Some(MessageStatus::Incomplete);
    }
}

fn apply_chunk(message: &mut Message, chunk: &MessageChunk) {
    if chunk.kind == MessageKind::Think {
        message.think.push_str(&chunk.text);
        message.status = Some(MessageStatus::Incomplete);
        return;
    }

    message.text.push_str(&chunk.text);
    message.status = match (chunk.finished, chunk.kind.clears_status_on_finish()) {
        (false, _) => Some(MessageStatus::Incomplete),
        (true, true) => None,
        (true, false) => Some(MessageStatus::Complete),
    };
}

/// Decides whether a chunk becomes its own timeline entry.
///
/// A finished chunk whose inner id differs from the one currently streaming
/// into the reply is inserted ahead of the reply. Any other chunk of a
/// tracked kind makes its id the tracked one.
fn split_off_entry(
    messages: &[Message],
    chunk: &MessageChunk,
    turn: &mut TurnContext,
    request_id: &str,
) -> Option<Message> {
    if !chunk.kind.tracks_inner_id() {
        return None;
    }
    let inner = chunk.inner_id();
    let tracked = turn.scratch.tracked_inner_id.as_deref();

    let split = chunk.finished
        && tracked.is_some()
        && inner.as_deref().is_some_and(|id| {
            Some(id) != tracked && !messages.iter().any(|m| m.id == id)
        });
    if !split {
        turn.scratch.tracked_inner_id = inner;
        return None;
    }

    let id = inner?;
    Some(Message {
        id,
        role: Role::Assistant,
        kind: chunk.kind,
        text: chunk.text.clone(),
        think: String::new(),
        time: Some(chrono::Utc::now().to_rfc3339()),
        attachments: Vec::new(),
        ext: chunk.ext.clone().unwrap_or_default(),
        status: None,
        processing_list: Vec::new(),
        final_result: None,
        request_id: Some(request_id.to_string()),
        index: None,
    })
}

fn final_result_effects(
    event: &ConversationEvent,
    result: &FinalResult,
    turn: &TurnContext,
) -> Vec<SideEffect> {
    let conversation_id = turn.conversation_id;
    let mut effects = vec![SideEffect::RefreshFileList { conversation_id }];

    if let Some(file_id) = result
        .output_text
        .as_deref()
        .and_then(|text| task_file_id(text, conversation_id))
    {
        effects.push(SideEffect::PreviewTaskFile {
            conversation_id,
            file_id,
        });
    }

    let busy = event
        .error
        .as_deref()
        .filter(|e| e.contains(AGENT_BUSY_MARKER))
        .or_else(|| {
            result
                .error
                .as_deref()
                .filter(|e| !result.success && e.contains(AGENT_BUSY_MARKER))
        });
    if let Some(message) = busy {
        effects.push(SideEffect::ConfirmBusy {
            conversation_id,
            message: message.to_string(),
        });
    }

    if turn.suggestions_enabled {
        effects.push(SideEffect::RequestSuggestions);
    }
    effects
}
