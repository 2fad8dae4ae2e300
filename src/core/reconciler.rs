//! Terminal bookkeeping for a turn whose stream has ended or failed.
//!
//! Everything here addresses the message the turn captured when it started.
//! A turn that closes late, after a newer turn took over the timeline, can
//! therefore only ever touch its own reply.

use tracing::debug;

use crate::core::message::{MessageStatus, ProcessingStatus, Timeline};
use crate::core::session::TurnContext;

#[derive(Debug)]
pub struct CloseOutcome {
    pub timeline: Timeline,
    /// The stream ended while the reply was still waiting for a terminal event.
    pub transport_failure: bool,
    /// The reply survived, so the conversation may have its topic set.
    pub topic_eligible: bool,
}

/// Marks the turn's reply as stopped when it is still active; executing
/// steps become failed.
pub fn stop_turn_message(timeline: &Timeline, turn: &TurnContext) -> Timeline {
    let active = timeline
        .get(&turn.assistant_message_id)
        .is_some_and(|message| message.is_active());
    if !active {
        return timeline.clone();
    }
    timeline
        .with_updated(&turn.assistant_message_id, |message| {
            message.status = Some(MessageStatus::Stopped);
            for step in &mut message.processing_list {
                if step.status == ProcessingStatus::Executing {
                    step.status = ProcessingStatus::Failed;
                }
            }
        })
        .unwrap_or_else(|| timeline.clone())
}

/// Demotes the turn's reply to `Error`. Returns `None` when there is nothing
/// to demote: the reply is gone or already completed.
pub fn fail_turn_message(timeline: &Timeline, turn: &TurnContext) -> Option<Timeline> {
    let message = timeline.get(&turn.assistant_message_id)?;
    if matches!(
        message.status,
        Some(MessageStatus::Complete | MessageStatus::Error)
    ) {
        return None;
    }
    timeline.with_updated(&turn.assistant_message_id, |message| {
        message.status = Some(MessageStatus::Error);
    })
}

pub fn reconcile_close(timeline: &Timeline, turn: &TurnContext) -> CloseOutcome {
    let Some(message) = timeline.get(&turn.assistant_message_id) else {
        debug!(turn_id = %turn.turn_id, "reply no longer in timeline at close");
        return CloseOutcome {
            timeline: timeline.clone(),
            transport_failure: false,
            topic_eligible: false,
        };
    };

    if !message.is_active() {
        return CloseOutcome {
            timeline: timeline.clone(),
            transport_failure: false,
            topic_eligible: message.status != Some(MessageStatus::Error),
        };
    }

    if turn.cancelled {
        return CloseOutcome {
            timeline: stop_turn_message(timeline, turn),
            transport_failure: false,
            topic_eligible: true,
        };
    }

    CloseOutcome {
        timeline: fail_turn_message(timeline, turn).unwrap_or_else(|| timeline.clone()),
        transport_failure: true,
        topic_eligible: false,
    }
}
