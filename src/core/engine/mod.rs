//! The session state machine.
//!
//! [`SessionEngine`] owns the timeline and everything that decides how it
//! changes. It performs no I/O: callers feed it [`EngineAction`]s and execute
//! the [`EngineCommand`]s it returns, then drain its [`EngineNotice`]s for the
//! UI. The async runtime in [`crate::runtime`] does exactly that.

mod conversation;
mod turns;

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{
    AttachmentFile, ChatRequest, ConversationEvent, ConversationId, ConversationInfo,
    ConversationSummary, SelectedComponent, StaticFileInfo, TopicUpdate,
};
use crate::core::cards::{CardBoard, CardInfo};
use crate::core::coalesce::CoalescingQueue;
use crate::core::config::EngineConfig;
use crate::core::message::{Message, Timeline};
use crate::core::router::PagePreview;
use crate::core::session::{ConversationSession, TurnContext, TurnId, ViewState};

/// What the user typed for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub attachments: Vec<AttachmentFile>,
    pub selected_components: Vec<SelectedComponent>,
    pub variable_params: Option<HashMap<String, Value>>,
}

impl TurnRequest {
    pub fn new(conversation_id: ConversationId, message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The agent-busy prompt must be answered before another turn starts.
    ConfirmationPending,
    EmptyMessage,
    NoSession,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ConfirmationPending => {
                write!(f, "the agent is busy; answer the pending confirmation first")
            }
            EngineError::EmptyMessage => write!(f, "nothing to send"),
            EngineError::NoSession => write!(f, "no conversation is loaded"),
        }
    }
}

impl StdError for EngineError {}

/// An agent-busy prompt waiting for the user.
#[derive(Debug, Clone, PartialEq)]
pub struct BusyConfirmation {
    pub conversation_id: ConversationId,
    pub request_id: Option<String>,
    pub message: String,
}

pub enum EngineAction {
    StartTurn(TurnRequest),
    CancelTurn,
    StreamEvent {
        turn_id: TurnId,
        event: ConversationEvent,
    },
    StreamErrored {
        turn_id: TurnId,
        message: String,
    },
    StreamClosed {
        turn_id: TurnId,
    },
    FlushDue,
    ResetSession,
    ConversationLoaded(Box<ConversationInfo>),
    LoadMoreMessages,
    MessagesPageLoaded {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessagesPageFailed {
        conversation_id: ConversationId,
        error: String,
    },
    TopicUpdated {
        conversation_id: ConversationId,
        agent_id: Option<i64>,
        update: TopicUpdate,
    },
    TopicUpdateFailed {
        conversation_id: ConversationId,
        error: String,
    },
    SuggestionsLoaded {
        conversation_id: ConversationId,
        suggestions: Vec<String>,
    },
    ResolveBusyConfirmation {
        accept: bool,
    },
    SetViewState(ViewState),
}

/// I/O the engine asks its caller to perform.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    SpawnStream {
        turn_id: TurnId,
        request: ChatRequest,
        cancel_token: CancellationToken,
    },
    UpdateTopic {
        conversation_id: ConversationId,
        agent_id: Option<i64>,
        first_message: String,
    },
    RefreshHistory {
        agent_id: Option<i64>,
        limit: usize,
    },
    RequestSuggestions {
        conversation_id: ConversationId,
        request: ChatRequest,
    },
    StopConversation {
        conversation_id: ConversationId,
        request_id: Option<String>,
    },
    FetchMessages {
        conversation_id: ConversationId,
        before_index: Option<i64>,
        size: usize,
    },
    RefreshFileList {
        conversation_id: ConversationId,
    },
    EnsureDesktop {
        conversation_id: ConversationId,
    },
    StartKeepalive {
        conversation_id: ConversationId,
    },
    StopKeepalive,
}

/// Things UI code reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    TimelineChanged {
        turn_active: bool,
    },
    /// User-visible failure, such as a dropped stream.
    Error(String),
    ConfirmBusy(BusyConfirmation),
    SuggestionsChanged(Vec<String>),
    CardsChanged(Vec<CardInfo>),
    PagePreview(PagePreview),
    OpenLink(String),
    DesktopOpened {
        conversation_id: ConversationId,
    },
    TaskFileSelected {
        conversation_id: ConversationId,
        file_id: String,
    },
    ViewChanged(ViewState),
    TopicChanged {
        conversation_id: ConversationId,
        topic: Option<String>,
    },
    FilesRefreshed {
        conversation_id: ConversationId,
        files: Vec<StaticFileInfo>,
    },
    HistoryRefreshed {
        agent_id: Option<i64>,
        conversations: Vec<ConversationSummary>,
    },
}

pub struct SessionEngine {
    config: EngineConfig,
    session: Option<ConversationSession>,
    timeline: Timeline,
    turn_active: bool,
    cards: CardBoard,
    view: ViewState,
    next_turn_id: u64,
    active: Option<TurnContext>,
    /// Superseded turns whose streams have not reported `End` yet.
    closing: HashMap<TurnId, TurnContext>,
    queue: CoalescingQueue<(TurnId, ConversationEvent)>,
    pending_confirmation: Option<BusyConfirmation>,
    topic_attempted: HashSet<ConversationId>,
    loading_more: bool,
    keepalive_for: Option<ConversationId>,
    notices: Vec<EngineNotice>,
}

impl SessionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let queue = CoalescingQueue::new(config.flush_interval(), config.queue_capacity);
        Self {
            config,
            session: None,
            timeline: Timeline::default(),
            turn_active: false,
            cards: CardBoard::default(),
            view: ViewState::default(),
            next_turn_id: 0,
            active: None,
            closing: HashMap::new(),
            queue,
            pending_confirmation: None,
            topic_attempted: HashSet::new(),
            loading_more: false,
            keepalive_for: None,
            notices: Vec::new(),
        }
    }

    pub fn apply_action(&mut self, action: EngineAction) -> Vec<EngineCommand> {
        match action {
            EngineAction::StartTurn(request) => match self.start_turn(request) {
                Ok(commands) => commands,
                Err(err) => {
                    self.notices.push(EngineNotice::Error(err.to_string()));
                    Vec::new()
                }
            },
            EngineAction::CancelTurn => {
                self.cancel_turn();
                Vec::new()
            }
            EngineAction::StreamEvent { turn_id, event } => {
                self.enqueue_event(turn_id, event);
                Vec::new()
            }
            EngineAction::StreamErrored { turn_id, message } => {
                self.stream_errored(turn_id, message)
            }
            EngineAction::StreamClosed { turn_id } => self.stream_closed(turn_id),
            EngineAction::FlushDue => self.flush(),

            EngineAction::ResetSession => self.reset_session(),
            EngineAction::ConversationLoaded(info) => self.load_conversation(*info),
            EngineAction::LoadMoreMessages => self.load_more_messages().unwrap_or_default(),
            EngineAction::MessagesPageLoaded {
                conversation_id,
                messages,
            } => {
                self.messages_page_loaded(conversation_id, messages);
                Vec::new()
            }
            EngineAction::MessagesPageFailed {
                conversation_id,
                error,
            } => {
                self.messages_page_failed(conversation_id, &error);
                Vec::new()
            }
            EngineAction::TopicUpdated {
                conversation_id,
                agent_id,
                update,
            } => self.topic_updated(conversation_id, agent_id, update),
            EngineAction::TopicUpdateFailed {
                conversation_id,
                error,
            } => {
                tracing::warn!(conversation_id, %error, "topic update failed");
                Vec::new()
            }
            EngineAction::SuggestionsLoaded {
                conversation_id,
                suggestions,
            } => {
                self.suggestions_loaded(conversation_id, suggestions);
                Vec::new()
            }
            EngineAction::ResolveBusyConfirmation { accept } => {
                self.resolve_busy_confirmation(accept)
            }
            EngineAction::SetViewState(view) => self.set_view_state(view),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the committed timeline.
    pub fn timeline(&self) -> Timeline {
        self.timeline.clone()
    }

    pub fn turn_active(&self) -> bool {
        self.turn_active
    }

    pub fn session(&self) -> Option<&ConversationSession> {
        self.session.as_ref()
    }

    pub fn cards(&self) -> &CardBoard {
        &self.cards
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn pending_confirmation(&self) -> Option<&BusyConfirmation> {
        self.pending_confirmation.as_ref()
    }

    /// Request id of the running turn, once its stream reported one.
    pub fn active_request_id(&self) -> Option<&str> {
        self.active.as_ref()?.request_id.as_deref()
    }

    pub fn active_turn_id(&self) -> Option<TurnId> {
        self.active.as_ref().map(|turn| turn.turn_id)
    }

    /// When the runtime should next send [`EngineAction::FlushDue`].
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.queue.deadline()
    }

    pub fn drain_notices(&mut self) -> Vec<EngineNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Records a result the runtime fetched on the engine's behalf.
    pub fn notify(&mut self, notice: EngineNotice) {
        self.notices.push(notice);
    }

    fn commit_timeline(&mut self, timeline: Timeline) {
        let changed = !timeline.same_version(&self.timeline);
        let turn_active = timeline.is_turn_active();
        if changed || turn_active != self.turn_active {
            self.timeline = timeline;
            self.turn_active = turn_active;
            self.notices.push(EngineNotice::TimelineChanged { turn_active });
        }
    }

    fn set_suggestions(&mut self, suggestions: Vec<String>) {
        if let Some(session) = self.session.as_mut() {
            if session.suggestions != suggestions {
                session.suggestions = suggestions.clone();
                self.notices.push(EngineNotice::SuggestionsChanged(suggestions));
            }
        }
    }

    fn current_conversation(&self) -> Option<ConversationId> {
        self.session.as_ref().map(|s| s.conversation_id)
    }
}
