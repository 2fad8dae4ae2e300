//! Async driver around [`SessionEngine`].
//!
//! The runtime owns the engine behind an async mutex, feeds it stream
//! messages and background results, fires the coalescing flush when its
//! deadline passes, and executes every [`EngineCommand`] the engine returns.
//! UI code calls the handle's methods and listens on [`SessionRuntime::subscribe`].

pub mod keepalive;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::api::client::{ApiError, AuthToken, ConversationApi, HttpConversationApi};
use crate::api::ConversationId;
use crate::core::chat_stream::{StreamMessage, TurnStreamService};
use crate::core::config::EngineConfig;
use crate::core::engine::{
    EngineAction, EngineCommand, EngineError, EngineNotice, SessionEngine, TurnRequest,
};
use crate::core::message::Timeline;
use crate::core::session::{TurnId, ViewState};

use keepalive::KeepalivePoller;

const NOTICE_CAPACITY: usize = 256;

/// Shared, lock-guarded engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Mutex<SessionEngine>>,
}

impl EngineHandle {
    pub fn new(inner: Arc<Mutex<SessionEngine>>) -> Self {
        Self { inner }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&SessionEngine) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionEngine) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }
}

#[derive(Clone)]
struct ActionDispatcher {
    tx: mpsc::UnboundedSender<EngineAction>,
}

impl ActionDispatcher {
    fn dispatch(&self, action: EngineAction) {
        let _ = self.tx.send(action);
    }
}

/// Runs commands against the server and routes results back.
#[derive(Clone)]
struct CommandExecutor {
    api: Arc<dyn ConversationApi>,
    streams: TurnStreamService,
    dispatcher: ActionDispatcher,
    notices: broadcast::Sender<EngineNotice>,
    keepalive: Arc<Mutex<Option<KeepalivePoller>>>,
    keepalive_interval: Duration,
}

impl CommandExecutor {
    async fn execute(&self, commands: Vec<EngineCommand>) {
        for command in commands {
            self.execute_one(command).await;
        }
    }

    async fn execute_one(&self, command: EngineCommand) {
        match command {
            EngineCommand::SpawnStream {
                turn_id,
                request,
                cancel_token,
            } => {
                self.api
                    .spawn_turn_stream(&self.streams, request, cancel_token, turn_id);
            }
            EngineCommand::UpdateTopic {
                conversation_id,
                agent_id,
                first_message,
            } => self.spawn(move |api| async move {
                match api.update_topic(conversation_id, &first_message).await {
                    Ok(update) => Some(EngineAction::TopicUpdated {
                        conversation_id,
                        agent_id,
                        update,
                    }),
                    Err(err) => Some(EngineAction::TopicUpdateFailed {
                        conversation_id,
                        error: err.to_string(),
                    }),
                }
            }),
            EngineCommand::RefreshHistory { agent_id, limit } => {
                let notices = self.notices.clone();
                self.spawn(move |api| async move {
                    match api.list_history(agent_id, limit).await {
                        Ok(conversations) => {
                            let _ = notices.send(EngineNotice::HistoryRefreshed {
                                agent_id,
                                conversations,
                            });
                        }
                        Err(err) => warn!(?agent_id, error = %err, "history refresh failed"),
                    }
                    None
                })
            }
            EngineCommand::RequestSuggestions {
                conversation_id,
                request,
            } => self.spawn(move |api| async move {
                match api.suggest(&request).await {
                    Ok(suggestions) => Some(EngineAction::SuggestionsLoaded {
                        conversation_id,
                        suggestions,
                    }),
                    Err(err) => {
                        warn!(conversation_id, error = %err, "suggestions failed");
                        None
                    }
                }
            }),
            EngineCommand::StopConversation {
                conversation_id,
                request_id,
            } => {
                let notices = self.notices.clone();
                self.spawn(move |api| async move {
                    if let Err(err) = api.stop(conversation_id, request_id.as_deref()).await {
                        warn!(conversation_id, error = %err, "stopping the agent failed");
                        let _ = notices.send(EngineNotice::Error(err.to_string()));
                    }
                    None
                })
            }
            EngineCommand::FetchMessages {
                conversation_id,
                before_index,
                size,
            } => self.spawn(move |api| async move {
                Some(
                    match api.list_messages(conversation_id, before_index, size).await {
                        Ok(messages) => EngineAction::MessagesPageLoaded {
                            conversation_id,
                            messages,
                        },
                        Err(err) => EngineAction::MessagesPageFailed {
                            conversation_id,
                            error: err.to_string(),
                        },
                    },
                )
            }),
            EngineCommand::RefreshFileList { conversation_id } => {
                let notices = self.notices.clone();
                self.spawn(move |api| async move {
                    match api.list_files(conversation_id).await {
                        Ok(files) => {
                            let _ = notices.send(EngineNotice::FilesRefreshed {
                                conversation_id,
                                files,
                            });
                        }
                        Err(err) => {
                            warn!(conversation_id, error = %err, "file list refresh failed")
                        }
                    }
                    None
                })
            }
            EngineCommand::EnsureDesktop { conversation_id } => self.spawn(move |api| async move {
                match api.ensure_desktop(conversation_id).await {
                    Ok(desktop) => debug!(conversation_id, ?desktop, "desktop ready"),
                    Err(err) => warn!(conversation_id, error = %err, "opening the desktop failed"),
                }
                None
            }),
            EngineCommand::StartKeepalive { conversation_id } => {
                let poller = KeepalivePoller::spawn(
                    self.api.clone(),
                    conversation_id,
                    self.keepalive_interval,
                );
                if let Some(previous) = self.keepalive.lock().await.replace(poller) {
                    previous.stop();
                }
            }
            EngineCommand::StopKeepalive => {
                if let Some(previous) = self.keepalive.lock().await.take() {
                    previous.stop();
                }
            }
        }
    }

    /// Runs one API call in the background and feeds its follow-up action,
    /// if any, back to the engine.
    fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<dyn ConversationApi>) -> Fut,
        Fut: Future<Output = Option<EngineAction>> + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let fut = task(self.api.clone());
        tokio::spawn(async move {
            if let Some(action) = fut.await {
                dispatcher.dispatch(action);
            }
        });
    }
}

/// Handle to a running session. Cloning shares the same session.
///
/// The driver task stops when [`SessionRuntime::shutdown`] is called or the
/// last handle is dropped.
#[derive(Clone)]
pub struct SessionRuntime {
    engine: EngineHandle,
    api: Arc<dyn ConversationApi>,
    executor: CommandExecutor,
    notices: broadcast::Sender<EngineNotice>,
    shutdown: CancellationToken,
    // Held by caller handles only; the driver's copy is `None`.
    _lifetime: Option<Arc<DropGuard>>,
}

impl SessionRuntime {
    /// Builds the HTTP client for `config.base_url` and starts the runtime.
    pub fn connect(config: EngineConfig, token: AuthToken) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().build()?;
        let api = HttpConversationApi::new(
            client,
            config.base_url.clone(),
            token,
            config.idle_timeout(),
        );
        Ok(Self::spawn(config, Arc::new(api)))
    }

    /// Starts the driver task. Must be called inside a tokio runtime.
    pub fn spawn(config: EngineConfig, api: Arc<dyn ConversationApi>) -> Self {
        let keepalive_interval = config.keepalive_interval();
        let engine = EngineHandle::new(Arc::new(Mutex::new(SessionEngine::new(config))));
        let (streams, stream_rx) = TurnStreamService::new();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let shutdown = CancellationToken::new();

        let executor = CommandExecutor {
            api: api.clone(),
            streams,
            dispatcher: ActionDispatcher { tx: action_tx },
            notices: notices.clone(),
            keepalive: Arc::new(Mutex::new(None)),
            keepalive_interval,
        };

        let driver = Self {
            engine,
            api,
            executor,
            notices,
            shutdown: shutdown.clone(),
            _lifetime: None,
        };
        let runtime = Self {
            _lifetime: Some(Arc::new(shutdown.drop_guard())),
            ..driver.clone()
        };
        tokio::spawn(driver.drive(stream_rx, action_rx));
        runtime
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnId, EngineError> {
        let (result, notices) = self
            .engine
            .update(|engine| {
                let result = engine
                    .start_turn(request)
                    .map(|commands| (commands, engine.active_turn_id()));
                (result, engine.drain_notices())
            })
            .await;
        self.publish(notices);
        let (commands, turn_id) = result?;
        self.executor.execute(commands).await;
        turn_id.ok_or(EngineError::NoSession)
    }

    pub async fn cancel_turn(&self) {
        self.apply(vec![EngineAction::CancelTurn]).await;
    }

    pub async fn get_timeline(&self) -> Timeline {
        self.engine.read(SessionEngine::timeline).await
    }

    pub async fn get_active_request_id(&self) -> Option<String> {
        self.engine
            .read(|engine| engine.active_request_id().map(str::to_string))
            .await
    }

    pub async fn reset_session(&self) {
        self.apply(vec![EngineAction::ResetSession]).await;
    }

    /// Fetches a conversation and makes it the current session.
    pub async fn load_conversation(&self, id: ConversationId) -> Result<(), ApiError> {
        let info = self.api.query_conversation(id).await?;
        self.apply(vec![EngineAction::ConversationLoaded(Box::new(info))])
            .await;
        Ok(())
    }

    pub async fn load_more_messages(&self) -> Result<(), EngineError> {
        let (result, notices) = self
            .engine
            .update(|engine| (engine.load_more_messages(), engine.drain_notices()))
            .await;
        self.publish(notices);
        self.executor.execute(result?).await;
        Ok(())
    }

    pub async fn resolve_busy_confirmation(&self, accept: bool) {
        self.apply(vec![EngineAction::ResolveBusyConfirmation { accept }])
            .await;
    }

    pub async fn set_view_state(&self, view: ViewState) {
        self.apply(vec![EngineAction::SetViewState(view)]).await;
    }

    /// Stops the driver task and the keepalive. Streams already open finish
    /// on their own.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(poller) = self.executor.keepalive.lock().await.take() {
            poller.stop();
        }
    }

    async fn apply(&self, actions: Vec<EngineAction>) {
        let (commands, notices) = self
            .engine
            .update(|engine| {
                let commands: Vec<_> = actions
                    .into_iter()
                    .flat_map(|action| engine.apply_action(action))
                    .collect();
                (commands, engine.drain_notices())
            })
            .await;
        self.publish(notices);
        self.executor.execute(commands).await;
    }

    fn publish(&self, notices: Vec<EngineNotice>) {
        for notice in notices {
            // No subscribers is fine.
            let _ = self.notices.send(notice);
        }
    }

    async fn drive(
        self,
        mut stream_rx: mpsc::UnboundedReceiver<(StreamMessage, TurnId)>,
        mut action_rx: mpsc::UnboundedReceiver<EngineAction>,
    ) {
        debug!("session runtime started");
        loop {
            let deadline = self.engine.read(SessionEngine::flush_deadline).await;
            let flush_due = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let mut actions = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some((message, turn_id)) = stream_rx.recv() => {
                    vec![stream_action(message, turn_id)]
                }
                Some(action) = action_rx.recv() => vec![action],
                _ = flush_due => vec![EngineAction::FlushDue],
                else => break,
            };

            while let Ok((message, turn_id)) = stream_rx.try_recv() {
                actions.push(stream_action(message, turn_id));
            }
            while let Ok(action) = action_rx.try_recv() {
                actions.push(action);
            }
            self.apply(actions).await;
        }
        if let Some(poller) = self.executor.keepalive.lock().await.take() {
            poller.stop();
        }
        debug!("session runtime stopped");
    }
}

fn stream_action(message: StreamMessage, turn_id: TurnId) -> EngineAction {
    match message {
        StreamMessage::Event(event) => EngineAction::StreamEvent { turn_id, event },
        StreamMessage::Error(message) => EngineAction::StreamErrored { turn_id, message },
        StreamMessage::End => EngineAction::StreamClosed { turn_id },
    }
}

#[cfg(test)]
pub(crate) mod tests;
