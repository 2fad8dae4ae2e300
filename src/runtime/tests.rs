use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::api::{
    ChatRequest, ConversationEvent, ConversationInfo, ConversationSummary, DesktopSession,
    StaticFileInfo, TopicUpdate,
};
use crate::core::message::{Message, MessageStatus};
use crate::utils::test_utils::{final_result_event, message_event, test_config, turn_request};

/// Server stand-in that replays a fixed event list for every turn.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    pub events: Vec<ConversationEvent>,
    /// Keep the stream open after the events until the turn is cancelled.
    pub hold_open: bool,
    pub keepalive_fails: bool,
    pub conversation: Option<ConversationInfo>,
    pub keepalives: StdMutex<Vec<ConversationId>>,
    pub topics: StdMutex<Vec<(ConversationId, String)>>,
    pub stops: StdMutex<Vec<(ConversationId, Option<String>)>>,
}

impl ScriptedApi {
    pub fn keepalive_calls(&self) -> Vec<ConversationId> {
        self.keepalives.lock().expect("lock").clone()
    }

    pub fn topic_calls(&self) -> Vec<(ConversationId, String)> {
        self.topics.lock().expect("lock").clone()
    }

    pub fn stop_calls(&self) -> Vec<(ConversationId, Option<String>)> {
        self.stops.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ConversationApi for ScriptedApi {
    fn spawn_turn_stream(
        &self,
        streams: &TurnStreamService,
        _request: ChatRequest,
        cancel_token: CancellationToken,
        turn_id: TurnId,
    ) {
        for event in &self.events {
            streams.send_for_test(StreamMessage::Event(event.clone()), turn_id);
        }
        if self.hold_open {
            let streams = streams.clone();
            tokio::spawn(async move {
                cancel_token.cancelled().await;
                streams.send_for_test(StreamMessage::End, turn_id);
            });
        } else {
            streams.send_for_test(StreamMessage::End, turn_id);
        }
    }

    async fn query_conversation(&self, _id: ConversationId) -> Result<ConversationInfo, ApiError> {
        self.conversation.clone().ok_or(ApiError::MissingData)
    }

    async fn list_messages(
        &self,
        _id: ConversationId,
        _before_index: Option<i64>,
        _size: usize,
    ) -> Result<Vec<Message>, ApiError> {
        Ok(Vec::new())
    }

    async fn update_topic(
        &self,
        id: ConversationId,
        first_message: &str,
    ) -> Result<TopicUpdate, ApiError> {
        self.topics
            .lock()
            .expect("lock")
            .push((id, first_message.to_string()));
        Ok(TopicUpdate {
            topic: Some(format!("About {first_message}")),
            topic_updated: Some(1),
        })
    }

    async fn list_history(
        &self,
        _agent_id: Option<i64>,
        _limit: usize,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        Ok(Vec::new())
    }

    async fn suggest(&self, _request: &ChatRequest) -> Result<Vec<String>, ApiError> {
        Ok(vec!["Next?".to_string()])
    }

    async fn stop(&self, id: ConversationId, request_id: Option<&str>) -> Result<(), ApiError> {
        self.stops
            .lock()
            .expect("lock")
            .push((id, request_id.map(str::to_string)));
        Ok(())
    }

    async fn list_files(&self, _id: ConversationId) -> Result<Vec<StaticFileInfo>, ApiError> {
        Ok(Vec::new())
    }

    async fn ensure_desktop(&self, _id: ConversationId) -> Result<DesktopSession, ApiError> {
        Ok(DesktopSession::default())
    }

    async fn keepalive(&self, id: ConversationId) -> Result<(), ApiError> {
        self.keepalives.lock().expect("lock").push(id);
        if self.keepalive_fails {
            return Err(ApiError::Status {
                status: 503,
                body: "desktop offline".into(),
            });
        }
        Ok(())
    }
}

async fn wait_for(
    notices: &mut broadcast::Receiver<EngineNotice>,
    matches: impl Fn(&EngineNotice) -> bool,
) -> EngineNotice {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match notices.recv().await {
                Ok(notice) if matches(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(err) => panic!("notice channel closed: {err}"),
            }
        }
    })
    .await
    .expect("notice arrives in time")
}

#[tokio::test(start_paused = true)]
async fn turn_streams_into_the_timeline_and_names_the_conversation() {
    let api = Arc::new(ScriptedApi {
        events: vec![
            message_event("r1", json!({ "type": "CHAT", "text": "Hel" })),
            message_event("r1", json!({ "type": "CHAT", "text": "lo" })),
            final_result_event("r1", json!({ "success": true })),
        ],
        ..ScriptedApi::default()
    });
    let runtime = SessionRuntime::spawn(test_config(), api.clone());
    let mut notices = runtime.subscribe();

    runtime
        .start_turn(turn_request(7, "hello"))
        .await
        .expect("turn starts");
    let topic = wait_for(&mut notices, |n| matches!(n, EngineNotice::TopicChanged { .. })).await;
    assert_eq!(
        topic,
        EngineNotice::TopicChanged {
            conversation_id: 7,
            topic: Some("About hello".into()),
        }
    );

    let timeline = runtime.get_timeline().await;
    let reply = timeline.last().expect("reply");
    assert_eq!(reply.text, "Hello");
    assert_eq!(reply.status, Some(MessageStatus::Complete));
    assert_eq!(api.topic_calls(), vec![(7, "hello".to_string())]);
    assert!(runtime.get_active_request_id().await.is_none());
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_turn_settles_as_stopped() {
    let api = Arc::new(ScriptedApi {
        events: vec![message_event("r1", json!({ "text": "partial" }))],
        hold_open: true,
        ..ScriptedApi::default()
    });
    let runtime = SessionRuntime::spawn(test_config(), api.clone());
    let mut notices = runtime.subscribe();

    runtime
        .start_turn(turn_request(7, "take your time"))
        .await
        .expect("turn starts");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runtime.get_active_request_id().await.as_deref(), Some("r1"));
    assert_eq!(runtime.get_timeline().await.last().expect("reply").text, "partial");

    runtime.cancel_turn().await;
    wait_for(&mut notices, |n| {
        matches!(n, EngineNotice::TimelineChanged { turn_active: false })
    })
    .await;

    let timeline = runtime.get_timeline().await;
    let reply = timeline.last().expect("reply");
    assert_eq!(reply.status, Some(MessageStatus::Stopped));
    assert_eq!(reply.text, "partial");
    assert!(api.stop_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn busy_agent_prompt_stops_the_server_task_on_accept() {
    let api = Arc::new(ScriptedApi {
        events: vec![final_result_event(
            "r1",
            json!({ "success": false, "error": "当前智能体正在执行任务" }),
        )],
        ..ScriptedApi::default()
    });
    let runtime = SessionRuntime::spawn(test_config(), api.clone());
    let mut notices = runtime.subscribe();

    runtime
        .start_turn(turn_request(7, "again"))
        .await
        .expect("turn starts");
    wait_for(&mut notices, |n| matches!(n, EngineNotice::ConfirmBusy(_))).await;
    assert!(matches!(
        runtime.start_turn(turn_request(7, "once more")).await,
        Err(EngineError::ConfirmationPending)
    ));

    runtime.resolve_busy_confirmation(true).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(api.stop_calls(), vec![(7, Some("r1".to_string()))]);
    assert!(runtime.start_turn(turn_request(7, "now")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn desktop_view_keeps_the_loaded_conversation_alive() {
    let api = Arc::new(ScriptedApi {
        conversation: Some(ConversationInfo {
            id: 5,
            topic: Some("Old".into()),
            message_list: vec![Message::user("earlier", Vec::new())],
            ..ConversationInfo::default()
        }),
        ..ScriptedApi::default()
    });
    let runtime = SessionRuntime::spawn(test_config(), api.clone());

    runtime.load_conversation(5).await.expect("loaded");
    assert_eq!(runtime.get_timeline().await.len(), 1);

    runtime.set_view_state(ViewState::desktop()).await;
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(api.keepalive_calls(), vec![5, 5]);

    runtime.set_view_state(ViewState::preview()).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(api.keepalive_calls().len(), 2);

    runtime.reset_session().await;
    assert!(runtime.get_timeline().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_session() {
    let api = Arc::new(ScriptedApi {
        conversation: Some(ConversationInfo {
            id: 3,
            ..ConversationInfo::default()
        }),
        ..ScriptedApi::default()
    });
    let runtime = SessionRuntime::spawn(test_config(), api.clone());
    let mut notices = runtime.subscribe();
    let second = runtime.clone();

    runtime.load_conversation(3).await.expect("loaded");
    runtime.set_view_state(ViewState::desktop()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(api.keepalive_calls(), vec![3]);

    drop(runtime);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(api.keepalive_calls().len(), 3, "one live handle keeps it running");

    drop(second);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let settled = api.keepalive_calls().len();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(api.keepalive_calls().len(), settled);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match notices.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("notice channel closes with the session");
}

#[tokio::test]
async fn missing_conversation_is_reported() {
    let runtime = SessionRuntime::spawn(test_config(), Arc::new(ScriptedApi::default()));
    let err = runtime.load_conversation(1).await.expect_err("no conversation");
    assert!(matches!(err, ApiError::MissingData));
    assert!(matches!(
        runtime.load_more_messages().await,
        Err(EngineError::NoSession)
    ));
}
