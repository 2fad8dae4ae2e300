use serde_json::{json, Value};

use crate::api::{ChatRequest, ConversationEvent, ConversationId};
use crate::core::config::EngineConfig;
use crate::core::engine::{SessionEngine, TurnRequest};
use crate::core::message::{Message, Timeline};
use crate::core::session::{ConversationSession, TurnContext, TurnId};

pub fn test_config() -> EngineConfig {
    EngineConfig {
        base_url: "https://agents.test".to_string(),
        ..EngineConfig::default()
    }
}

pub fn create_test_engine() -> SessionEngine {
    SessionEngine::new(test_config())
}

pub fn turn_request(conversation_id: ConversationId, message: &str) -> TurnRequest {
    TurnRequest::new(conversation_id, message)
}

pub fn event(value: Value) -> ConversationEvent {
    serde_json::from_value(value).expect("conversation event")
}

pub fn processing_event(request_id: &str, data: Value) -> ConversationEvent {
    event(json!({ "eventType": "PROCESSING", "requestId": request_id, "data": data }))
}

pub fn message_event(request_id: &str, data: Value) -> ConversationEvent {
    event(json!({ "eventType": "MESSAGE", "requestId": request_id, "data": data }))
}

pub fn final_result_event(request_id: &str, data: Value) -> ConversationEvent {
    event(json!({ "eventType": "FINAL_RESULT", "requestId": request_id, "data": data }))
}

/// A timeline holding one user message and its loading reply, plus the turn
/// that owns them.
pub fn test_turn(conversation_id: ConversationId) -> (Timeline, TurnContext) {
    let user = Message::user("hello", Vec::new());
    let reply = Message::assistant_placeholder();
    let session = ConversationSession::new(conversation_id);
    let request = ChatRequest {
        conversation_id,
        message: user.text.clone(),
        attachments: Vec::new(),
        debug: false,
        selected_components: Vec::new(),
        variable_params: None,
    };
    let turn = TurnContext::new(TurnId(conversation_id as u64), &session, request, &user, &reply);
    (Timeline::new(vec![user, reply]), turn)
}
