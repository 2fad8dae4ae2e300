//! Shared constants used across the engine

/// Business success code in every [`crate::api::ApiResponse`] envelope.
pub const SUCCESS_CODE: &str = "0000";

/// Substring of a `FINAL_RESULT` error meaning the agent is still running
/// another task for the same conversation.
pub const AGENT_BUSY_MARKER: &str = "正在执行任务";

/// Substring of a `FINAL_RESULT` error meaning the user stopped the task.
pub const USER_CANCELLED_MARKER: &str = "用户主动取消任务";

/// Sub-event type of an `Event` step that asks for the remote desktop.
pub const OPEN_DESKTOP_EVENT: &str = "OPEN_DESKTOP";

pub const CHAT_STREAM_ENDPOINT: &str = "api/agent/conversation/chat";
pub const CHAT_STOP_ENDPOINT: &str = "api/agent/conversation/chat/stop";
pub const CHAT_SUGGEST_ENDPOINT: &str = "api/agent/conversation/chat/suggest";
pub const CONVERSATION_ENDPOINT: &str = "api/agent/conversation";
pub const CONVERSATION_UPDATE_ENDPOINT: &str = "api/agent/conversation/update";
pub const CONVERSATION_LIST_ENDPOINT: &str = "api/agent/conversation/list";
pub const MESSAGE_LIST_ENDPOINT: &str = "api/agent/conversation/message/list";
pub const FILE_LIST_ENDPOINT: &str = "api/computer/static/file-list";
pub const DESKTOP_ENSURE_ENDPOINT: &str = "api/computer/pod/ensure";
pub const DESKTOP_KEEPALIVE_ENDPOINT: &str = "api/computer/pod/keepalive";
