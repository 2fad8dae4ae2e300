use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{
    ApiResponse, ChatRequest, ConversationId, ConversationInfo, ConversationSummary,
    DesktopSession, StaticFileInfo, TopicUpdate,
};
use crate::core::chat_stream::{StreamParams, TurnStreamService};
use crate::core::constants::{
    CHAT_STOP_ENDPOINT, CHAT_SUGGEST_ENDPOINT, CONVERSATION_ENDPOINT, CONVERSATION_LIST_ENDPOINT,
    CONVERSATION_UPDATE_ENDPOINT, DESKTOP_ENSURE_ENDPOINT, DESKTOP_KEEPALIVE_ENDPOINT,
    FILE_LIST_ENDPOINT, MESSAGE_LIST_ENDPOINT, SUCCESS_CODE,
};
use crate::core::message::Message;
use crate::core::session::TurnId;
use crate::utils::url::construct_api_url;

/// Bearer token supplied by the embedding application.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.0.is_empty() {
            return request;
        }
        request.header("Authorization", format!("Bearer {}", self.0))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[derive(Debug)]
pub enum ApiError {
    Transport(reqwest::Error),
    Status { status: u16, body: String },
    Business { code: String, message: String },
    Decode(serde_json::Error),
    MissingData,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport(err) => write!(f, "request failed: {err}"),
            ApiError::Status { status, body } => {
                write!(f, "request failed with status {status}: {body}")
            }
            ApiError::Business { code, message } => write!(f, "{message} ({code})"),
            ApiError::Decode(err) => write!(f, "invalid response body: {err}"),
            ApiError::MissingData => write!(f, "response carried no data"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(err) => Some(err),
            ApiError::Decode(err) => Some(err),
            ApiError::Status { .. } | ApiError::Business { .. } | ApiError::MissingData => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err)
    }
}

/// Everything the engine needs from the agent server.
///
/// The runtime talks to the server only through this trait, so tests swap in
/// a scripted implementation.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Opens the streaming exchange for one turn. Implementations report
    /// into `streams` and finish with exactly one `End` for `turn_id`.
    fn spawn_turn_stream(
        &self,
        streams: &TurnStreamService,
        request: ChatRequest,
        cancel_token: CancellationToken,
        turn_id: TurnId,
    );

    async fn query_conversation(&self, id: ConversationId) -> Result<ConversationInfo, ApiError>;

    /// One page of messages older than `before_index`.
    async fn list_messages(
        &self,
        id: ConversationId,
        before_index: Option<i64>,
        size: usize,
    ) -> Result<Vec<Message>, ApiError>;

    async fn update_topic(
        &self,
        id: ConversationId,
        first_message: &str,
    ) -> Result<TopicUpdate, ApiError>;

    async fn list_history(
        &self,
        agent_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, ApiError>;

    async fn suggest(&self, request: &ChatRequest) -> Result<Vec<String>, ApiError>;

    async fn stop(&self, id: ConversationId, request_id: Option<&str>) -> Result<(), ApiError>;

    async fn list_files(&self, id: ConversationId) -> Result<Vec<StaticFileInfo>, ApiError>;

    async fn ensure_desktop(&self, id: ConversationId) -> Result<DesktopSession, ApiError>;

    async fn keepalive(&self, id: ConversationId) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
    token: AuthToken,
    idle_timeout: Duration,
}

impl HttpConversationApi {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: AuthToken,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token,
            idle_timeout,
        }
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<Option<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = construct_api_url(&self.base_url, endpoint);
        debug!(%url, "calling agent api");
        let request = self
            .token
            .apply(self.client.post(url).header("Content-Type", "application/json"))
            .json(body);
        read_envelope(request.send().await?).await
    }

    async fn get<T>(&self, endpoint: &str) -> Result<Option<T>, ApiError>
    where
        T: DeserializeOwned,
    {
        let url = construct_api_url(&self.base_url, endpoint);
        debug!(%url, "calling agent api");
        let request = self.token.apply(self.client.get(url));
        read_envelope(request.send().await?).await
    }
}

async fn read_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Option<T>, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    parse_envelope(&body)
}

pub(crate) fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<Option<T>, ApiError> {
    let envelope: ApiResponse<T> = serde_json::from_str(body).map_err(ApiError::Decode)?;
    if envelope.code != SUCCESS_CODE {
        return Err(ApiError::Business {
            code: envelope.code,
            message: envelope.message.unwrap_or_default(),
        });
    }
    Ok(envelope.data)
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    fn spawn_turn_stream(
        &self,
        streams: &TurnStreamService,
        request: ChatRequest,
        cancel_token: CancellationToken,
        turn_id: TurnId,
    ) {
        streams.spawn_stream(StreamParams {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            request,
            idle_timeout: self.idle_timeout,
            cancel_token,
            turn_id,
        });
    }

    async fn query_conversation(&self, id: ConversationId) -> Result<ConversationInfo, ApiError> {
        self.get(&format!("{CONVERSATION_ENDPOINT}/{id}"))
            .await?
            .ok_or(ApiError::MissingData)
    }

    async fn list_messages(
        &self,
        id: ConversationId,
        before_index: Option<i64>,
        size: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let body = json!({ "conversationId": id, "index": before_index, "size": size });
        Ok(self.post(MESSAGE_LIST_ENDPOINT, &body).await?.unwrap_or_default())
    }

    async fn update_topic(
        &self,
        id: ConversationId,
        first_message: &str,
    ) -> Result<TopicUpdate, ApiError> {
        let body = json!({ "id": id, "firstMessage": first_message });
        Ok(self
            .post(CONVERSATION_UPDATE_ENDPOINT, &body)
            .await?
            .unwrap_or_default())
    }

    async fn list_history(
        &self,
        agent_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let body = json!({ "agentId": agent_id, "limit": limit });
        Ok(self
            .post(CONVERSATION_LIST_ENDPOINT, &body)
            .await?
            .unwrap_or_default())
    }

    async fn suggest(&self, request: &ChatRequest) -> Result<Vec<String>, ApiError> {
        Ok(self
            .post(CHAT_SUGGEST_ENDPOINT, request)
            .await?
            .unwrap_or_default())
    }

    async fn stop(&self, id: ConversationId, request_id: Option<&str>) -> Result<(), ApiError> {
        let body = json!({ "conversationId": id, "requestId": request_id });
        self.post::<_, serde_json::Value>(CHAT_STOP_ENDPOINT, &body)
            .await
            .map(|_| ())
    }

    async fn list_files(&self, id: ConversationId) -> Result<Vec<StaticFileInfo>, ApiError> {
        Ok(self
            .get(&format!("{FILE_LIST_ENDPOINT}/{id}"))
            .await?
            .unwrap_or_default())
    }

    async fn ensure_desktop(&self, id: ConversationId) -> Result<DesktopSession, ApiError> {
        let body = json!({ "conversationId": id });
        Ok(self
            .post(DESKTOP_ENSURE_ENDPOINT, &body)
            .await?
            .unwrap_or_default())
    }

    async fn keepalive(&self, id: ConversationId) -> Result<(), ApiError> {
        let body = json!({ "conversationId": id });
        self.post::<_, serde_json::Value>(DESKTOP_KEEPALIVE_ENDPOINT, &body)
            .await
            .map(|_| ())
    }
}
