use std::time::Duration;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::client::AuthToken;
use crate::api::{ChatRequest, ConversationEvent};
use crate::core::constants::CHAT_STREAM_ENDPOINT;
use crate::core::session::TurnId;
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug)]
pub enum StreamMessage {
    Event(ConversationEvent),
    Error(String),
    End,
}

type StreamSender = mpsc::UnboundedSender<(StreamMessage, TurnId)>;

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Returns true once the stream should stop reading.
fn handle_data_payload(payload: &str, tx: &StreamSender, turn_id: TurnId) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send((StreamMessage::End, turn_id));
        return true;
    }
    if payload.trim().is_empty() {
        return false;
    }

    match serde_json::from_str::<ConversationEvent>(payload) {
        Ok(event) => {
            let completed = event.completed;
            let _ = tx.send((StreamMessage::Event(event), turn_id));
            if completed {
                let _ = tx.send((StreamMessage::End, turn_id));
            }
            completed
        }
        Err(err) => {
            warn!(turn_id = %turn_id, error = %err, "skipping malformed stream event");
            false
        }
    }
}

fn process_sse_line(line: &str, tx: &StreamSender, turn_id: TurnId) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx, turn_id))
        .unwrap_or(false)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .get("message")
        .and_then(|v| v.as_str().map(str::to_owned))
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Turns a failed response body into a single notice line.
pub(crate) fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "Request failed".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("Request failed: {summary}");
            }
        }
        return format!("Request failed: {json_value}");
    }

    format!("Request failed: {trimmed}")
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub token: AuthToken,
    pub request: ChatRequest,
    pub idle_timeout: Duration,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub turn_id: TurnId,
}

/// Owns the sending half of the channel every turn stream reports into.
#[derive(Clone)]
pub struct TurnStreamService {
    tx: StreamSender,
}

impl TurnStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, TurnId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Opens the turn stream in a background task.
    ///
    /// Every path out of the task, cancellation included, ends with exactly one
    /// [`StreamMessage::End`] for `turn_id`.
    pub fn spawn_stream(&self, params: StreamParams) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                token,
                request,
                idle_timeout,
                cancel_token,
                turn_id,
            } = params;

            debug!(
                turn_id = %turn_id,
                conversation_id = request.conversation_id,
                "opening turn stream"
            );

            let ended = tokio::select! {
                ended = read_stream(
                    &client,
                    &base_url,
                    &token,
                    &request,
                    idle_timeout,
                    &tx,
                    turn_id,
                ) => ended,
                _ = cancel_token.cancelled() => {
                    debug!(turn_id = %turn_id, "turn stream cancelled");
                    false
                }
            };

            if !ended {
                let _ = tx.send((StreamMessage::End, turn_id));
            }
        });
    }

    #[cfg(test)]
    pub fn send_for_test(&self, message: StreamMessage, turn_id: TurnId) {
        let _ = self.tx.send((message, turn_id));
    }
}

/// Reads the stream to completion. Returns true when `End` was already sent.
async fn read_stream(
    client: &reqwest::Client,
    base_url: &str,
    token: &AuthToken,
    request: &ChatRequest,
    idle_timeout: Duration,
    tx: &StreamSender,
    turn_id: TurnId,
) -> bool {
    let url = construct_api_url(base_url, CHAT_STREAM_ENDPOINT);
    let http_request = token.apply(
        client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream"),
    );

    let response = match http_request.json(request).send().await {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send((StreamMessage::Error(format_api_error(&err.to_string())), turn_id));
            return false;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        let _ = tx.send((StreamMessage::Error(format_api_error(&error_text)), turn_id));
        return false;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => {
                warn!(turn_id = %turn_id, ?idle_timeout, "turn stream went idle");
                let _ = tx.send((
                    StreamMessage::Error("The agent stopped responding".to_string()),
                    turn_id,
                ));
                return false;
            }
        };

        let chunk_bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let message = format_api_error(&err.to_string());
                let _ = tx.send((StreamMessage::Error(message), turn_id));
                return false;
            }
        };
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let should_end = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(line) => process_sse_line(line.trim(), tx, turn_id),
                Err(err) => {
                    warn!(turn_id = %turn_id, error = %err, "invalid UTF-8 in stream");
                    false
                }
            };
            buffer.drain(..=newline_pos);
            if should_end {
                return true;
            }
        }
    }

    if let Ok(line) = std::str::from_utf8(&buffer) {
        if process_sse_line(line.trim(), tx, turn_id) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EventType;

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let (service, mut rx) = TurnStreamService::new();
        let variants = [
            (
                r#"data: {"eventType":"MESSAGE","requestId":"r1","data":{"text":"Hel"}}"#,
                "data: [DONE]",
            ),
            (
                r#"data:{"eventType":"MESSAGE","requestId":"r1","data":{"text":"lo"}}"#,
                "data:[DONE]",
            ),
        ];

        for (index, (event_line, done_line)) in variants.iter().enumerate() {
            let turn_id = TurnId(index as u64 + 1);

            assert!(!process_sse_line(event_line, &service.tx, turn_id));
            let (message, received_id) = rx.try_recv().expect("expected event message");
            assert_eq!(received_id, turn_id);
            match message {
                StreamMessage::Event(event) => {
                    assert_eq!(event.event_type, EventType::Message);
                    assert_eq!(event.request_id, "r1");
                }
                other => panic!("expected event message, got {:?}", other),
            }

            assert!(process_sse_line(done_line, &service.tx, turn_id));
            let (message, received_id) = rx.try_recv().expect("expected end message");
            assert_eq!(received_id, turn_id);
            assert!(matches!(message, StreamMessage::End));
        }

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completed_event_ends_the_stream() {
        let (service, mut rx) = TurnStreamService::new();
        let line = r#"data: {"eventType":"FINAL_RESULT","requestId":"r9","data":{"success":true},"completed":true}"#;

        assert!(process_sse_line(line, &service.tx, TurnId(4)));
        assert!(matches!(rx.try_recv(), Ok((StreamMessage::Event(_), TurnId(4)))));
        assert!(matches!(rx.try_recv(), Ok((StreamMessage::End, TurnId(4)))));
    }

    #[test]
    fn malformed_lines_and_comments_are_skipped() {
        let (service, mut rx) = TurnStreamService::new();

        assert!(!process_sse_line("data: {not json", &service.tx, TurnId(1)));
        assert!(!process_sse_line(": keep-alive", &service.tx, TurnId(1)));
        assert!(!process_sse_line("event: message", &service.tx, TurnId(1)));
        assert!(!process_sse_line("data:", &service.tx, TurnId(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn format_api_error_prefers_message_fields() {
        assert_eq!(
            format_api_error(r#"{"code":"4010","message":"token  expired"}"#),
            "Request failed: token expired"
        );
        assert_eq!(
            format_api_error(r#"{"error":{"message":"overloaded"}}"#),
            "Request failed: overloaded"
        );
        assert_eq!(
            format_api_error(r#"{"status":"failed"}"#),
            r#"Request failed: {"status":"failed"}"#
        );
        assert_eq!(format_api_error("  bad gateway "), "Request failed: bad gateway");
        assert_eq!(format_api_error(""), "Request failed");
    }
}
