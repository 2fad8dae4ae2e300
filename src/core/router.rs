//! Side effects triggered by processing steps.
//!
//! Routing is pure: it reads a step plus the turn's captured conversation and
//! returns the effects to run. Every effect carries the conversation id the
//! turn started with.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::api::ConversationId;
use crate::core::constants::OPEN_DESKTOP_EVENT;
use crate::core::message::{ComponentKind, ProcessingInfo, ProcessingStatus};
use crate::core::session::{RouterState, ViewState};

/// A page the agent wants rendered next to the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePreview {
    pub uri: String,
    pub params: Value,
    pub execute_id: String,
    pub method: Option<String>,
    pub request_id: Option<String>,
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    OpenDesktop {
        conversation_id: ConversationId,
    },
    RefreshFileList {
        conversation_id: ConversationId,
    },
    PagePreview(PagePreview),
    OpenLink {
        url: String,
    },
    /// Select a file the finished task produced.
    PreviewTaskFile {
        conversation_id: ConversationId,
        file_id: String,
    },
    /// The agent is still busy with another task; ask before stopping it.
    ConfirmBusy {
        conversation_id: ConversationId,
        message: String,
    },
    RequestSuggestions,
}

pub struct RouteInput<'a> {
    pub conversation_id: ConversationId,
    pub view: &'a ViewState,
    pub now: Instant,
    pub file_refresh_debounce: Duration,
}

pub fn route_step(
    step: &ProcessingInfo,
    input: &RouteInput<'_>,
    state: &mut RouterState,
) -> Vec<SideEffect> {
    let mut effects = Vec::new();

    if step.status == ProcessingStatus::Executing && step.kind == ComponentKind::Page {
        if let Some(effect) = route_page(step, state) {
            effects.push(effect);
        }
    }

    if step.kind == ComponentKind::Event
        && step.sub_event_type.as_deref() == Some(OPEN_DESKTOP_EVENT)
        && !state.desktop_opened
    {
        state.desktop_opened = true;
        effects.push(SideEffect::OpenDesktop {
            conversation_id: input.conversation_id,
        });
    }

    if step.kind == ComponentKind::ToolCall && input.view.shows_file_preview() {
        let due = state
            .last_file_refresh
            .is_none_or(|last| input.now.duration_since(last) >= input.file_refresh_debounce);
        if due {
            state.last_file_refresh = Some(input.now);
            effects.push(SideEffect::RefreshFileList {
                conversation_id: input.conversation_id,
            });
        }
    }

    effects
}

fn route_page(step: &ProcessingInfo, state: &mut RouterState) -> Option<SideEffect> {
    let Some(input) = step.result.as_ref().and_then(|r| r.get("input")) else {
        debug!("page step without input, skipping preview");
        return None;
    };
    let uri = input.get("uri").and_then(Value::as_str)?.to_string();
    let execute_id = step.resolved_execute_id().unwrap_or_default();
    let key = if execute_id.is_empty() {
        uri.clone()
    } else {
        execute_id.clone()
    };
    if !state.previewed.insert(key) {
        return None;
    }

    let arguments = input.get("arguments").cloned().unwrap_or(Value::Null);
    let text = |field: &str| input.get(field).and_then(Value::as_str).map(str::to_string);

    match input.get("uri_type").and_then(Value::as_str).unwrap_or("Page") {
        "Link" => link_url(&uri, &arguments).map(|url| SideEffect::OpenLink { url }),
        _ => Some(SideEffect::PagePreview(PagePreview {
            uri,
            params: if arguments.is_null() {
                Value::Object(Default::default())
            } else {
                arguments
            },
            execute_id,
            method: text("method"),
            request_id: text("request_id"),
            data_type: text("data_type"),
        })),
    }
}

fn link_url(uri: &str, arguments: &Value) -> Option<String> {
    let query = encode_arguments(arguments);
    match reqwest::Url::parse(uri) {
        Ok(mut url) => {
            if let Some(query) = query {
                let joined = match url.query().filter(|q| !q.is_empty()) {
                    Some(existing) => format!("{existing}&{query}"),
                    None => query,
                };
                url.set_query(Some(&joined));
            }
            Some(url.into())
        }
        // Path-only links resolve against wherever the client is hosted.
        Err(_) if is_path(uri) => {
            Some(match query {
                Some(query) if uri.contains('?') => format!("{uri}&{query}"),
                Some(query) => format!("{uri}?{query}"),
                None => uri.to_string(),
            })
        }
        Err(err) => {
            debug!(uri, error = %err, "skipping link with invalid uri");
            None
        }
    }
}

fn is_path(uri: &str) -> bool {
    !uri.is_empty() && !uri.contains("://") && !uri.contains(char::is_whitespace)
}

/// Form-encodes step arguments; non-string values use their JSON text.
fn encode_arguments(arguments: &Value) -> Option<String> {
    let arguments = arguments.as_object().filter(|a| !a.is_empty())?;
    let mut scratch = reqwest::Url::parse("http://localhost/").ok()?;
    {
        let mut pairs = scratch.query_pairs_mut();
        for (key, value) in arguments {
            match value {
                Value::String(s) => pairs.append_pair(key, s),
                other => pairs.append_pair(key, &other.to_string()),
            };
        }
    }
    scratch.query().map(str::to_string)
}

/// Extracts the produced file id from a final output that references
/// `<conversation_id>/<file>`.
pub fn task_file_id(output_text: &str, conversation_id: ConversationId) -> Option<String> {
    let marker = format!("{conversation_id}/");
    let start = output_text
        .match_indices(&marker)
        .filter(|(at, _)| {
            !output_text[..*at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_digit())
        })
        .map(|(at, _)| at + marker.len())
        .last()?;
    let file: String = output_text[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && !matches!(c, ')' | ']' | '"' | '\'' | '`' | '>'))
        .collect();
    let file = file.trim_end_matches(['.', ',', ';', ':', '。', '，']);
    (!file.is_empty()).then(|| file.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(view: &ViewState, now: Instant) -> RouteInput<'_> {
        RouteInput {
            conversation_id: 42,
            view,
            now,
            file_refresh_debounce: Duration::from_secs(1),
        }
    }

    fn page_step(uri_type: Option<&str>, uri: &str) -> ProcessingInfo {
        let mut step = ProcessingInfo::new(ProcessingStatus::Executing, ComponentKind::Page);
        step.execute_id = Some("exec-1".into());
        let mut page_input = json!({ "uri": uri, "arguments": { "q": "rust lang", "n": 2 } });
        if let Some(kind) = uri_type {
            page_input["uri_type"] = json!(kind);
        }
        step.result = Some(json!({ "input": page_input }));
        step
    }

    #[test]
    fn desktop_opens_once_per_turn_for_the_captured_conversation() {
        let view = ViewState::hidden();
        let mut state = RouterState::default();
        let mut step = ProcessingInfo::new(ProcessingStatus::Executing, ComponentKind::Event);
        step.sub_event_type = Some(OPEN_DESKTOP_EVENT.into());

        let first = route_step(&step, &input(&view, Instant::now()), &mut state);
        let second = route_step(&step, &input(&view, Instant::now()), &mut state);

        assert_eq!(first, vec![SideEffect::OpenDesktop { conversation_id: 42 }]);
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_refreshes_are_gated_and_debounced() {
        let step = ProcessingInfo::new(ProcessingStatus::Finished, ComponentKind::ToolCall);
        let mut state = RouterState::default();

        let hidden = ViewState::hidden();
        assert!(route_step(&step, &input(&hidden, Instant::now()), &mut state).is_empty());

        let preview = ViewState::preview();
        let refresh = vec![SideEffect::RefreshFileList { conversation_id: 42 }];
        assert_eq!(route_step(&step, &input(&preview, Instant::now()), &mut state), refresh);
        assert!(route_step(&step, &input(&preview, Instant::now()), &mut state).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(route_step(&step, &input(&preview, Instant::now()), &mut state), refresh);
    }

    #[test]
    fn page_steps_preview_once_per_execute_id() {
        let view = ViewState::hidden();
        let mut state = RouterState::default();
        let step = page_step(None, "/pages/report");

        let effects = route_step(&step, &input(&view, Instant::now()), &mut state);
        match effects.as_slice() {
            [SideEffect::PagePreview(preview)] => {
                assert_eq!(preview.uri, "/pages/report");
                assert_eq!(preview.execute_id, "exec-1");
                assert_eq!(preview.params["q"], "rust lang");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(route_step(&step, &input(&view, Instant::now()), &mut state).is_empty());
    }

    #[test]
    fn link_steps_open_with_encoded_arguments() {
        let view = ViewState::hidden();
        let mut state = RouterState::default();
        let step = page_step(Some("Link"), "https://example.com/search");

        let effects = route_step(&step, &input(&view, Instant::now()), &mut state);
        assert_eq!(
            effects,
            vec![SideEffect::OpenLink {
                url: "https://example.com/search?n=2&q=rust+lang".into()
            }]
        );

        let mut state = RouterState::default();
        let broken = page_step(Some("Link"), "not a url");
        assert!(route_step(&broken, &input(&view, Instant::now()), &mut state).is_empty());
    }

    #[test]
    fn path_links_open_with_their_arguments() {
        let view = ViewState::hidden();
        let mut state = RouterState::default();
        let step = page_step(Some("Link"), "/pages/x");
        assert_eq!(
            route_step(&step, &input(&view, Instant::now()), &mut state),
            vec![SideEffect::OpenLink {
                url: "/pages/x?n=2&q=rust+lang".into()
            }]
        );

        let mut state = RouterState::default();
        let mut bare = page_step(Some("Link"), "/pages/y?tab=1");
        bare.result = Some(json!({ "input": { "uri": "/pages/y?tab=1", "uri_type": "Link" } }));
        assert_eq!(
            route_step(&bare, &input(&view, Instant::now()), &mut state),
            vec![SideEffect::OpenLink {
                url: "/pages/y?tab=1".into()
            }]
        );
    }

    #[test]
    fn finished_page_steps_do_not_preview() {
        let view = ViewState::hidden();
        let mut state = RouterState::default();
        let mut step = page_step(None, "/pages/report");
        step.status = ProcessingStatus::Finished;
        assert!(route_step(&step, &input(&view, Instant::now()), &mut state).is_empty());
    }

    #[test]
    fn task_file_id_follows_the_conversation_segment() {
        assert_eq!(
            task_file_id("Saved to /data/42/report.md.", 42).as_deref(),
            Some("report.md")
        );
        assert_eq!(
            task_file_id("see [file](/files/42/out/chart.png)", 42).as_deref(),
            Some("out/chart.png")
        );
        assert!(task_file_id("nothing here", 42).is_none());
        assert!(task_file_id("other /7/report.md", 42).is_none());
        assert!(task_file_id("other /142/report.md", 42).is_none());
    }
}
