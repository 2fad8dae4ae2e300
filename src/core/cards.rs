//! Result cards produced by finished processing steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::message::{ProcessingInfo, ProcessingStatus};
use crate::utils::json::null_as_default;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BindCardStyle {
    #[default]
    Single,
    List,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardBindConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub bind_card_style: BindCardStyle,
    #[serde(default)]
    pub card_id: Option<i64>,
    #[serde(default)]
    pub bind_link_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub image: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub card_key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub bind_link_url: String,
}

impl CardInfo {
    fn is_empty(&self) -> bool {
        self.image.is_empty()
            && self.title.is_empty()
            && self.content.is_empty()
            && self.card_key.is_empty()
    }
}

/// Cards currently shown for a conversation, and the request that produced them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CardBoard {
    pub cards: Vec<CardInfo>,
    pub owner_request_id: Option<String>,
}

impl CardBoard {
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// True when a finished step carries both halves of a card binding.
pub fn has_card_data(step: &ProcessingInfo) -> bool {
    step.status == ProcessingStatus::Finished
        && step.card_bind_config.as_ref().is_some_and(|v| !v.is_null())
        && step.card_data.as_ref().is_some_and(|v| !v.is_null())
}

/// Merges a step's cards into `board`.
///
/// List bindings append to the board while `request_id` still owns it and
/// replace it otherwise; single bindings always replace. Returns `None` when
/// the step has no usable card data, leaving the board untouched.
pub fn merge_cards(
    board: &CardBoard,
    step: &ProcessingInfo,
    request_id: &str,
) -> Option<CardBoard> {
    if !has_card_data(step) {
        return None;
    }
    let config: CardBindConfig = match step
        .card_bind_config
        .clone()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(config)) => config,
        Ok(None) => return None,
        Err(err) => {
            debug!(error = %err, request_id, "skipping malformed card binding");
            return None;
        }
    };
    let incoming = parse_cards(step.card_data.as_ref()?)?;

    let cards = match config.bind_card_style {
        BindCardStyle::List => {
            let incoming = incoming.into_iter().filter(|card| !card.is_empty());
            if board.owner_request_id.as_deref() == Some(request_id) {
                board.cards.iter().cloned().chain(incoming).collect()
            } else {
                incoming.collect()
            }
        }
        BindCardStyle::Single => incoming.into_iter().take(1).collect(),
    };

    Some(CardBoard {
        cards,
        owner_request_id: Some(request_id.to_string()),
    })
}

// Array payloads are decoded card by card so one bad entry only drops itself.
fn parse_cards(data: &Value) -> Option<Vec<CardInfo>> {
    let items = match data {
        Value::Array(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    };
    let cards: Vec<CardInfo> = items
        .iter()
        .filter_map(|item| match CardInfo::deserialize(item) {
            Ok(card) => Some(card),
            Err(err) => {
                debug!(error = %err, "skipping malformed card");
                None
            }
        })
        .collect();
    if cards.is_empty() && !items.is_empty() {
        return None;
    }
    Some(cards)
}
