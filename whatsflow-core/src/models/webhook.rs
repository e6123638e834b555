use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;
use crate::error::Result;

pub type WebhookId = i64;

/// Events subscribed when a webhook is created without an explicit list.
pub const DEFAULT_EVENTS: &[&str] = &[
    "message",
    "message_create",
    "message_ack",
    "group_join",
    "group_leave",
];

pub fn default_events() -> BTreeSet<String> {
    DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    pub session_id: SessionId,
    pub events: BTreeSet<String>,
    pub headers: BTreeMap<String, String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.is_active && self.events.contains(event)
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub session_id: SessionId,
    pub events: BTreeSet<String>,
    pub headers: BTreeMap<String, String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub session_id: Option<SessionId>,
    pub events: Option<BTreeSet<String>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub is_active: Option<bool>,
}

impl WebhookPatch {
    pub fn apply(self, webhook: &mut Webhook) {
        if let Some(name) = self.name {
            webhook.name = name;
        }
        if let Some(url) = self.url {
            webhook.url = url;
        }
        if let Some(session_id) = self.session_id {
            webhook.session_id = session_id;
        }
        if let Some(events) = self.events {
            webhook.events = events;
        }
        if let Some(headers) = self.headers {
            webhook.headers = headers;
        }
        if let Some(is_active) = self.is_active {
            webhook.is_active = is_active;
        }
    }
}

// ============================================================================
// Text codec for the `events` / `headers` columns
// ============================================================================

pub fn encode_events(events: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(events)?)
}

/// NULL or empty text decodes to the empty set.
pub fn decode_events(text: Option<&str>) -> Result<BTreeSet<String>> {
    match text.map(str::trim) {
        None | Some("") => Ok(BTreeSet::new()),
        Some(raw) => Ok(serde_json::from_str(raw)?),
    }
}

pub fn encode_headers(headers: &BTreeMap<String, String>) -> Result<String> {
    Ok(serde_json::to_string(headers)?)
}

pub fn decode_headers(text: Option<&str>) -> Result<BTreeMap<String, String>> {
    match text.map(str::trim) {
        None | Some("") => Ok(BTreeMap::new()),
        Some(raw) => Ok(serde_json::from_str(raw)?),
    }
}
