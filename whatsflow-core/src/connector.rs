//! Wire types for the connector command API.
//!
//! Clients post camelCase JSON (`chatId`, `imageUrl`, ...) to the control
//! plane; after validation the same shape is forwarded to the connector at
//! `POST /api/<route>`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, WhatsflowError};

pub const DEFAULT_TYPING_DURATION_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Text,
    Image,
    Document,
    Audio,
    Seen,
    Typing,
}

impl CommandKind {
    pub const ALL: [CommandKind; 6] = [
        CommandKind::Text,
        CommandKind::Image,
        CommandKind::Document,
        CommandKind::Audio,
        CommandKind::Seen,
        CommandKind::Typing,
    ];

    /// Route segment shared by the control-plane and connector APIs.
    pub fn route(&self) -> &'static str {
        match self {
            Self::Text => "send-text",
            Self::Image => "send-image",
            Self::Document => "send-document",
            Self::Audio => "send-audio",
            Self::Seen => "seen",
            Self::Typing => "typing",
        }
    }

    /// Path on the connector.
    pub fn connector_path(&self) -> String {
        format!("/api/{}", self.route())
    }

    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.route() == route)
    }

    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Document | Self::Audio)
    }

    fn media_prefix(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            _ => "",
        }
    }
}

/// Where a media payload comes from. Exactly one per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    Base64(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCommand {
    Text {
        chat_id: String,
        message: String,
    },
    Media {
        kind: CommandKind,
        chat_id: String,
        source: MediaSource,
        caption: Option<String>,
        filename: Option<String>,
        mimetype: Option<String>,
    },
    Seen {
        chat_id: String,
    },
    Typing {
        chat_id: String,
        duration_ms: u64,
    },
}

/// Loose inbound body; every field optional so missing fields surface as
/// validation errors rather than deserialization failures.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    chat_id: Option<String>,
    message: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
    mimetype: Option<String>,
    duration: Option<u64>,
    image_url: Option<String>,
    image_base64: Option<String>,
    document_url: Option<String>,
    document_base64: Option<String>,
    audio_url: Option<String>,
    audio_base64: Option<String>,
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(WhatsflowError::Validation(format!("{} is required", name))),
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|v| !v.trim().is_empty())
}

impl ConnectorCommand {
    /// Validate a client payload for `kind`.
    pub fn parse(kind: CommandKind, payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(WhatsflowError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        }
        let raw: RawCommand = serde_json::from_value(payload)
            .map_err(|e| WhatsflowError::Validation(format!("malformed payload: {}", e)))?;
        let chat_id = required(raw.chat_id, "chatId")?;

        match kind {
            CommandKind::Text => Ok(Self::Text {
                chat_id,
                message: required(raw.message, "message")?,
            }),
            CommandKind::Seen => Ok(Self::Seen { chat_id }),
            CommandKind::Typing => Ok(Self::Typing {
                chat_id,
                duration_ms: raw.duration.unwrap_or(DEFAULT_TYPING_DURATION_MS),
            }),
            CommandKind::Image | CommandKind::Document | CommandKind::Audio => {
                let (url, base64) = match kind {
                    CommandKind::Image => (raw.image_url, raw.image_base64),
                    CommandKind::Document => (raw.document_url, raw.document_base64),
                    _ => (raw.audio_url, raw.audio_base64),
                };
                let prefix = kind.media_prefix();
                let source = match (non_empty(url), non_empty(base64)) {
                    (Some(url), None) => MediaSource::Url(url),
                    (None, Some(data)) => MediaSource::Base64(data),
                    (Some(_), Some(_)) => {
                        return Err(WhatsflowError::Validation(format!(
                            "provide only one of {p}Url or {p}Base64",
                            p = prefix
                        )))
                    }
                    (None, None) => {
                        return Err(WhatsflowError::Validation(format!(
                            "{p}Url or {p}Base64 is required",
                            p = prefix
                        )))
                    }
                };
                Ok(Self::Media {
                    kind,
                    chat_id,
                    source,
                    caption: raw.caption,
                    filename: raw.filename,
                    mimetype: raw.mimetype,
                })
            }
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Text { .. } => CommandKind::Text,
            Self::Media { kind, .. } => *kind,
            Self::Seen { .. } => CommandKind::Seen,
            Self::Typing { .. } => CommandKind::Typing,
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            Self::Text { chat_id, .. }
            | Self::Media { chat_id, .. }
            | Self::Seen { chat_id }
            | Self::Typing { chat_id, .. } => chat_id,
        }
    }

    /// JSON body for the connector request.
    pub fn to_body(&self) -> Value {
        match self {
            Self::Text { chat_id, message } => json!({ "chatId": chat_id, "message": message }),
            Self::Seen { chat_id } => json!({ "chatId": chat_id }),
            Self::Typing {
                chat_id,
                duration_ms,
            } => json!({ "chatId": chat_id, "duration": duration_ms }),
            Self::Media {
                kind,
                chat_id,
                source,
                caption,
                filename,
                mimetype,
            } => {
                let prefix = kind.media_prefix();
                let mut body = serde_json::Map::new();
                body.insert("chatId".to_string(), json!(chat_id));
                match source {
                    MediaSource::Url(url) => body.insert(format!("{}Url", prefix), json!(url)),
                    MediaSource::Base64(data) => {
                        body.insert(format!("{}Base64", prefix), json!(data))
                    }
                };
                if let Some(caption) = caption {
                    body.insert("caption".to_string(), json!(caption));
                }
                if let Some(filename) = filename {
                    body.insert("filename".to_string(), json!(filename));
                }
                if let Some(mimetype) = mimetype {
                    body.insert("mimetype".to_string(), json!(mimetype));
                }
                Value::Object(body)
            }
        }
    }
}

/// Successful connector answer, forwarded to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorReply {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub body: Value,
}

impl ConnectorReply {
    pub fn new(status: u16, body: Value) -> Self {
        let message_id = body
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            status,
            message_id,
            body,
        }
    }
}
