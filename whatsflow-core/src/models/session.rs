use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WhatsflowError;

pub type SessionId = i64;

/// Connector lifecycle state as seen by the control plane.
///
/// `disconnected -> awaiting_qr -> connected -> disconnected`, with
/// `disconnected -> connected` for connectors that restore saved credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    AwaitingQr,
    Connected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingQr => "awaiting_qr",
            Self::Connected => "connected",
        }
    }

    /// Any state may drop to `disconnected` and repeating a state is a no-op.
    /// A connected session has to disconnect before it can pair again.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !matches!(
            (self, next),
            (SessionStatus::Connected, SessionStatus::AwaitingQr)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = WhatsflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            // older connectors report the pairing state as qr_code_ready
            "awaiting_qr" | "qr_code_ready" => Ok(Self::AwaitingQr),
            "connected" => Ok(Self::Connected),
            other => Err(WhatsflowError::InvalidState(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    /// Opaque connector continuation state, never returned to clients.
    #[serde(skip_serializing)]
    pub session_data: Option<String>,
    #[serde(skip_serializing)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// True when the client-visible and persisted fields match, ignoring
    /// bookkeeping (`version`, timestamps).
    pub fn same_content(&self, other: &Session) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.status == other.status
            && self.qr_code == other.qr_code
            && self.session_data == other.session_data
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: String,
    pub description: Option<String>,
}

/// Client-editable session fields. `description: Some(None)` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPatch {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "super::deserialize_present")]
    pub description: Option<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_canonical_and_legacy_names() {
        assert_eq!("disconnected".parse::<SessionStatus>().unwrap(), SessionStatus::Disconnected);
        assert_eq!("awaiting_qr".parse::<SessionStatus>().unwrap(), SessionStatus::AwaitingQr);
        assert_eq!("qr_code_ready".parse::<SessionStatus>().unwrap(), SessionStatus::AwaitingQr);
        assert_eq!("connected".parse::<SessionStatus>().unwrap(), SessionStatus::Connected);
    }

    #[test]
    fn test_unknown_status_is_invalid_state() {
        let err = "authenticating".parse::<SessionStatus>().unwrap_err();
        assert!(matches!(err, WhatsflowError::InvalidState(_)));
    }

    #[test]
    fn test_transitions() {
        use SessionStatus::*;
        assert!(Disconnected.can_transition_to(AwaitingQr));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(AwaitingQr.can_transition_to(Connected));
        assert!(AwaitingQr.can_transition_to(AwaitingQr));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(AwaitingQr));
    }

    #[test]
    fn test_serialized_session_hides_internal_fields() {
        let now = Utc::now();
        let session = Session {
            id: 1,
            name: "acct1".into(),
            description: None,
            status: SessionStatus::AwaitingQr,
            qr_code: Some("ABC".into()),
            session_data: Some("secret".into()),
            version: 4,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "awaiting_qr");
        assert_eq!(json["qr_code"], "ABC");
        assert!(json.get("session_data").is_none());
        assert!(json.get("version").is_none());
    }

    #[test]
    fn test_patch_distinguishes_cleared_description() {
        let patch: SessionPatch = serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(patch.name, None);
        assert_eq!(patch.description, Some(None));
    }
}
