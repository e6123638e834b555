use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhatsflowError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session {0} is not connected")]
    NotConnected(i64),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Address {0} is already in use")]
    AddressInUse(String),

    #[error("Connector unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("Connector did not respond within {0}s")]
    Timeout(u64),

    /// Connector answered with a non-success status; body is relayed verbatim.
    #[error("Connector returned {status}: {body}")]
    Connector { status: u16, body: String },

    #[error("Failed to spawn connector: {0}")]
    SpawnFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl WhatsflowError {
    /// HTTP-equivalent status code for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidState(_) | Self::NotConnected(_) => 400,
            Self::Unauthorized(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::AddressInUse(_) => 409,
            Self::BridgeUnavailable(_) => 502,
            Self::Timeout(_) => 504,
            Self::Connector { status, .. } => *status,
            Self::SpawnFailed(_)
            | Self::Database(_)
            | Self::Codec(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Other(_) => 500,
        }
    }

    /// Message safe to hand to API clients. Internal failures are collapsed
    /// into a generic message; the detail goes to the log instead.
    pub fn public_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Codec(_) | Self::Config(_) | Self::Io(_) | Self::Other(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status_code() >= 500 && !matches!(self, Self::Connector { .. })
    }
}

pub type Result<T, E = WhatsflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(WhatsflowError::Validation("x".into()).status_code(), 400);
        assert_eq!(WhatsflowError::NotConnected(3).status_code(), 400);
        assert_eq!(WhatsflowError::NotFound("x".into()).status_code(), 404);
        assert_eq!(WhatsflowError::Conflict("x".into()).status_code(), 409);
        assert_eq!(WhatsflowError::BridgeUnavailable("x".into()).status_code(), 502);
        assert_eq!(WhatsflowError::Timeout(10).status_code(), 504);
        assert_eq!(WhatsflowError::SpawnFailed("x".into()).status_code(), 500);
    }

    #[test]
    fn test_connector_status_is_relayed() {
        let err = WhatsflowError::Connector {
            status: 422,
            body: "{\"error\":\"bad chat\"}".into(),
        };
        assert_eq!(err.status_code(), 422);
        assert!(!err.is_internal());
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = WhatsflowError::Other("connection string leaked".into());
        assert_eq!(err.public_message(), "internal error");
        assert!(err.is_internal());
    }
}
