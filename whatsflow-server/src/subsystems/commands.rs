//! Command router: forwards messaging commands to a session's connector.
//!
//! Order of checks: payload shape (400), session exists (404), session is
//! `connected` (400). Only then is the connector contacted.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use whatsflow_core::config::RouterConfig;
use whatsflow_core::{
    AddressAllocator, CommandKind, ConnectorAddress, ConnectorCommand, ConnectorReply, Result,
    SessionId, WhatsflowError,
};

use crate::subsystems::registry::SessionRegistry;

pub struct CommandRouter {
    registry: Arc<SessionRegistry>,
    allocator: AddressAllocator,
    client: Client,
    timeouts: RouterConfig,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        allocator: AddressAllocator,
        timeouts: RouterConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| WhatsflowError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            registry,
            allocator,
            client,
            timeouts,
        })
    }

    pub fn timeout_for(&self, kind: CommandKind) -> Duration {
        let secs = match kind {
            CommandKind::Text => self.timeouts.text_timeout_secs,
            CommandKind::Seen => self.timeouts.seen_timeout_secs,
            CommandKind::Typing => self.timeouts.typing_timeout_secs,
            CommandKind::Image | CommandKind::Document | CommandKind::Audio => {
                self.timeouts.media_timeout_secs
            }
        };
        Duration::from_secs(secs)
    }

    /// Validate a raw client payload and forward it.
    pub async fn dispatch(
        &self,
        session_id: SessionId,
        kind: CommandKind,
        payload: Value,
    ) -> Result<ConnectorReply> {
        let command = ConnectorCommand::parse(kind, payload)?;
        self.send(session_id, &command).await
    }

    pub async fn send(&self, session_id: SessionId, command: &ConnectorCommand) -> Result<ConnectorReply> {
        let session = self.registry.get(session_id).await?;
        if !session.is_connected() {
            return Err(WhatsflowError::NotConnected(session_id));
        }

        let kind = command.kind();
        let address = self.allocator.address_for(session_id)?;
        let url = address.url(&kind.connector_path());
        let timeout = self.timeout_for(kind);

        tracing::debug!(session_id, route = kind.route(), url = %url, "Forwarding command");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&command.to_body())
            .send()
            .await
            .map_err(|e| classify(e, timeout, &address))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify(e, timeout, &address))?;

        if !status.is_success() {
            tracing::warn!(session_id, route = kind.route(), status = status.as_u16(), "Connector rejected command");
            return Err(WhatsflowError::Connector {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ConnectorReply::new(status.as_u16(), body))
    }
}

fn classify(err: reqwest::Error, timeout: Duration, address: &ConnectorAddress) -> WhatsflowError {
    if err.is_timeout() {
        WhatsflowError::Timeout(timeout.as_secs())
    } else if err.is_connect() {
        WhatsflowError::BridgeUnavailable(format!("no connector listening at {}", address))
    } else {
        WhatsflowError::BridgeUnavailable(format!("connector at {}: {}", address, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use whatsflow_core::config::{ConnectorConfig, SupervisorConfig};
    use whatsflow_core::models::NewSession;
    use whatsflow_core::{MemoryStore, SessionStatus, SessionStore};

    use crate::subsystems::registry::StatusUpdate;
    use crate::subsystems::supervisor::ConnectorSupervisor;

    /// Router whose session 1 maps onto `port`.
    async fn router_for(port: u16, timeouts: RouterConfig) -> (CommandRouter, Arc<SessionRegistry>) {
        let allocator = AddressAllocator::new("127.0.0.1", port - 1);
        let (supervisor, _exits) = ConnectorSupervisor::new(
            ConnectorConfig::default(),
            SupervisorConfig::default(),
            allocator.clone(),
        );
        let store = Arc::new(MemoryStore::new());
        store
            .insert_session(NewSession {
                name: "acct1".into(),
                description: None,
            })
            .await
            .unwrap();
        let registry = Arc::new(SessionRegistry::new(store, Arc::new(supervisor)));
        let router = CommandRouter::new(registry.clone(), allocator, timeouts).unwrap();
        (router, registry)
    }

    async fn connect(registry: &SessionRegistry) {
        registry
            .apply_status(1, StatusUpdate::status(SessionStatus::Connected))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_text_forwarded_to_connector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/send-text"))
            .and(body_json(json!({"chatId": "123@c.us", "message": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "messageId": "M1"})))
            .expect(1)
            .mount(&server)
            .await;

        let (router, registry) = router_for(server.address().port(), RouterConfig::default()).await;
        connect(&registry).await;

        let reply = router
            .dispatch(1, CommandKind::Text, json!({"chatId": "123@c.us", "message": "hi"}))
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.message_id.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn test_disconnected_session_never_reaches_connector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (router, _registry) = router_for(server.address().port(), RouterConfig::default()).await;
        let err = router
            .dispatch(1, CommandKind::Seen, json!({"chatId": "123@c.us"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WhatsflowError::NotConnected(1)));
    }

    #[tokio::test]
    async fn test_validation_precedes_lookup() {
        let server = MockServer::start().await;
        let (router, _registry) = router_for(server.address().port(), RouterConfig::default()).await;

        let invalid = router
            .dispatch(99, CommandKind::Text, json!({"chatId": "123@c.us"}))
            .await
            .unwrap_err();
        assert!(matches!(invalid, WhatsflowError::Validation(_)));

        let missing = router
            .dispatch(99, CommandKind::Text, json!({"chatId": "123@c.us", "message": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(missing, WhatsflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_connector_error_is_relayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/send-image"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"success":false,"error":"media fetch failed"}"#))
            .mount(&server)
            .await;

        let (router, registry) = router_for(server.address().port(), RouterConfig::default()).await;
        connect(&registry).await;

        let err = router
            .dispatch(1, CommandKind::Image, json!({"chatId": "1@c.us", "imageUrl": "https://x/y.png"}))
            .await
            .unwrap_err();
        match err {
            WhatsflowError::Connector { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("media fetch failed"));
            }
            other => panic!("expected connector error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_connector_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let timeouts = RouterConfig {
            typing_timeout_secs: 1,
            ..RouterConfig::default()
        };
        let (router, registry) = router_for(server.address().port(), timeouts).await;
        connect(&registry).await;

        let err = router
            .dispatch(1, CommandKind::Typing, json!({"chatId": "1@c.us"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WhatsflowError::Timeout(1)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_absent_connector_is_bridge_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (router, registry) = router_for(port, RouterConfig::default()).await;
        connect(&registry).await;

        let err = router
            .dispatch(1, CommandKind::Seen, json!({"chatId": "1@c.us"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WhatsflowError::BridgeUnavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_media_gets_long_timeout() {
        let (router, _registry) = router_for(4000, RouterConfig::default()).await;
        assert_eq!(router.timeout_for(CommandKind::Document), Duration::from_secs(180));
        assert_eq!(router.timeout_for(CommandKind::Text), Duration::from_secs(10));
    }
}
