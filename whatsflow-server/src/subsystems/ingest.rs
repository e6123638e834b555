//! Status ingestor: authenticated entry point for connector callbacks.

use std::net::IpAddr;
use std::sync::Arc;

use whatsflow_core::config::CallbackConfig;
use whatsflow_core::{Result, Session, SessionId, WhatsflowError};

use crate::subsystems::registry::{SessionRegistry, StatusUpdate};
use crate::subsystems::supervisor::ConnectorSupervisor;

/// Header carrying the per-process callback token.
pub const CALLBACK_TOKEN_HEADER: &str = "x-whatsflow-token";

pub struct StatusIngestor {
    registry: Arc<SessionRegistry>,
    supervisor: Arc<ConnectorSupervisor>,
    config: CallbackConfig,
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

impl StatusIngestor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        supervisor: Arc<ConnectorSupervisor>,
        config: CallbackConfig,
    ) -> Self {
        Self {
            registry,
            supervisor,
            config,
        }
    }

    /// Reject callbacks that did not come from the session's own connector.
    pub fn authenticate(
        &self,
        session_id: SessionId,
        peer: Option<IpAddr>,
        token: Option<&str>,
    ) -> Result<()> {
        match peer {
            Some(ip) if self.config.allow_remote || is_loopback(ip) => {}
            None if self.config.allow_remote => {}
            Some(ip) => {
                return Err(WhatsflowError::Unauthorized(format!(
                    "status callbacks are not accepted from {}",
                    ip
                )))
            }
            None => {
                return Err(WhatsflowError::Unauthorized(
                    "status callback peer is unknown".to_string(),
                ))
            }
        }

        if self.config.require_token && !self.supervisor.verify_token(session_id, token) {
            return Err(WhatsflowError::Unauthorized(format!(
                "invalid callback token for session {}",
                session_id
            )));
        }
        Ok(())
    }

    pub async fn on_callback(
        &self,
        session_id: SessionId,
        peer: Option<IpAddr>,
        token: Option<&str>,
        update: StatusUpdate,
    ) -> Result<Session> {
        if let Err(e) = self.authenticate(session_id, peer, token) {
            tracing::warn!(session_id, peer = ?peer, error = %e, "Rejected status callback");
            return Err(e);
        }
        self.registry.apply_status(session_id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use whatsflow_core::config::{ConnectorConfig, SupervisorConfig};
    use whatsflow_core::{AddressAllocator, MemoryStore, SessionStatus};

    fn ingestor(config: CallbackConfig) -> StatusIngestor {
        let (supervisor, _exits) = ConnectorSupervisor::new(
            ConnectorConfig {
                program: "/nonexistent/whatsflow-connector".to_string(),
                ..ConnectorConfig::default()
            },
            SupervisorConfig::default(),
            AddressAllocator::default(),
        );
        let supervisor = Arc::new(supervisor);
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            supervisor.clone(),
        ));
        StatusIngestor::new(registry, supervisor, config)
    }

    const LOCAL: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_loopback(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_loopback(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped())));
        assert!(!is_loopback(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
    }

    #[test]
    fn test_remote_peer_rejected_by_default() {
        let ingestor = ingestor(CallbackConfig::default());
        assert!(ingestor.authenticate(1, LOCAL, None).is_ok());

        let remote = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert!(matches!(
            ingestor.authenticate(1, remote, None),
            Err(WhatsflowError::Unauthorized(_))
        ));
        assert!(matches!(
            ingestor.authenticate(1, None, None),
            Err(WhatsflowError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_allow_remote_accepts_any_peer() {
        let ingestor = ingestor(CallbackConfig {
            allow_remote: true,
            require_token: false,
        });
        let remote = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert!(ingestor.authenticate(1, remote, None).is_ok());
    }

    #[test]
    fn test_required_token_without_process_is_rejected() {
        let ingestor = ingestor(CallbackConfig {
            allow_remote: false,
            require_token: true,
        });
        assert!(matches!(
            ingestor.authenticate(1, LOCAL, Some("guess")),
            Err(WhatsflowError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_accepted_callback_updates_session() {
        let ingestor = ingestor(CallbackConfig::default());
        let session = ingestor
            .registry
            .create(Some("acct1".into()), None)
            .await
            .unwrap();

        let updated = ingestor
            .on_callback(session.id, LOCAL, None, StatusUpdate::status(SessionStatus::Connected))
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Connected);
    }
}
