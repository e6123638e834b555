//! Connector address allocation.
//!
//! Every session's connector listens on `host:(base_port + session_id)`. The
//! mapping is pure: the same id always yields the same address, across calls
//! and across control-plane restarts. It is collision-free as long as session
//! ids are unique, which the store guarantees.

use std::fmt;

use serde::Serialize;

use crate::config::ConnectorConfig;
use crate::error::{Result, WhatsflowError};
use crate::models::SessionId;

/// Default first port of the connector range. Session 1 listens on 3001.
pub const DEFAULT_BASE_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectorAddress {
    pub host: String,
    pub port: u16,
}

impl ConnectorAddress {
    /// `http://host:port` with no trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

impl fmt::Display for ConnectorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct AddressAllocator {
    host: String,
    base_port: u16,
}

impl AddressAllocator {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(config.host.clone(), config.base_port)
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn address_for(&self, session_id: SessionId) -> Result<ConnectorAddress> {
        let port = u16::try_from(session_id)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| {
                WhatsflowError::Validation(format!(
                    "session {} has no connector port above base {}",
                    session_id, self.base_port
                ))
            })?;

        Ok(ConnectorAddress {
            host: self.host.clone(),
            port,
        })
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_BASE_PORT)
    }
}
