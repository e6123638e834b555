use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::SessionStore;
use crate::error::{Result, WhatsflowError};
use crate::models::{
    NewSession, NewWebhook, Session, SessionId, SessionStatus, Webhook, WebhookId,
};

#[derive(Debug, Default)]
struct Tables {
    sessions: BTreeMap<SessionId, Session>,
    webhooks: BTreeMap<WebhookId, Webhook>,
    next_session_id: SessionId,
    next_webhook_id: WebhookId,
}

impl Tables {
    fn name_taken(&self, name: &str, except: Option<SessionId>) -> bool {
        self.sessions
            .values()
            .any(|s| s.name == name && Some(s.id) != except)
    }
}

/// In-process store. Ids are issued monotonically from 1 like a serial column.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, new: NewSession) -> Result<Session> {
        let mut tables = self.tables.write().await;
        if tables.name_taken(&new.name, None) {
            return Err(WhatsflowError::Conflict(format!(
                "session name '{}' already exists",
                new.name
            )));
        }

        tables.next_session_id += 1;
        let now = Utc::now();
        let session = Session {
            id: tables.next_session_id,
            name: new.name,
            description: new.description,
            status: SessionStatus::Disconnected,
            qr_code: None,
            session_data: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.tables.read().await.sessions.values().cloned().collect())
    }

    async fn update_session(&self, session: &Session) -> Result<Option<Session>> {
        let mut tables = self.tables.write().await;
        let current_version = match tables.sessions.get(&session.id) {
            Some(current) => current.version,
            None => {
                return Err(WhatsflowError::NotFound(format!(
                    "session {} not found",
                    session.id
                )))
            }
        };
        if current_version != session.version {
            return Ok(None);
        }
        if tables.name_taken(&session.name, Some(session.id)) {
            return Err(WhatsflowError::Conflict(format!(
                "session name '{}' already exists",
                session.name
            )));
        }

        let mut stored = session.clone();
        stored.version += 1;
        stored.updated_at = Utc::now();
        tables.sessions.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.sessions.remove(&id).is_none() {
            return Ok(false);
        }
        tables.webhooks.retain(|_, w| w.session_id != id);
        Ok(true)
    }

    async fn insert_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&new.session_id) {
            return Err(WhatsflowError::NotFound(format!(
                "session {} not found",
                new.session_id
            )));
        }

        tables.next_webhook_id += 1;
        let now = Utc::now();
        let webhook = Webhook {
            id: tables.next_webhook_id,
            name: new.name,
            url: new.url,
            session_id: new.session_id,
            events: new.events,
            headers: new.headers,
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };
        tables.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        Ok(self.tables.read().await.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self, session_id: Option<SessionId>) -> Result<Vec<Webhook>> {
        Ok(self
            .tables
            .read()
            .await
            .webhooks
            .values()
            .filter(|w| session_id.map_or(true, |id| w.session_id == id))
            .cloned()
            .collect())
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<Option<Webhook>> {
        let mut tables = self.tables.write().await;
        if !tables.webhooks.contains_key(&webhook.id) {
            return Ok(None);
        }
        if !tables.sessions.contains_key(&webhook.session_id) {
            return Err(WhatsflowError::NotFound(format!(
                "session {} not found",
                webhook.session_id
            )));
        }

        let mut stored = webhook.clone();
        stored.updated_at = Utc::now();
        tables.webhooks.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn delete_webhook(&self, id: WebhookId) -> Result<bool> {
        Ok(self.tables.write().await.webhooks.remove(&id).is_some())
    }

    async fn health(&self) -> Result<String> {
        let tables = self.tables.read().await;
        Ok(format!(
            "memory ({} sessions, {} webhooks)",
            tables.sessions.len(),
            tables.webhooks.len()
        ))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
