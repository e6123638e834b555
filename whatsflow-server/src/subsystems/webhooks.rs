//! Webhook subscription records. Delivery is out of scope; this service only
//! stores configuration and answers "who subscribes to event X".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;

use whatsflow_core::models::webhook::default_events;
use whatsflow_core::models::{NewWebhook, WebhookPatch};
use whatsflow_core::{Result, SessionId, SessionStore, Webhook, WebhookId, WhatsflowError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateWebhook {
    pub name: Option<String>,
    pub url: Option<String>,
    pub session_id: Option<SessionId>,
    pub events: Option<BTreeSet<String>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub is_active: Option<bool>,
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(WhatsflowError::Validation(format!("{} is required", name))),
    }
}

pub struct WebhookConfigService {
    store: Arc<dyn SessionStore>,
}

impl WebhookConfigService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    async fn ensure_session(&self, session_id: SessionId) -> Result<()> {
        match self.store.get_session(session_id).await? {
            Some(_) => Ok(()),
            None => Err(WhatsflowError::NotFound(format!(
                "Session {} not found",
                session_id
            ))),
        }
    }

    pub async fn create(&self, request: CreateWebhook) -> Result<Webhook> {
        let name = required(request.name, "name")?;
        let url = required(request.url, "url")?;
        let session_id = request
            .session_id
            .ok_or_else(|| WhatsflowError::Validation("session_id is required".to_string()))?;
        self.ensure_session(session_id).await?;

        let webhook = self
            .store
            .insert_webhook(NewWebhook {
                name,
                url,
                session_id,
                events: request.events.unwrap_or_else(default_events),
                headers: request.headers.unwrap_or_default(),
                is_active: request.is_active.unwrap_or(true),
            })
            .await?;
        tracing::info!(webhook_id = webhook.id, session_id, "Created webhook");
        Ok(webhook)
    }

    pub async fn get(&self, id: WebhookId) -> Result<Webhook> {
        self.store
            .get_webhook(id)
            .await?
            .ok_or_else(|| WhatsflowError::NotFound(format!("Webhook {} not found", id)))
    }

    pub async fn list(&self, session_id: Option<SessionId>) -> Result<Vec<Webhook>> {
        self.store.list_webhooks(session_id).await
    }

    pub async fn update(&self, id: WebhookId, mut patch: WebhookPatch) -> Result<Webhook> {
        let mut webhook = self.get(id).await?;
        if let Some(name) = patch.name.take() {
            patch.name = Some(required(Some(name), "name")?);
        }
        if let Some(url) = patch.url.take() {
            patch.url = Some(required(Some(url), "url")?);
        }
        if let Some(session_id) = patch.session_id {
            if session_id != webhook.session_id {
                self.ensure_session(session_id).await?;
            }
        }

        patch.apply(&mut webhook);
        self.store
            .update_webhook(&webhook)
            .await?
            .ok_or_else(|| WhatsflowError::NotFound(format!("Webhook {} not found", id)))
    }

    pub async fn delete(&self, id: WebhookId) -> Result<()> {
        if self.store.delete_webhook(id).await? {
            Ok(())
        } else {
            Err(WhatsflowError::NotFound(format!("Webhook {} not found", id)))
        }
    }

    /// Active webhooks of `session_id` subscribed to `event`.
    pub async fn subscribers(&self, session_id: SessionId, event: &str) -> Result<Vec<Webhook>> {
        self.ensure_session(session_id).await?;
        Ok(self
            .store
            .list_webhooks(Some(session_id))
            .await?
            .into_iter()
            .filter(|w| w.subscribes_to(event))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whatsflow_core::models::NewSession;
    use whatsflow_core::MemoryStore;

    async fn service_with_session() -> (WebhookConfigService, SessionId) {
        let store = Arc::new(MemoryStore::new());
        let session = store
            .insert_session(NewSession {
                name: "acct1".into(),
                description: None,
            })
            .await
            .unwrap();
        (WebhookConfigService::new(store), session.id)
    }

    fn request(session_id: SessionId) -> CreateWebhook {
        CreateWebhook {
            name: Some("crm".into()),
            url: Some("https://crm.example/hook".into()),
            session_id: Some(session_id),
            ..CreateWebhook::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let (service, session_id) = service_with_session().await;
        let webhook = service.create(request(session_id)).await.unwrap();
        assert!(webhook.is_active);
        assert_eq!(webhook.events, default_events());
        assert!(webhook.headers.is_empty());
    }

    #[tokio::test]
    async fn test_create_validates_fields() {
        let (service, session_id) = service_with_session().await;

        let no_url = CreateWebhook {
            url: None,
            ..request(session_id)
        };
        assert!(matches!(service.create(no_url).await, Err(WhatsflowError::Validation(_))));

        let no_session = CreateWebhook {
            session_id: None,
            ..request(session_id)
        };
        assert!(matches!(service.create(no_session).await, Err(WhatsflowError::Validation(_))));

        assert!(matches!(
            service.create(request(session_id + 100)).await,
            Err(WhatsflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_rechecks_session() {
        let (service, session_id) = service_with_session().await;
        let webhook = service.create(request(session_id)).await.unwrap();

        let moved = WebhookPatch {
            session_id: Some(session_id + 100),
            ..WebhookPatch::default()
        };
        assert!(matches!(
            service.update(webhook.id, moved).await,
            Err(WhatsflowError::NotFound(_))
        ));

        let paused = WebhookPatch {
            is_active: Some(false),
            ..WebhookPatch::default()
        };
        let updated = service.update(webhook.id, paused).await.unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.url, webhook.url);
    }

    #[tokio::test]
    async fn test_subscribers_filter_on_event_and_activity() {
        let (service, session_id) = service_with_session().await;
        let acks = service
            .create(CreateWebhook {
                events: Some(["message_ack".to_string()].into_iter().collect()),
                ..request(session_id)
            })
            .await
            .unwrap();
        service
            .create(CreateWebhook {
                name: Some("paused".into()),
                is_active: Some(false),
                ..request(session_id)
            })
            .await
            .unwrap();

        let subscribers = service.subscribers(session_id, "message_ack").await.unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].id, acks.id);
        assert!(service.subscribers(session_id, "group_join").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_session() {
        let (service, session_id) = service_with_session().await;
        service.create(request(session_id)).await.unwrap();
        assert_eq!(service.list(Some(session_id)).await.unwrap().len(), 1);
        assert!(service.list(Some(session_id + 1)).await.unwrap().is_empty());
        assert_eq!(service.list(None).await.unwrap().len(), 1);
    }
}
