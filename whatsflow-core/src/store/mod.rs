//! Durable record of sessions and webhooks.
//!
//! Pure CRUD with no lifecycle policy; `SessionRegistry` and
//! `WebhookConfigService` layer validation on top. Two backends:
//! - **Postgres**: production store via sqlx
//! - **Memory**: process-local store for tests and throwaway deployments

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{NewSession, NewWebhook, Session, SessionId, Webhook, WebhookId};

pub use memory::MemoryStore;
pub use postgres::PgSessionStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a `disconnected` session. Fails with `Conflict` on a duplicate name.
    async fn insert_session(&self, new: NewSession) -> Result<Session>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;

    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Compare-and-set write. Persists `session` only if the stored row still
    /// carries `session.version`; returns the new row (version bumped,
    /// `updated_at` refreshed), `Ok(None)` when the version is stale, and
    /// `NotFound` when the row is gone.
    async fn update_session(&self, session: &Session) -> Result<Option<Session>>;

    /// Delete a session and, in the same unit of work, all of its webhooks.
    /// Returns false if no such session existed.
    async fn delete_session(&self, id: SessionId) -> Result<bool>;

    /// Fails with `NotFound` when `session_id` references no session.
    async fn insert_webhook(&self, new: NewWebhook) -> Result<Webhook>;

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    async fn list_webhooks(&self, session_id: Option<SessionId>) -> Result<Vec<Webhook>>;

    /// Overwrite a webhook. Returns `Ok(None)` if it does not exist.
    async fn update_webhook(&self, webhook: &Webhook) -> Result<Option<Webhook>>;

    async fn delete_webhook(&self, id: WebhookId) -> Result<bool>;

    /// Backend description for health reporting.
    async fn health(&self) -> Result<String>;

    fn name(&self) -> &str;
}
