use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::SessionStore;
use crate::error::{Result, WhatsflowError};
use crate::models::webhook::{decode_events, decode_headers, encode_events, encode_headers};
use crate::models::{NewSession, NewWebhook, Session, SessionId, Webhook, WebhookId};

const SESSION_COLUMNS: &str =
    "id, name, description, status, qr_code, session_data, version, created_at, updated_at";

const WEBHOOK_COLUMNS: &str =
    "id, name, url, session_id, events, headers, is_active, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    name: String,
    description: Option<String>,
    status: String,
    qr_code: Option<String>,
    session_data: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = WhatsflowError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            id: row.id,
            name: row.name,
            description: row.description,
            status: row.status.parse()?,
            qr_code: row.qr_code,
            session_data: row.session_data,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: i64,
    name: String,
    url: String,
    session_id: i64,
    events: Option<String>,
    headers: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = WhatsflowError;

    fn try_from(row: WebhookRow) -> Result<Self> {
        Ok(Webhook {
            id: row.id,
            name: row.name,
            url: row.url,
            session_id: row.session_id,
            events: decode_events(row.events.as_deref())?,
            headers: decode_headers(row.headers.as_deref())?,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Translate constraint violations into domain errors; everything else stays
/// a `Database` error.
fn map_constraint(err: sqlx::Error, what: &str) -> WhatsflowError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return WhatsflowError::Conflict(format!("{} already exists", what));
        }
        if db_err.is_foreign_key_violation() {
            return WhatsflowError::NotFound(format!("{} references a missing session", what));
        }
    }
    WhatsflowError::Database(err)
}

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_session(&self, new: NewSession) -> Result<Session> {
        let row: SessionRow = sqlx::query_as(&format!(
            "INSERT INTO sessions (name, description) VALUES ($1, $2) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(&new.name)
        .bind(&new.description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_constraint(e, &format!("session name '{}'", new.name)))?;

        row.try_into()
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions ORDER BY id",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn update_session(&self, session: &Session) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sessions
            SET name = $3, description = $4, status = $5, qr_code = $6, session_data = $7,
                version = version + 1, updated_at = now()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session.id)
        .bind(session.version)
        .bind(&session.name)
        .bind(&session.description)
        .bind(session.status.as_str())
        .bind(&session.qr_code)
        .bind(&session.session_data)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_constraint(e, &format!("session name '{}'", session.name)))?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = $1")
                    .bind(session.id)
                    .fetch_optional(&self.pool)
                    .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(WhatsflowError::NotFound(format!(
                        "session {} not found",
                        session.id
                    ))),
                }
            }
        }
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let hooks = sqlx::query("DELETE FROM webhooks WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if deleted.rows_affected() > 0 {
            tracing::debug!(
                session_id = id,
                webhooks = hooks.rows_affected(),
                "Deleted session and its webhooks"
            );
        }
        Ok(deleted.rows_affected() > 0)
    }

    async fn insert_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        let row: WebhookRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhooks (name, url, session_id, events, headers, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.session_id)
        .bind(encode_events(&new.events)?)
        .bind(encode_headers(&new.headers)?)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_constraint(e, &format!("webhook '{}'", new.name)))?;

        row.try_into()
    }

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhooks WHERE id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Webhook::try_from).transpose()
    }

    async fn list_webhooks(&self, session_id: Option<SessionId>) -> Result<Vec<Webhook>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhooks WHERE $1::BIGINT IS NULL OR session_id = $1 ORDER BY id",
            WEBHOOK_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<Option<Webhook>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            r#"
            UPDATE webhooks
            SET name = $2, url = $3, session_id = $4, events = $5, headers = $6,
                is_active = $7, updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(webhook.id)
        .bind(&webhook.name)
        .bind(&webhook.url)
        .bind(webhook.session_id)
        .bind(encode_events(&webhook.events)?)
        .bind(encode_headers(&webhook.headers)?)
        .bind(webhook.is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_constraint(e, &format!("webhook {}", webhook.id)))?;

        row.map(Webhook::try_from).transpose()
    }

    async fn delete_webhook(&self, id: WebhookId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health(&self) -> Result<String> {
        Ok(crate::db::health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
