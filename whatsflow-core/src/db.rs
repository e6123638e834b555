use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id           BIGSERIAL PRIMARY KEY,
        name         VARCHAR(100) NOT NULL UNIQUE,
        description  VARCHAR(255),
        status       VARCHAR(50) NOT NULL DEFAULT 'disconnected',
        qr_code      TEXT,
        session_data TEXT,
        version      BIGINT NOT NULL DEFAULT 1,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhooks (
        id         BIGSERIAL PRIMARY KEY,
        name       VARCHAR(100) NOT NULL,
        url        TEXT NOT NULL,
        session_id BIGINT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        events     TEXT,
        headers    TEXT,
        is_active  BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS webhooks_session_id_idx ON webhooks (session_id)",
];

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Create the `sessions` / `webhooks` tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    tracing::info!("Database schema ready");
    Ok(())
}
