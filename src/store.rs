//! Store adapter: spec §6.5. The gateway's only persistent dependency —
//! saved credentials and a session activity log, both in Postgres. Grounded
//! in the teacher's `db/postgres.rs` `Database` struct: a `Mutex<PgPool>`
//! behind `ensure_pool`/`reconnect_pool` so a dropped connection heals on
//! the next call instead of wedging the gateway, and bare `sqlx::query_as`
//! calls rather than a query builder.

use chrono::{DateTime, Utc};
use log::warn;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub owner: String,
    pub kind: String,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct PostgresStore {
    pool: Mutex<PgPool>,
    database_url: String,
    max_connections: u32,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = Self::connect_pool(database_url, max_connections).await?;
        Ok(Self { pool: Mutex::new(pool), database_url: database_url.to_string(), max_connections })
    }

    async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
        let opts = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);
        let pool = PgPoolOptions::new().max_connections(max_connections).connect_with(opts).await?;
        Ok(pool)
    }

    async fn ensure_pool(&self) -> anyhow::Result<PgPool> {
        let pool = { self.pool.lock().await.clone() };

        if pool.is_closed() {
            warn!("postgres pool is closed, reconnecting");
            return self.reconnect_pool().await;
        }

        if let Err(err) = pool.acquire().await {
            warn!("postgres pool acquire failed, reconnecting: {err}");
            return self.reconnect_pool().await;
        }

        Ok(pool)
    }

    async fn reconnect_pool(&self) -> anyhow::Result<PgPool> {
        let new_pool = Self::connect_pool(&self.database_url, self.max_connections).await?;
        let mut guard = self.pool.lock().await;
        *guard = new_pool.clone();
        Ok(new_pool)
    }

    pub async fn get_credential(&self, id: Uuid) -> anyhow::Result<CredentialRecord> {
        let pool = self.ensure_pool().await?;
        let record = sqlx::query_as::<_, CredentialRecord>(
            r#"
            SELECT id, owner, kind, ciphertext, created_at, updated_at
            FROM credentials
            WHERE id = $1
            "#,
        )
        .persistent(false)
        .bind(id)
        .fetch_one(&pool)
        .await?;

        Ok(record)
    }

    pub async fn put_credential(&self, owner: &str, kind: &str, ciphertext: &[u8]) -> anyhow::Result<CredentialRecord> {
        let pool = self.ensure_pool().await?;
        let record = sqlx::query_as::<_, CredentialRecord>(
            r#"
            INSERT INTO credentials (id, owner, kind, ciphertext, created_at, updated_at)
            VALUES (gen_random_uuid(), $1, $2, $3, now(), now())
            ON CONFLICT (id) DO UPDATE SET ciphertext = EXCLUDED.ciphertext, updated_at = now()
            RETURNING id, owner, kind, ciphertext, created_at, updated_at
            "#,
        )
        .persistent(false)
        .bind(owner)
        .bind(kind)
        .bind(ciphertext)
        .fetch_one(&pool)
        .await?;

        Ok(record)
    }

    pub async fn list_credentials_by_owner(&self, owner: &str) -> anyhow::Result<Vec<CredentialRecord>> {
        let pool = self.ensure_pool().await?;
        let records = sqlx::query_as::<_, CredentialRecord>(
            r#"
            SELECT id, owner, kind, ciphertext, created_at, updated_at
            FROM credentials
            WHERE owner = $1
            ORDER BY created_at DESC
            "#,
        )
        .persistent(false)
        .bind(owner)
        .fetch_all(&pool)
        .await?;

        Ok(records)
    }

    /// `LogSession`: one row per session lifetime (spec §6.5), written once
    /// at teardown rather than streamed, since the gateway's own process
    /// log already carries the moment-to-moment detail.
    pub async fn log_session(
        &self,
        session_id: &str,
        target_host: &str,
        target_user: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        close_reason: &str,
    ) -> anyhow::Result<()> {
        let pool = self.ensure_pool().await?;
        sqlx::query(
            r#"
            INSERT INTO session_log (session_id, target_host, target_user, started_at, ended_at, close_reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .persistent(false)
        .bind(session_id)
        .bind(target_host)
        .bind(target_user)
        .bind(started_at)
        .bind(ended_at)
        .bind(close_reason)
        .execute(&pool)
        .await?;

        Ok(())
    }
}
