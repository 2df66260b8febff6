//! PostgreSQL token store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{
    NewToken, OriginFilter, Selection, Source, StoreError, StoreResult, StoreTransaction, Token,
    TokenId, TokenStore,
};
use crate::config::StoreConfig;

const COLUMNS: &str = "id, content, source, origin_tag, view_count, created_at";

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS commands (
    id          UUID PRIMARY KEY,
    content     VARCHAR(500) NOT NULL UNIQUE,
    source      VARCHAR(16) NOT NULL,
    origin_tag  TEXT,
    view_count  INTEGER NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL
)
"#;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.is_unique_violation() {
                return StoreError::Duplicate;
            }
            if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
                return StoreError::LockTimeout;
            }
        }
        StoreError::Backend(err.to_string())
    }
}

fn token_from_row(row: &PgRow) -> StoreResult<Token> {
    let id: Uuid = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let view_count: i32 = row.try_get("view_count")?;

    Ok(Token {
        id: TokenId::from(id),
        content: row.try_get("content")?,
        source: source.parse()?,
        origin_tag: row.try_get("origin_tag")?,
        view_count: view_count.max(0) as u32,
        created_at: row.try_get("created_at")?,
    })
}

/// A [`TokenStore`] backed by a `commands` table in PostgreSQL.
///
/// Distribution locks rows with `SELECT ... FOR UPDATE`; each transaction sets
/// its own `lock_timeout` so a blocked lock surfaces as
/// [`StoreError::LockTimeout`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    /// Connect using the store configuration.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Backend("store.database_url is not set".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool, config.lock_timeout()))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Create the `commands` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn insert(&self, new: NewToken) -> StoreResult<Token> {
        let sql = format!(
            "INSERT INTO commands (id, content, source, origin_tag, view_count, created_at) \
             VALUES ($1, $2, $3, $4, 0, $5) RETURNING {}",
            COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(TokenId::new().as_uuid())
            .bind(new.content)
            .bind(new.source.as_str())
            .bind(new.origin_tag)
            .bind(new.created_at)
            .fetch_one(&self.pool)
            .await?;

        token_from_row(&row)
    }

    async fn delete_by_content(&self, content: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM commands WHERE content = $1")
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_available(&self, max_views: u32) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS available FROM commands WHERE view_count < $1")
            .bind(max_views as i32)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("available")?;
        Ok(count.max(0) as u64)
    }

    async fn delete_created_before(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM commands WHERE source = $1 AND created_at < $2")
            .bind(source.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM commands")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A transaction against a [`PgStore`]; rolled back when dropped uncommitted.
pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn active(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_random(&mut self, selection: &Selection) -> StoreResult<Option<Token>> {
        let (origin_clause, origin) = match &selection.origin {
            OriginFilter::Any => ("TRUE", None),
            OriginFilter::Excluding(origin) => (
                "(origin_tag IS NULL OR origin_tag = '' OR origin_tag <> $3)",
                Some(origin.clone()),
            ),
            OriginFilter::Only(origin) => ("origin_tag = $3", Some(origin.clone())),
        };

        let sql = format!(
            "SELECT {} FROM commands \
             WHERE view_count < $1 AND source = $2 AND {} \
             ORDER BY random() LIMIT 1 FOR UPDATE",
            COLUMNS, origin_clause
        );

        let mut query = sqlx::query(&sql)
            .bind(selection.max_views as i32)
            .bind(selection.source.as_str());
        if let Some(origin) = origin {
            query = query.bind(origin);
        }

        let tx = self.active()?;
        let row = query.fetch_optional(&mut **tx).await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn record_view(&mut self, id: TokenId) -> StoreResult<Token> {
        let sql = format!(
            "UPDATE commands SET view_count = view_count + 1 WHERE id = $1 RETURNING {}",
            COLUMNS
        );

        let tx = self.active()?;
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => token_from_row(&row),
            None => Err(StoreError::Vanished(id)),
        }
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))?;
        tx.commit().await?;
        Ok(())
    }
}
