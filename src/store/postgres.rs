//! Postgres op store.
//!
//! Schema: `room_ops(room_id, seq, site_id, bytes, ts)` with primary key
//! `(room_id, seq)`. Sequence assignment races between pods are resolved by
//! the unique constraint: the insert computes `max(seq)+1` and retries on a
//! duplicate-key conflict.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{OpRecord, OpStore, StoreError};

const UNIQUE_VIOLATION: &str = "23505";

/// How many sequence-assignment races to tolerate per append.
const APPEND_RETRIES: usize = 16;

/// Op store backed by a Postgres table.
pub struct PgOpStore {
    pool: PgPool,
}

impl PgOpStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Store over an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS room_ops (
                room_id TEXT        NOT NULL,
                seq     BIGINT      NOT NULL,
                site_id TEXT        NOT NULL,
                bytes   BYTEA       NOT NULL,
                ts      TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (room_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
        )
    }
}

#[async_trait]
impl OpStore for PgOpStore {
    async fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
    ) -> Result<i64, StoreError> {
        for _ in 0..APPEND_RETRIES {
            let result = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO room_ops (room_id, seq, site_id, bytes)
                SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3
                FROM room_ops WHERE room_id = $1
                RETURNING seq
                "#,
            )
            .bind(room_id)
            .bind(site_id)
            .bind(bytes)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(seq) => return Ok(seq),
                Err(e) if Self::is_unique_violation(&e) => continue,
                Err(e) => return Err(StoreError::Unavailable(e.to_string())),
            }
        }
        Err(StoreError::Unavailable(format!(
            "sequence contention on room {room_id} exceeded {APPEND_RETRIES} retries"
        )))
    }

    async fn range_scan(
        &self,
        room_id: &str,
        from_seq: i64,
    ) -> Result<Vec<OpRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT room_id, seq, site_id, bytes, ts
            FROM room_ops
            WHERE room_id = $1 AND seq > $2
            ORDER BY seq
            "#,
        )
        .bind(room_id)
        .bind(from_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| OpRecord {
                room_id: row.get("room_id"),
                seq: row.get("seq"),
                site_id: row.get("site_id"),
                bytes: row.get("bytes"),
                ts: row.get("ts"),
            })
            .collect())
    }

    async fn truncate_before(&self, room_id: &str, seq: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM room_ops WHERE room_id = $1 AND seq < $2")
            .bind(room_id)
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
