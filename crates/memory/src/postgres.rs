//! PostgreSQL chat memory repository.
//!
//! Same layout as the SQLite store: `chat_messages` keyed by
//! `(conversation_id, seq)`, rewritten per conversation in one transaction.
//!
//! # Feature gate
//!
//! ```toml
//! parley-memory = { workspace = true, features = ["postgres"] }
//! ```

use crate::codec::{self, MessageRow};
use async_trait::async_trait;
use parley_core::error::MemoryError;
use parley_core::memory::ChatMemoryRepository;
use parley_core::message::{ConversationId, Message};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// A PostgreSQL-backed [`ChatMemoryRepository`].
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, MemoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("PostgreSQL connection failed: {e}")))?;

        info!("Connected to PostgreSQL for chat memory");
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// Create from an existing connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                conversation_id TEXT   NOT NULL,
                seq             BIGINT NOT NULL,
                id              TEXT   NOT NULL,
                role            TEXT   NOT NULL,
                content         TEXT   NOT NULL,
                tool_calls      TEXT   NOT NULL DEFAULT '[]',
                tool_call_id    TEXT,
                timestamp       TEXT   NOT NULL,
                PRIMARY KEY (conversation_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("chat_messages table: {e}")))?;

        debug!("PostgreSQL chat memory migrations complete");
        Ok(())
    }
}

#[async_trait]
impl ChatMemoryRepository for PostgresRepository {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, tool_calls, tool_call_id, timestamp
            FROM chat_messages
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Unavailable(format!("load {conversation_id}: {e}")))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let column = |e: sqlx::Error| MemoryError::Unavailable(format!("row decode: {e}"));
            let id: String = row.try_get("id").map_err(column)?;
            let role: String = row.try_get("role").map_err(column)?;
            let content: String = row.try_get("content").map_err(column)?;
            let tool_calls: String = row.try_get("tool_calls").map_err(column)?;
            let tool_call_id: Option<String> = row.try_get("tool_call_id").map_err(column)?;
            let timestamp: String = row.try_get("timestamp").map_err(column)?;
            messages.push(codec::decode(
                conversation_id,
                id,
                &role,
                content,
                &tool_calls,
                tool_call_id,
                &timestamp,
            )?);
        }
        Ok(messages)
    }

    async fn replace(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<(), MemoryError> {
        let rows = messages
            .iter()
            .map(MessageRow::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let unavailable = |e: sqlx::Error| MemoryError::Unavailable(format!("replace {conversation_id}: {e}"));
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query("DELETE FROM chat_messages WHERE conversation_id = $1")
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        for (seq, row) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chat_messages
                    (conversation_id, seq, id, role, content, tool_calls, tool_call_id, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(conversation_id.as_str())
            .bind(seq as i64)
            .bind(&row.id)
            .bind(row.role)
            .bind(&row.content)
            .bind(&row.tool_calls)
            .bind(&row.tool_call_id)
            .bind(&row.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM chat_messages WHERE conversation_id = $1")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("delete {conversation_id}: {e}")))?;
        Ok(())
    }

    async fn conversation_ids(&self) -> Result<Vec<ConversationId>, MemoryError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT conversation_id FROM chat_messages ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Unavailable(format!("conversation ids: {e}")))?;
        Ok(ids.into_iter().map(ConversationId).collect())
    }
}
