//! SQLite chat memory repository.
//!
//! One row per message in `chat_messages`, keyed by
//! `(conversation_id, seq)`. A conversation is rewritten in a single
//! transaction so readers never see a half-applied turn.

use crate::codec::{self, MessageRow};
use async_trait::async_trait;
use parley_core::error::MemoryError;
use parley_core::memory::ChatMemoryRepository;
use parley_core::message::{ConversationId, Message};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Open a SQLite pool with the settings both SQLite stores use.
///
/// `":memory:"` databases get a single connection, since every
/// connection would otherwise see its own empty database.
pub(crate) async fn open_pool(url: &str) -> Result<SqlitePool, MemoryError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| MemoryError::Unavailable(format!("Invalid SQLite path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| MemoryError::Unavailable(format!("Failed to open SQLite: {e}")))
}

/// A SQLite-backed [`ChatMemoryRepository`].
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (or create) the database at `url` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(url: &str) -> Result<Self, MemoryError> {
        let pool = open_pool(url).await?;
        let repo = Self::from_pool(pool).await?;
        info!("SQLite chat memory initialized at {url}");
        Ok(repo)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let repo = Self { pool };
        repo.run_migrations().await?;
        Ok(repo)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                conversation_id TEXT    NOT NULL,
                seq             INTEGER NOT NULL,
                id              TEXT    NOT NULL,
                role            TEXT    NOT NULL,
                content         TEXT    NOT NULL,
                tool_calls      TEXT    NOT NULL DEFAULT '[]',
                tool_call_id    TEXT,
                timestamp       TEXT    NOT NULL,
                PRIMARY KEY (conversation_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("chat_messages table: {e}")))?;

        debug!("SQLite chat memory migrations complete");
        Ok(())
    }
}

#[async_trait]
impl ChatMemoryRepository for SqliteRepository {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, tool_calls, tool_call_id, timestamp
            FROM chat_messages
            WHERE conversation_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Unavailable(format!("load {conversation_id}: {e}")))?;

        rows.iter()
            .map(|row| {
                let get = |col: &str| -> Result<String, MemoryError> {
                    row.try_get::<String, _>(col)
                        .map_err(|e| MemoryError::Unavailable(format!("{col} column: {e}")))
                };
                let tool_call_id: Option<String> = row
                    .try_get("tool_call_id")
                    .map_err(|e| MemoryError::Unavailable(format!("tool_call_id column: {e}")))?;
                codec::decode(
                    conversation_id,
                    get("id")?,
                    &get("role")?,
                    get("content")?,
                    &get("tool_calls")?,
                    tool_call_id,
                    &get("timestamp")?,
                )
            })
            .collect()
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

        sqlx::query("DELETE FROM chat_messages WHERE conversation_id = ?1")
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        for (seq, row) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chat_messages
                    (conversation_id, seq, id, role, content, tool_calls, tool_call_id, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
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
        debug!(conversation = %conversation_id, count = rows.len(), "Conversation stored");
        Ok(())
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM chat_messages WHERE conversation_id = ?1")
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

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::message::MessageToolCall;

    async fn test_repo() -> SqliteRepository {
        SqliteRepository::new("sqlite::memory:").await.unwrap()
    }

    fn conv(name: &str) -> ConversationId {
        ConversationId::from(name)
    }

    #[tokio::test]
    async fn replace_then_load_preserves_order_and_fields() {
        let repo = test_repo().await;
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(MessageToolCall {
            id: "call_1".into(),
            name: "schedule_adoption".into(),
            arguments: "{\"dogId\":45,\"dogName\":\"Prancer\"}".into(),
        });
        let messages = vec![
            Message::system("You are an assistant"),
            Message::user("Can I pick up Prancer?"),
            assistant,
            Message::tool_result("call_1", "{\"appointment\":\"soon\"}"),
        ];
        repo.replace(&conv("george"), &messages).await.unwrap();

        let loaded = repo.load(&conv("george")).await.unwrap();
        assert_eq!(loaded, messages);
    }

    #[tokio::test]
    async fn replace_overwrites_previous_rows() {
        let repo = test_repo().await;
        repo.replace(&conv("george"), &[Message::user("a"), Message::user("b")])
            .await
            .unwrap();
        repo.replace(&conv("george"), &[Message::user("c")]).await.unwrap();

        let loaded = repo.load(&conv("george")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "c");
    }

    #[tokio::test]
    async fn conversations_are_partitioned() {
        let repo = test_repo().await;
        repo.replace(&conv("george"), &[Message::user("from george")]).await.unwrap();
        repo.replace(&conv("josh"), &[Message::user("from josh")]).await.unwrap();

        assert_eq!(repo.load(&conv("george")).await.unwrap()[0].content, "from george");
        assert_eq!(
            repo.conversation_ids().await.unwrap(),
            vec![conv("george"), conv("josh")]
        );

        repo.delete(&conv("george")).await.unwrap();
        assert!(repo.load(&conv("george")).await.unwrap().is_empty());
        assert_eq!(repo.load(&conv("josh")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("memory.db").display());
        let message = Message::user("Do you have any neurotic dogs?");
        {
            let repo = SqliteRepository::new(&url).await.unwrap();
            repo.replace(&conv("george"), std::slice::from_ref(&message)).await.unwrap();
        }
        let repo = SqliteRepository::new(&url).await.unwrap();
        assert_eq!(repo.load(&conv("george")).await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn corrupt_role_is_reported() {
        let repo = test_repo().await;
        sqlx::query(
            "INSERT INTO chat_messages (conversation_id, seq, id, role, content, tool_calls, timestamp) \
             VALUES ('george', 0, 'm1', 'narrator', 'x', '[]', '2026-01-01T00:00:00Z')",
        )
        .execute(&repo.pool)
        .await
        .unwrap();
        let err = repo.load(&conv("george")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Corrupt { .. }));
    }
}
