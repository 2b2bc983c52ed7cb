//! Retrieval indexes backed by cosine similarity.
//!
//! Documents are embedded once at ingestion time. Queries embed the
//! question and rank every stored document; the corpus this serves (an
//! adoption catalog) is small enough that a linear scan is fine.

use crate::vector;
use async_trait::async_trait;
use parley_core::error::RetrievalError;
use parley_core::retrieval::{Document, Embedder, RetrievalIndex};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Embed the documents that do not carry an embedding yet.
async fn embed_missing(embedder: &dyn Embedder, documents: &mut [Document]) -> Result<(), RetrievalError> {
    let missing: Vec<usize> = documents
        .iter()
        .enumerate()
        .filter(|(_, d)| d.embedding.is_empty())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let inputs = missing.iter().map(|&i| documents[i].text.clone()).collect();
    let embeddings = embedder.embed(inputs).await?;
    for (i, embedding) in missing.into_iter().zip(embeddings) {
        documents[i].embedding = embedding;
    }
    Ok(())
}

async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, RetrievalError> {
    embedder
        .embed(vec![text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::EmbeddingFailed("no embedding returned for query".into()))
}

/// An index kept in process memory.
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    documents: RwLock<Vec<Document>>,
    min_score: Option<f32>,
}

impl InMemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
            min_score: None,
        }
    }

    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    /// Add documents, embedding those without a vector. Returns their ids.
    pub async fn add(&self, mut documents: Vec<Document>) -> Result<Vec<String>, RetrievalError> {
        embed_missing(self.embedder.as_ref(), &mut documents).await?;
        let mut stored = self.documents.write().await;
        let mut ids = Vec::with_capacity(documents.len());
        for mut doc in documents {
            if doc.id.is_empty() {
                doc.id = Uuid::new_v4().to_string();
            }
            ids.push(doc.id.clone());
            stored.retain(|d| d.id != doc.id);
            stored.push(doc);
        }
        Ok(ids)
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl RetrievalIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>, RetrievalError> {
        let query = embed_query(self.embedder.as_ref(), text).await?;
        let documents = self.documents.read().await.clone();
        Ok(vector::rank_documents(documents, &query, k, self.min_score))
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_index::SqliteVectorIndex;

#[cfg(feature = "sqlite")]
mod sqlite_index {
    use super::*;
    use sqlx::{Row, SqlitePool};

    /// A document index persisted in SQLite with embedding blobs.
    pub struct SqliteVectorIndex {
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        min_score: Option<f32>,
    }

    impl SqliteVectorIndex {
        pub async fn open(url: &str, embedder: Arc<dyn Embedder>) -> Result<Self, RetrievalError> {
            let pool = crate::sqlite::open_pool(url)
                .await
                .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id        TEXT PRIMARY KEY,
                    text      TEXT NOT NULL,
                    metadata  TEXT NOT NULL DEFAULT '{}',
                    embedding BLOB NOT NULL
                )
                "#,
            )
            .execute(&pool)
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("documents table: {e}")))?;

            info!("SQLite document index opened at {url}");
            Ok(Self {
                pool,
                embedder,
                min_score: None,
            })
        }

        pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
            self.min_score = min_score;
            self
        }

        /// Upsert documents, embedding those without a vector. Returns their ids.
        pub async fn add(&self, mut documents: Vec<Document>) -> Result<Vec<String>, RetrievalError> {
            embed_missing(self.embedder.as_ref(), &mut documents).await?;

            let unavailable = |e: sqlx::Error| RetrievalError::Unavailable(format!("add documents: {e}"));
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let mut ids = Vec::with_capacity(documents.len());
            for doc in &documents {
                let id = if doc.id.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    doc.id.clone()
                };
                let metadata = serde_json::Value::Object(doc.metadata.clone()).to_string();
                sqlx::query(
                    r#"
                    INSERT INTO documents (id, text, metadata, embedding)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(id) DO UPDATE SET
                        text = excluded.text,
                        metadata = excluded.metadata,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&id)
                .bind(&doc.text)
                .bind(metadata)
                .bind(vector::embedding_to_blob(&doc.embedding))
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
                ids.push(id);
            }
            tx.commit().await.map_err(unavailable)?;
            debug!(count = ids.len(), "Documents indexed");
            Ok(ids)
        }

        pub async fn count(&self) -> Result<usize, RetrievalError> {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RetrievalError::Unavailable(format!("count: {e}")))?;
            Ok(n as usize)
        }

        async fn all_documents(&self) -> Result<Vec<Document>, RetrievalError> {
            let rows = sqlx::query("SELECT id, text, metadata, embedding FROM documents")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RetrievalError::Unavailable(format!("scan documents: {e}")))?;

            rows.iter()
                .map(|row| {
                    let column = |e: sqlx::Error| RetrievalError::Unavailable(format!("row decode: {e}"));
                    let metadata: String = row.try_get("metadata").map_err(column)?;
                    let blob: Vec<u8> = row.try_get("embedding").map_err(column)?;
                    let metadata = match serde_json::from_str(&metadata) {
                        Ok(serde_json::Value::Object(map)) => map,
                        _ => serde_json::Map::new(),
                    };
                    Ok(Document {
                        id: row.try_get("id").map_err(column)?,
                        text: row.try_get("text").map_err(column)?,
                        embedding: vector::blob_to_embedding(&blob),
                        metadata,
                        score: 0.0,
                    })
                })
                .collect()
        }
    }

    #[async_trait]
    impl RetrievalIndex for SqliteVectorIndex {
        fn name(&self) -> &str {
            "sqlite"
        }

        async fn query(&self, text: &str, k: usize) -> Result<Vec<Document>, RetrievalError> {
            let query = embed_query(self.embedder.as_ref(), text).await?;
            let documents = self.all_documents().await?;
            Ok(vector::rank_documents(documents, &query, k, self.min_score))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Embeds by counting a few keywords, so similarity is predictable.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(inputs
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    ["dog", "cat", "neurotic"]
                        .iter()
                        .map(|k| t.matches(k).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _inputs: Vec<String>) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Err(RetrievalError::EmbeddingFailed("provider down".into()))
        }
    }

    fn catalog() -> Vec<Document> {
        vec![
            Document::new("1", "id: 1, name: Rex, description: a friendly dog"),
            Document::new("2", "id: 2, name: Whiskers, description: a cat"),
            Document::new("45", "id: 45, name: Prancer, description: a neurotic dog, neurotic indeed"),
        ]
    }

    #[tokio::test]
    async fn in_memory_query_is_nearest_first() {
        let index = InMemoryIndex::new(Arc::new(KeywordEmbedder));
        index.add(catalog()).await.unwrap();
        assert_eq!(index.len().await, 3);

        let results = index.query("any neurotic dogs?", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "45");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn in_memory_readd_replaces() {
        let index = InMemoryIndex::new(Arc::new(KeywordEmbedder));
        index.add(catalog()).await.unwrap();
        index.add(vec![Document::new("1", "Rex was adopted")]).await.unwrap();
        assert_eq!(index.len().await, 3);
    }

    #[tokio::test]
    async fn embedder_failure_is_a_retrieval_error() {
        let index = InMemoryIndex::new(Arc::new(BrokenEmbedder));
        assert!(index.query("dogs", 4).await.is_err());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_index_roundtrip() {
        let index = SqliteVectorIndex::open("sqlite::memory:", Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        let doc = Document::new("45", "Prancer is a neurotic dog")
            .with_metadata("dogId", serde_json::json!(45));
        let mut docs = catalog();
        docs[2] = doc;
        let ids = index.add(docs).await.unwrap();
        assert_eq!(ids, vec!["1", "2", "45"]);
        assert_eq!(index.count().await.unwrap(), 3);

        let results = index.query("neurotic", 1).await.unwrap();
        assert_eq!(results[0].id, "45");
        assert_eq!(results[0].metadata["dogId"], 45);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_ties_are_deterministic() {
        let index = SqliteVectorIndex::open("sqlite::memory:", Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        index
            .add(vec![Document::new("b", "dog"), Document::new("a", "dog"), Document::new("c", "dog")])
            .await
            .unwrap();
        for _ in 0..3 {
            let ids: Vec<_> = index
                .query("dog", 3)
                .await
                .unwrap()
                .into_iter()
                .map(|d| d.id)
                .collect();
            assert_eq!(ids, vec!["a", "b", "c"]);
        }
    }
}
