//! Retrieval: similarity search over an offline-populated document set.

use crate::error::RetrievalError;
use crate::provider::{EmbeddingRequest, Provider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,

    /// Embedding vector (stored as blob in DB)
    #[serde(skip)]
    pub embedding: Vec<f32>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Similarity score (set by queries)
    #[serde(default)]
    pub score: f32,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding: Vec::new(),
            metadata: serde_json::Map::new(),
            score: 0.0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Read-only similarity search.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    fn name(&self) -> &str;

    /// The `k` nearest documents, nearest first.
    async fn query(&self, text: &str, k: usize) -> std::result::Result<Vec<Document>, RetrievalError>;
}

/// Turns text into embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, RetrievalError>;
}

/// An [`Embedder`] backed by a model provider's embedding endpoint.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, inputs: Vec<String>) -> std::result::Result<Vec<Vec<f32>>, RetrievalError> {
        let expected = inputs.len();
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs,
            })
            .await
            .map_err(|e| RetrievalError::EmbeddingFailed(e.to_string()))?;
        if response.embeddings.len() != expected {
            return Err(RetrievalError::EmbeddingFailed(format!(
                "expected {expected} embeddings, got {}",
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::message::Message;
    use crate::provider::{EmbeddingResponse, ProviderRequest, ProviderResponse};

    struct ShortEmbedder;

    #[async_trait]
    impl Provider for ShortEmbedder {
        fn name(&self) -> &str { "short" }
        async fn complete(&self, _r: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse { message: Message::assistant(""), usage: None, model: "m".into() })
        }
        async fn embed(&self, _r: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
            Ok(EmbeddingResponse { embeddings: vec![vec![1.0, 0.0]], model: "e".into() })
        }
    }

    #[tokio::test]
    async fn embedder_rejects_count_mismatch() {
        let embedder = ProviderEmbedder::new(Arc::new(ShortEmbedder), "e");
        let err = embedder.embed(vec!["a".into(), "b".into()]).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingFailed(_)));

        let ok = embedder.embed(vec!["a".into()]).await.unwrap();
        assert_eq!(ok, vec![vec![1.0, 0.0]]);
    }

    #[test]
    fn document_metadata_builder() {
        let doc = Document::new("45", "id: 45, name: Prancer, description: a neurotic dog")
            .with_metadata("dogId", serde_json::json!(45));
        assert_eq!(doc.metadata["dogId"], 45);
        assert!(doc.embedding.is_empty());
    }
}
