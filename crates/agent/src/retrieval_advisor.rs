//! Retrieval augmentation: ground the answer in indexed documents.

use crate::advisor::{Advisor, Next, PipelineRequest, PipelineResponse};
use crate::error::PipelineError;
use async_trait::async_trait;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::retrieval::RetrievalIndex;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_TOP_K: usize = 4;

/// Queries the index with the user's question and places the matching
/// documents into the prompt's context section.
///
/// An unavailable index is not fatal: the turn goes on with no context.
pub struct RetrievalAdvisor {
    index: Arc<dyn RetrievalIndex>,
    top_k: usize,
    min_score: Option<f32>,
    event_bus: Option<Arc<EventBus>>,
}

impl RetrievalAdvisor {
    pub fn new(index: Arc<dyn RetrievalIndex>) -> Self {
        Self {
            index,
            top_k: DEFAULT_TOP_K,
            min_score: None,
            event_bus: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }
}

#[async_trait]
impl Advisor for RetrievalAdvisor {
    fn name(&self) -> &str {
        "retrieval"
    }

    async fn around(
        &self,
        mut request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let mut document_ids = Vec::new();

        match self.index.query(&request.user, self.top_k).await {
            Ok(documents) => {
                for doc in documents
                    .into_iter()
                    .filter(|d| self.min_score.is_none_or(|min| d.score >= min))
                {
                    document_ids.push(doc.id);
                    request.context.push(doc.text);
                }
                debug!(index = self.index.name(), documents = document_ids.len(), "Context retrieved");
            }
            Err(e) => {
                warn!(index = self.index.name(), error = %e, "Retrieval failed, answering without context");
                if let Some(bus) = &self.event_bus {
                    bus.publish(DomainEvent::RetrievalDegraded {
                        conversation_id: request.turn.conversation_id.to_string(),
                        error_message: e.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }

        let mut response = next.run(request).await?;
        response.document_ids = document_ids;
        Ok(response)
    }
}
