//! Builds the shared subsystems once for `serve`, `ask` and `tools`.

use parley_agent::{ChatPipeline, ToolSource};
use parley_config::{AppConfig, MemoryBackendKind};
use parley_core::event::EventBus;
use parley_core::memory::{ChatMemory, ChatMemoryRepository};
use parley_core::provider::Provider;
use parley_core::retrieval::{ProviderEmbedder, RetrievalIndex};
use parley_memory::{InMemoryRepository, MessageWindowMemory, SqliteRepository, SqliteVectorIndex};
use parley_security::{AuditLogger, AuthPropagator};
use std::sync::Arc;
use tracing::info;

pub struct Services {
    pub pipeline: Arc<ChatPipeline>,
    pub tools: ToolSource,
    pub propagator: AuthPropagator,
    pub audit: Arc<AuditLogger>,
    pub event_bus: Arc<EventBus>,
}

impl Services {
    pub async fn build(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let provider = parley_providers::build_from_config(config)?;
        let event_bus = Arc::new(EventBus::default());
        let audit = Arc::new(AuditLogger::tracing());

        let keys = parley_security::keys_from_config(&config.auth)?;
        let propagator = AuthPropagator::new(keys.clone(), config.auth.audience.clone());
        let exchanger = parley_security::exchanger_from_config(&config.auth, keys, audit.clone())?;

        let catalog = parley_tools::catalog_from_config(&config.tools, Some(exchanger), Some(event_bus.clone()))?;
        let tools = ToolSource::Catalog(Arc::new(catalog));

        let memory = open_memory(config).await?;

        let mut builder = ChatPipeline::builder(provider.clone(), config.default_model.clone())
            .config(&config.pipeline)
            .temperature(config.default_temperature)
            .max_tokens(config.default_max_tokens)
            .memory(memory)
            .tools(tools.clone())
            .event_bus(event_bus.clone())
            .audit(audit.clone());

        if config.retrieval.enabled {
            let index = open_index(config, provider).await?;
            builder = builder.retrieval(Arc::new(index), config.retrieval.top_k, config.retrieval.min_score);
        }

        let pipeline = builder.build();
        info!(
            model = %config.default_model,
            advisors = ?pipeline.advisor_names(),
            "Pipeline ready"
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            tools,
            propagator,
            audit,
            event_bus,
        })
    }
}

async fn open_memory(config: &AppConfig) -> Result<Arc<dyn ChatMemory>, Box<dyn std::error::Error>> {
    let window = config.memory.window_size;
    Ok(match config.memory.backend {
        MemoryBackendKind::Sqlite => {
            std::fs::create_dir_all(AppConfig::config_dir())?;
            let repo = SqliteRepository::new(&config.memory.resolved_database_url()).await?;
            window_over(Arc::new(repo), window)
        }
        #[cfg(feature = "postgres")]
        MemoryBackendKind::Postgres => {
            let repo = parley_memory::PostgresRepository::connect(&config.memory.resolved_database_url()).await?;
            window_over(Arc::new(repo), window)
        }
        #[cfg(not(feature = "postgres"))]
        MemoryBackendKind::Postgres => {
            return Err("memory.backend = \"postgres\" needs a build with the `postgres` feature".into());
        }
        MemoryBackendKind::InMemory => window_over(Arc::new(InMemoryRepository::new()), window),
    })
}

fn window_over<R: ChatMemoryRepository + 'static>(repo: Arc<R>, window: usize) -> Arc<dyn ChatMemory> {
    info!(backend = repo.name(), window, "Chat memory opened");
    Arc::new(MessageWindowMemory::new(repo, window))
}

/// The document index the retrieval advisor and `ingest` share.
pub async fn open_index(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
) -> Result<SqliteVectorIndex, Box<dyn std::error::Error>> {
    if config.retrieval.database_path.is_none() {
        std::fs::create_dir_all(AppConfig::config_dir())?;
    }
    let embedder = Arc::new(ProviderEmbedder::new(provider, config.embedding_model.clone()));
    let index = SqliteVectorIndex::open(&config.retrieval.resolved_database_url(), embedder).await?;
    info!(index = index.name(), "Retrieval index opened");
    Ok(index)
}
