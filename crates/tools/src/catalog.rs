//! Builds the tool registry snapshot each pipeline run uses.
//!
//! A snapshot combines the local tools with every remote provider's
//! `tools/list`. It is rebuilt when a provider reconnects (its generation
//! moves) or, if some provider was unreachable, after `retry_interval`.

use crate::remote::RemoteToolProvider;
use parley_core::auth::TokenExchanger;
use parley_core::error::ToolError;
use parley_core::tool::{RemoteInvoker, Tool, ToolRegistry};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct Built {
    registry: Arc<ToolRegistry>,
    generations: Vec<u64>,
    incomplete: bool,
    at: Instant,
}

pub struct ToolCatalog {
    local: Vec<Arc<dyn Tool>>,
    providers: Vec<Arc<RemoteToolProvider>>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    local_timeout: Duration,
    local_audience: String,
    retry_interval: Duration,
    built: Mutex<Option<Built>>,
    rebuild: tokio::sync::Mutex<()>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            local: Vec::new(),
            providers: Vec::new(),
            exchanger: None,
            local_timeout: Duration::from_secs(30),
            local_audience: "local".into(),
            retry_interval: Duration::from_secs(30),
            built: Mutex::new(None),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_local(mut self, tool: Arc<dyn Tool>) -> Self {
        self.local.push(tool);
        self
    }

    pub fn with_provider(mut self, provider: Arc<RemoteToolProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    pub fn with_local_audience(mut self, audience: impl Into<String>) -> Self {
        self.local_audience = audience.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn providers(&self) -> &[Arc<RemoteToolProvider>] {
        &self.providers
    }

    /// The current snapshot, rebuilt first if it is stale.
    pub async fn snapshot(&self) -> Result<Arc<ToolRegistry>, ToolError> {
        if let Some(registry) = self.fresh() {
            return Ok(registry);
        }
        let _rebuild = self.rebuild.lock().await;
        // Another task may have rebuilt while we waited
        if let Some(registry) = self.fresh() {
            return Ok(registry);
        }
        self.build().await
    }

    /// Rebuild unconditionally.
    pub async fn refresh(&self) -> Result<Arc<ToolRegistry>, ToolError> {
        let _rebuild = self.rebuild.lock().await;
        self.build().await
    }

    fn fresh(&self) -> Option<Arc<ToolRegistry>> {
        let built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        let built = built.as_ref()?;
        let moved = self
            .providers
            .iter()
            .zip(&built.generations)
            .any(|(provider, generation)| provider.generation() != *generation);
        let retry_due = built.incomplete && built.at.elapsed() >= self.retry_interval;
        (!moved && !retry_due).then(|| built.registry.clone())
    }

    async fn build(&self) -> Result<Arc<ToolRegistry>, ToolError> {
        let mut builder = ToolRegistry::builder()
            .local_timeout(self.local_timeout)
            .local_audience(self.local_audience.clone());
        for tool in &self.local {
            builder = builder.local(tool.clone());
        }
        if let Some(exchanger) = &self.exchanger {
            builder = builder.token_exchanger(exchanger.clone());
        }

        let mut incomplete = false;
        for provider in &self.providers {
            match provider.descriptors().await {
                Ok(descriptors) => {
                    let invoker: Arc<dyn RemoteInvoker> = provider.clone();
                    for descriptor in descriptors {
                        builder = builder.remote(descriptor, invoker.clone());
                    }
                }
                Err(e) => {
                    warn!(provider = %provider.name(), error = %e, "Tool provider unavailable; its tools are left out");
                    incomplete = true;
                }
            }
        }

        let registry = Arc::new(builder.build()?);
        let generations = self.providers.iter().map(|p| p.generation()).collect();
        info!(tools = registry.len(), incomplete, "Tool registry snapshot built");

        *self.built.lock().unwrap_or_else(|e| e.into_inner()) = Some(Built {
            registry: registry.clone(),
            generations,
            incomplete,
            at: Instant::now(),
        });
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::connector::DuplexConnector;
    use crate::current_time::CurrentTimeTool;
    use crate::server::ToolServer;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            call_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            drain_grace: Duration::from_millis(20),
        }
    }

    /// Refuses the first connection, then serves `server`.
    fn flaky(server: Arc<ToolServer>) -> Arc<DuplexConnector> {
        let refused = AtomicBool::new(false);
        Arc::new(DuplexConnector::new("clock", move |stream| {
            if !refused.swap(true, Ordering::SeqCst) {
                drop(stream);
                return;
            }
            let server = server.clone();
            tokio::spawn(async move {
                let (read, write) = tokio::io::split(stream);
                let _ = server.serve(read, write).await;
            });
        }))
    }

    #[tokio::test]
    async fn unavailable_provider_is_retried_after_interval() {
        let server = Arc::new(ToolServer::new("clock").with_tool(Arc::new(CurrentTimeTool)));
        let provider = Arc::new(RemoteToolProvider::new("clock", flaky(server), settings()));
        let catalog = ToolCatalog::new()
            .with_provider(provider)
            .with_retry_interval(Duration::from_millis(30));

        let first = catalog.snapshot().await.unwrap();
        assert!(first.is_empty());
        // Still within the interval
        assert!(Arc::ptr_eq(&first, &catalog.snapshot().await.unwrap()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = catalog.snapshot().await.unwrap();
        assert_eq!(second.names(), vec!["current_time"]);
    }

    #[tokio::test]
    async fn remote_name_clashing_with_local_fails_the_snapshot() {
        let server = Arc::new(ToolServer::new("clock").with_tool(Arc::new(CurrentTimeTool)));
        let connector = Arc::new(DuplexConnector::new("clock", move |stream| {
            let server = server.clone();
            tokio::spawn(async move {
                let (read, write) = tokio::io::split(stream);
                let _ = server.serve(read, write).await;
            });
        }));
        let catalog = ToolCatalog::new()
            .with_local(Arc::new(CurrentTimeTool))
            .with_provider(Arc::new(RemoteToolProvider::new("clock", connector, settings())));

        let err = catalog.snapshot().await.unwrap_err();
        assert!(matches!(err, ToolError::DuplicateName { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn locals_only_snapshot_is_cached() {
        let catalog = ToolCatalog::new().with_local(Arc::new(CurrentTimeTool));
        let first = catalog.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first, &catalog.snapshot().await.unwrap()));
        assert!(!Arc::ptr_eq(&first, &catalog.refresh().await.unwrap()));
    }
}
