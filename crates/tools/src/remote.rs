//! A configured remote tool provider and its current connection.

use crate::connection::{CONNECTION_CLOSED, ConnectionSettings, ConnectionState, RemoteConnection};
use crate::connector::{self, Connector};
use async_trait::async_trait;
use parley_config::ToolProviderConfig;
use parley_core::auth::AccessToken;
use parley_core::error::ToolError;
use parley_core::event::EventBus;
use parley_core::tool::{AuthRequirement, RemoteInvoker, ToolCallResult, ToolDescriptor, ToolTarget};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

pub struct RemoteToolProvider {
    name: String,
    audience: String,
    requires_auth: bool,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    current: Mutex<Option<Arc<RemoteConnection>>>,
    generation: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl RemoteToolProvider {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        let name = name.into();
        Self {
            audience: name.clone(),
            name,
            requires_auth: false,
            connector,
            settings,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn from_config(config: &ToolProviderConfig) -> Result<Self, ToolError> {
        let settings = ConnectionSettings::from(config);
        let connector =
            connector::from_config(&config.name, &config.transport, &settings).map_err(|e| ToolError::Transport {
                provider: config.name.clone(),
                reason: e.to_string(),
            })?;
        let audience = config.audience.clone().unwrap_or_else(|| config.name.clone());
        Ok(Self::new(config.name.clone(), connector, settings).with_auth(audience, config.requires_auth))
    }

    /// Tokens for this provider are minted for `audience`. With
    /// `requires_auth`, every tool it serves needs a caller.
    pub fn with_auth(mut self, audience: impl Into<String>, requires_auth: bool) -> Self {
        self.audience = audience.into();
        self.requires_auth = requires_auth;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Bumped every time a new connection completes its handshake.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ConnectionState {
        match self.current.lock().await.as_ref() {
            Some(connection) => connection.state(),
            None => ConnectionState::Uninitialized,
        }
    }

    /// The most recent connection, open or not.
    pub async fn current_connection(&self) -> Option<Arc<RemoteConnection>> {
        self.current.lock().await.clone()
    }

    /// The live connection, opening a new one if there is none or the
    /// last one closed.
    pub async fn connection(&self) -> Result<Arc<RemoteConnection>, ToolError> {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.as_ref() {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            info!(provider = %self.name, generation = connection.generation(), "Connection closed, reconnecting");
        }

        let channel = self.connector.connect().await.map_err(|e| ToolError::Transport {
            provider: self.name.clone(),
            reason: e.to_string(),
        })?;
        let generation = self.generation() + 1;
        let connection =
            RemoteConnection::establish(self.name.clone(), generation, channel, self.settings, self.events.clone())
                .await?;
        self.generation.store(generation, Ordering::SeqCst);
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Descriptors for every tool the provider lists.
    pub async fn descriptors(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let connection = self.connection().await?;
        Ok(connection
            .tools()
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                target: ToolTarget::Remote {
                    provider: self.name.clone(),
                },
                auth: if self.requires_auth || tool.requires_auth() {
                    AuthRequirement::Required {
                        audience: self.audience.clone(),
                    }
                } else {
                    AuthRequirement::None
                },
            })
            .collect())
    }

    pub async fn shutdown(&self) {
        if let Some(connection) = self.current.lock().await.take() {
            connection.shutdown().await;
        }
    }
}

fn closed_before_send(e: &ToolError) -> bool {
    matches!(e, ToolError::Transport { reason, .. } if reason == CONNECTION_CLOSED)
}

#[async_trait]
impl RemoteInvoker for RemoteToolProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        correlation_id: &str,
        name: &str,
        arguments: serde_json::Value,
        token: Option<&AccessToken>,
    ) -> Result<ToolCallResult, ToolError> {
        let deadline = Instant::now() + self.settings.call_timeout;
        let connection = self.connection().await?;
        let result = match connection.call_tool(name, arguments.clone(), token, deadline).await {
            // Closed while we queued behind another call; nothing was sent
            Err(e) if closed_before_send(&e) => {
                self.connection()
                    .await?
                    .call_tool(name, arguments, token, deadline)
                    .await?
            }
            other => other?,
        };
        Ok(ToolCallResult {
            correlation_id: correlation_id.to_string(),
            name: name.to_string(),
            content: result.joined_text(),
            structured: result.structured_content,
        })
    }
}
