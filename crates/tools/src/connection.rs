//! One live connection to a remote tool provider.
//!
//! ```text
//! Uninitialized → Handshaking → Ready ⇄ Calling
//!                      │          │        │
//!                      └──────────┴────────┴─→ Closing → Closed
//! ```
//!
//! Closed is terminal. A provider that needs to talk again opens a new
//! connection with a fresh handshake.

use crate::channel::{ChannelError, RpcChannel};
use crate::protocol::{self, CallToolResult, InitializeResult, McpToolDef, ServerInfo, ToolsListResult};
use chrono::Utc;
use parley_core::auth::AccessToken;
use parley_core::error::ToolError;
use parley_core::event::{DomainEvent, EventBus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reason reported when a call finds the connection already closed,
/// before anything was sent.
pub(crate) const CONNECTION_CLOSED: &str = "connection closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Handshaking,
    Ready,
    Calling,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Calling => "calling",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Deadlines for one provider.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a timed-out call may still drain before the connection closes
    pub drain_grace: Duration,
}

impl ConnectionSettings {
    /// The longest any one exchange may stay open: its deadline plus the drain.
    pub fn exchange_timeout(&self) -> Duration {
        self.call_timeout.max(self.handshake_timeout) + self.drain_grace
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(2),
        }
    }
}

impl From<&parley_config::ToolProviderConfig> for ConnectionSettings {
    fn from(config: &parley_config::ToolProviderConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        }
    }
}

pub struct RemoteConnection {
    provider: String,
    generation: u64,
    channel: Arc<dyn RpcChannel>,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    call_lock: Arc<tokio::sync::Mutex<()>>,
    in_flight: AtomicUsize,
    server: ServerInfo,
    tools: Vec<McpToolDef>,
    events: Option<Arc<EventBus>>,
}

/// Marks one call in flight; returning to Ready when the last one ends.
struct CallSlot {
    connection: Arc<RemoteConnection>,
    serial: Option<OwnedMutexGuard<()>>,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        if self.connection.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connection.transition_if(ConnectionState::Calling, ConnectionState::Ready);
        }
    }
}

impl RemoteConnection {
    /// Handshake over `channel` and cache the provider's tool list.
    ///
    /// On any failure the channel is closed and the error returned.
    pub async fn establish(
        provider: impl Into<String>,
        generation: u64,
        channel: Arc<dyn RpcChannel>,
        settings: ConnectionSettings,
        events: Option<Arc<EventBus>>,
    ) -> Result<Arc<Self>, ToolError> {
        let provider = provider.into();
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let mut connection = Self {
            provider,
            generation,
            channel,
            settings,
            state,
            call_lock: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: AtomicUsize::new(0),
            server: ServerInfo::default(),
            tools: Vec::new(),
            events,
        };

        connection.set_state(ConnectionState::Handshaking);
        match connection.handshake().await {
            Ok(()) => {
                connection.set_state(ConnectionState::Ready);
                info!(
                    provider = %connection.provider,
                    generation,
                    server = %connection.server.name,
                    tools = connection.tools.len(),
                    "Tool provider ready"
                );
                Ok(Arc::new(connection))
            }
            Err(e) => {
                warn!(provider = %connection.provider, error = %e, "Tool provider handshake failed");
                connection.shutdown().await;
                Err(connection.transport_error(&e))
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ChannelError> {
        let deadline = self.settings.handshake_timeout;
        let init = self
            .channel
            .request(protocol::METHOD_INITIALIZE, Some(protocol::initialize_params()), None, deadline)
            .await?;
        let init: InitializeResult =
            serde_json::from_value(init).map_err(|e| ChannelError::Protocol(format!("initialize result: {e}")))?;
        debug!(provider = %self.provider, protocol = %init.protocol_version, "Initialized");
        self.server = init.server_info;

        self.channel.notify(protocol::METHOD_INITIALIZED, None).await?;

        let list = self
            .channel
            .request(protocol::METHOD_TOOLS_LIST, None, None, deadline)
            .await?;
        let list: ToolsListResult =
            serde_json::from_value(list).map_err(|e| ChannelError::Protocol(format!("tools/list result: {e}")))?;
        self.tools = list.tools;
        Ok(())
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Tool definitions cached at handshake.
    pub fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Invoke `tools/call`, answering by `deadline` at the latest.
    ///
    /// Calls on a non-multiplexed channel run one at a time, and waiting
    /// for a turn counts against the deadline. A call that misses its
    /// deadline returns `Timeout` at once and gives up its turn; its reply
    /// is given `drain_grace` to arrive, after which the connection is
    /// closed.
    pub async fn call_tool(
        self: &Arc<Self>,
        name: &str,
        arguments: serde_json::Value,
        token: Option<&AccessToken>,
        deadline: Instant,
    ) -> Result<CallToolResult, ToolError> {
        let serial = if self.channel.multiplexed() {
            None
        } else {
            match tokio::time::timeout_at(deadline, self.call_lock.clone().lock_owned()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    debug!(provider = %self.provider, tool = name, "Deadline passed while queued");
                    return Err(self.timeout_error(name));
                }
            }
        };
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timeout_error(name));
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.transition_if(ConnectionState::Ready, ConnectionState::Calling);
        let mut slot = CallSlot {
            connection: self.clone(),
            serial,
        };

        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let reply = self
            .channel
            .request(
                protocol::METHOD_TOOLS_CALL,
                Some(params),
                token.map(|t| &t.token),
                remaining,
            )
            .await;

        match reply {
            Ok(value) => {
                drop(slot);
                let result: CallToolResult = serde_json::from_value(value).map_err(|e| ToolError::Execution {
                    tool_name: name.to_string(),
                    payload: serde_json::json!({ "message": format!("unreadable tools/call result: {e}") }),
                })?;
                if result.is_error {
                    return Err(ToolError::Execution {
                        tool_name: name.to_string(),
                        payload: result
                            .structured_content
                            .clone()
                            .unwrap_or_else(|| serde_json::Value::from(result.joined_text())),
                    });
                }
                Ok(result)
            }
            Err(ChannelError::Timeout { late, timeout_ms, .. }) => {
                warn!(provider = %self.provider, tool = name, timeout_ms, "Tool call timed out, draining");
                // Queued calls go ahead on their own deadlines
                slot.serial = None;
                let grace = self.settings.drain_grace;
                let connection = self.clone();
                tokio::spawn(async move {
                    if late.drain(grace).await {
                        debug!(provider = %connection.provider, "Late reply drained");
                        drop(slot);
                    } else {
                        connection.shutdown().await;
                        drop(slot);
                    }
                });
                Err(self.timeout_error(name))
            }
            Err(ChannelError::Rpc(error)) => {
                drop(slot);
                Err(ToolError::Execution {
                    tool_name: name.to_string(),
                    payload: serde_json::to_value(&error).unwrap_or_default(),
                })
            }
            Err(e) => {
                self.shutdown().await;
                drop(slot);
                Err(self.transport_error(&e))
            }
        }
    }

    /// Close the channel. Idempotent.
    pub async fn shutdown(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.channel.close().await;
        self.set_state(ConnectionState::Closed);
    }

    fn transition_if(&self, from: ConnectionState, to: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.announce(to);
        }
    }

    fn set_state(&self, to: ConnectionState) {
        if self.state.send_replace(to) != to {
            self.announce(to);
        }
    }

    fn announce(&self, state: ConnectionState) {
        debug!(provider = %self.provider, generation = self.generation, %state, "Connection state changed");
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ConnectionStateChanged {
                provider: self.provider.clone(),
                generation: self.generation,
                state: state.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn closed_error(&self) -> ToolError {
        ToolError::Transport {
            provider: self.provider.clone(),
            reason: CONNECTION_CLOSED.into(),
        }
    }

    fn timeout_error(&self, name: &str) -> ToolError {
        ToolError::Timeout {
            tool_name: name.to_string(),
            timeout_ms: self.settings.call_timeout.as_millis() as u64,
        }
    }

    fn transport_error(&self, e: &ChannelError) -> ToolError {
        ToolError::Transport {
            provider: self.provider.clone(),
            reason: e.to_string(),
        }
    }
}
