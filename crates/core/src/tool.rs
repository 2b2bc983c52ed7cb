//! Tools: callable capabilities the model may invoke mid-turn.
//!
//! A [`ToolRegistry`] is an immutable snapshot mapping tool names to
//! descriptors and bindings. Bindings are either in-process [`Tool`]s or
//! [`RemoteInvoker`]s (a connection to a remote tool provider). The
//! registry is the only place that turns a caller's [`AuthContext`] into an
//! audience-scoped [`AccessToken`], and it fails closed: a tool that needs
//! an authenticated caller is never invoked without one.

use crate::auth::{AccessToken, AuthContext, Principal, TokenExchanger};
use crate::error::ToolError;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a tool is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolTarget {
    /// An in-process function
    Local,
    /// A remote tool provider, by configured name
    Remote { provider: String },
}

impl std::fmt::Display for ToolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolTarget::Local => f.write_str("local"),
            ToolTarget::Remote { provider } => write!(f, "remote:{provider}"),
        }
    }
}

/// Whether invoking a tool requires an authenticated caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthRequirement {
    #[default]
    None,
    /// The caller must be authenticated; remote calls carry a token
    /// minted for `audience`.
    Required { audience: String },
}

impl AuthRequirement {
    pub fn is_required(&self) -> bool {
        matches!(self, AuthRequirement::Required { .. })
    }
}

/// Static description of one tool in a registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub target: ToolTarget,
    #[serde(default)]
    pub auth: AuthRequirement,
}

impl ToolDescriptor {
    /// The definition sent to the model. Auth and target stay server-side.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// A request to execute a tool.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Correlation id (matches the model's tool_call id)
    pub correlation_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// The caller's identity, if the turn has one
    pub auth: Option<AuthContext>,
}

/// The successful result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub correlation_id: String,
    pub name: String,
    /// Text shown to the model
    pub content: String,
    /// Optional structured result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

/// What an in-process tool returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub structured: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
        }
    }

    /// Structured output; the content is the compact JSON rendering.
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            content: value.to_string(),
            structured: Some(value),
        }
    }
}

/// Per-invocation context handed to in-process tools.
///
/// Carries the verified principal, never the credential.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub correlation_id: String,
    pub principal: Option<Principal>,
}

/// An in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether the tool acts on behalf of the caller.
    fn requires_auth(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Describe this tool as a local registry entry.
    ///
    /// `audience` names the audience recorded for auth-requiring tools.
    fn descriptor(&self, audience: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
            target: ToolTarget::Local,
            auth: if self.requires_auth() {
                AuthRequirement::Required {
                    audience: audience.to_string(),
                }
            } else {
                AuthRequirement::None
            },
        }
    }
}

/// A connection to a remote tool provider, seen from the registry.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Invoke `name` remotely. `token` is already scoped to the provider's
    /// audience; the invoker attaches it the way its transport expects.
    async fn invoke(
        &self,
        correlation_id: &str,
        name: &str,
        arguments: serde_json::Value,
        token: Option<&AccessToken>,
    ) -> std::result::Result<ToolCallResult, ToolError>;
}

#[derive(Clone)]
enum ToolBinding {
    Local(Arc<dyn Tool>),
    Remote(Arc<dyn RemoteInvoker>),
}

struct RegistryEntry {
    descriptor: ToolDescriptor,
    binding: ToolBinding,
}

/// An immutable snapshot of the tools available to one pipeline run.
pub struct ToolRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    local_timeout: Duration,
}

/// Assembles a [`ToolRegistry`], rejecting duplicate names.
pub struct ToolRegistryBuilder {
    entries: Vec<RegistryEntry>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    local_timeout: Duration,
    local_audience: String,
}

impl ToolRegistryBuilder {
    /// Register an in-process tool.
    pub fn local(mut self, tool: Arc<dyn Tool>) -> Self {
        let descriptor = tool.descriptor(&self.local_audience);
        self.entries.push(RegistryEntry {
            descriptor,
            binding: ToolBinding::Local(tool),
        });
        self
    }

    /// Register a tool served by a remote provider.
    pub fn remote(mut self, descriptor: ToolDescriptor, invoker: Arc<dyn RemoteInvoker>) -> Self {
        self.entries.push(RegistryEntry {
            descriptor,
            binding: ToolBinding::Remote(invoker),
        });
        self
    }

    pub fn token_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    pub fn local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// Audience recorded on local tools that require auth.
    pub fn local_audience(mut self, audience: impl Into<String>) -> Self {
        self.local_audience = audience.into();
        self
    }

    pub fn build(self) -> std::result::Result<ToolRegistry, ToolError> {
        let mut entries: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for entry in self.entries {
            if let Some(existing) = entries.get(&entry.descriptor.name) {
                return Err(ToolError::DuplicateName {
                    name: entry.descriptor.name.clone(),
                    first: existing.descriptor.target.to_string(),
                    second: entry.descriptor.target.to_string(),
                });
            }
            entries.insert(entry.descriptor.name.clone(), entry);
        }
        Ok(ToolRegistry {
            entries,
            exchanger: self.exchanger,
            local_timeout: self.local_timeout,
        })
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            entries: Vec::new(),
            exchanger: None,
            local_timeout: Duration::from_secs(30),
            local_audience: "local".into(),
        }
    }

    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            exchanger: None,
            local_timeout: Duration::from_secs(30),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    /// All descriptors, ordered by name.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.entries.values().map(|e| &e.descriptor).collect()
    }

    /// Tool definitions for the model, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|e| e.descriptor.to_definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Execute a tool call.
    ///
    /// Fails with `NotFound` for unknown names and `Unauthorized` when the
    /// tool requires a caller and none (or an expired one) was supplied,
    /// or when no audience-scoped token could be obtained. In both
    /// unauthorized cases the tool is never reached.
    pub async fn call(&self, request: ToolCallRequest) -> std::result::Result<ToolCallResult, ToolError> {
        let entry = self
            .entries
            .get(&request.name)
            .ok_or_else(|| ToolError::NotFound(request.name.clone()))?;

        let principal = request.auth.as_ref().map(|ctx| ctx.principal.clone());

        if let AuthRequirement::Required { audience } = &entry.descriptor.auth {
            let ctx = request.auth.as_ref().ok_or_else(|| ToolError::Unauthorized {
                tool_name: request.name.clone(),
                reason: "no caller identity on this turn".into(),
            })?;
            if ctx.is_expired() {
                return Err(ToolError::Unauthorized {
                    tool_name: request.name.clone(),
                    reason: "caller credential expired".into(),
                });
            }

            if let ToolBinding::Remote(invoker) = &entry.binding {
                let exchanger = self.exchanger.as_ref().ok_or_else(|| ToolError::Unauthorized {
                    tool_name: request.name.clone(),
                    reason: "no token exchanger configured".into(),
                })?;
                let token = exchanger.exchange(ctx, audience).await.map_err(|e| {
                    warn!(tool = %request.name, audience = %audience, error = %e, "Token exchange failed");
                    ToolError::Unauthorized {
                        tool_name: request.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                debug!(
                    tool = %request.name,
                    provider = %invoker.provider_name(),
                    audience = %token.audience,
                    "Invoking remote tool with scoped token"
                );
                return invoker
                    .invoke(&request.correlation_id, &request.name, request.arguments, Some(&token))
                    .await;
            }
        }

        match &entry.binding {
            ToolBinding::Remote(invoker) => {
                invoker
                    .invoke(&request.correlation_id, &request.name, request.arguments, None)
                    .await
            }
            ToolBinding::Local(tool) => {
                let ctx = ToolContext {
                    correlation_id: request.correlation_id.clone(),
                    principal,
                };
                let output = tokio::time::timeout(
                    self.local_timeout,
                    tool.execute(request.arguments, &ctx),
                )
                .await
                .map_err(|_| ToolError::Timeout {
                    tool_name: request.name.clone(),
                    timeout_ms: self.local_timeout.as_millis() as u64,
                })??;
                Ok(ToolCallResult {
                    correlation_id: request.correlation_id,
                    name: request.name,
                    content: output.content,
                    structured: output.structured,
                })
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("local_timeout", &self.local_timeout)
            .finish_non_exhaustive()
    }
}
