//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Default chat model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Embedding model used by the retrieval index
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Conversation memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Caller authentication and token exchange
    #[serde(default)]
    pub auth: AuthConfig,

    /// Prompt pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Local and remote tools
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("embedding_model", &self.embedding_model)
            .field("memory", &self.memory)
            .field("retrieval", &self.retrieval)
            .field("gateway", &self.gateway)
            .field("auth", &self.auth)
            .field("pipeline", &self.pipeline)
            .field("tools", &self.tools)
            .finish()
    }
}

/// Which durable store backs conversation memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    #[default]
    Sqlite,
    Postgres,
    InMemory,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackendKind,

    /// Database URL; defaults to `~/.parley/memory.db` for SQLite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Maximum number of non-system messages kept per conversation
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_window_size() -> usize {
    20
}

impl std::fmt::Debug for MemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Postgres URLs carry passwords
        f.debug_struct("MemoryConfig")
            .field("backend", &self.backend)
            .field("database_url", &redact(&self.database_url))
            .field("window_size", &self.window_size)
            .finish()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackendKind::default(),
            database_url: None,
            window_size: default_window_size(),
        }
    }
}

impl MemoryConfig {
    /// The configured URL, or the default SQLite file under the config dir.
    pub fn resolved_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => sqlite_url(&AppConfig::config_dir().join("memory.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of documents injected per turn
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Documents scoring below this are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,

    /// SQLite file holding the document index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

fn default_top_k() -> usize {
    4
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            min_score: None,
            database_path: None,
        }
    }
}

impl RetrievalConfig {
    pub fn resolved_database_url(&self) -> String {
        let path = self
            .database_path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("documents.db"));
        sqlite_url(&path)
    }
}

fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// How audience-scoped tool tokens are obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeMode {
    /// Sign short-lived tokens with the local secret
    #[default]
    Local,
    /// RFC 8693 token exchange against an authorization server
    Oauth2,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify session tokens and mint tool tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Expected `iss` of inbound session tokens
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Expected `aud` of inbound session tokens
    #[serde(default = "default_audience")]
    pub audience: String,

    #[serde(default)]
    pub exchange: ExchangeConfig,
}

fn default_issuer() -> String {
    "parley".into()
}
fn default_audience() -> String {
    "parley".into()
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("exchange", &self.exchange)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: default_issuer(),
            audience: default_audience(),
            exchange: ExchangeConfig::default(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub mode: ExchangeMode,

    /// Token endpoint for `oauth2` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Lifetime of locally minted tool tokens
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Cached tokens are refreshed this long before `exp`
    #[serde(default = "default_cache_skew_secs")]
    pub cache_skew_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    300
}
fn default_cache_skew_secs() -> u64 {
    30
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("mode", &self.mode)
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("cache_skew_secs", &self.cache_skew_secs)
            .finish()
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            mode: ExchangeMode::default(),
            token_endpoint: None,
            client_id: None,
            client_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
            cache_skew_secs: default_cache_skew_secs(),
        }
    }
}

/// How conversation history is placed into the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Appended to the system text as a MEMORY section
    #[default]
    SystemText,
    /// Sent as prior chat messages
    Messages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub memory_mode: MemoryMode,

    /// Upper bound on model round trips per turn
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Forwarded to providers that support prompt caching
    #[serde(default = "default_prompt_cache_key", skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
}

fn default_system_prompt() -> String {
    "You are an AI powered assistant to help people adopt a dog from the adoption agency \
named Pooch Palace with locations in Antwerp, Seoul, Tokyo, Singapore, Paris, Mumbai, \
New Delhi, Barcelona, San Francisco, and London. Information about the dogs available \
will be presented below. If there is no information, then return a polite response \
suggesting we don't have any dogs available.\n\
If somebody asks for a time to pick up the dog, don't ask other questions: simply \
provide a time by consulting the tools you have available."
        .into()
}
fn default_max_tool_iterations() -> usize {
    10
}
fn default_prompt_cache_key() -> Option<String> {
    Some("system_cache_key".into())
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            memory_mode: MemoryMode::default(),
            max_tool_iterations: default_max_tool_iterations(),
            prompt_cache_key: default_prompt_cache_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Register the built-in local tools
    #[serde(default = "default_true")]
    pub local_enabled: bool,

    /// Audience recorded for local tools that act on behalf of the caller
    #[serde(default = "default_tool_audience")]
    pub local_audience: String,

    #[serde(default = "default_call_timeout_ms")]
    pub local_timeout_ms: u64,

    /// Remote tool providers
    #[serde(default)]
    pub providers: Vec<ToolProviderConfig>,
}

fn default_tool_audience() -> String {
    "authserver".into()
}
fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            local_enabled: true,
            local_audience: default_tool_audience(),
            local_timeout_ms: default_call_timeout_ms(),
            providers: vec![],
        }
    }
}

/// How a remote tool provider is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a process and speak line-delimited JSON-RPC over its stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// POST JSON-RPC requests to a URL
    Http { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    pub name: String,

    pub transport: TransportConfig,

    /// Audience that tokens for this provider are scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,

    /// Every tool from this provider requires an authenticated caller
    #[serde(default)]
    pub requires_auth: bool,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long a timed-out call may still drain before the connection closes
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_drain_grace_ms() -> u64 {
    2_000
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides:
    /// - `PARLEY_API_KEY`, then `OPENAI_API_KEY`
    /// - `PARLEY_API_URL`, `PARLEY_MODEL`
    /// - `PARLEY_JWT_SECRET`
    /// - `PARLEY_DATABASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup("PARLEY_API_URL") {
            self.api_url = url;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.default_model = model;
        }
        if let Some(secret) = lookup("PARLEY_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(url) = lookup("PARLEY_DATABASE_URL") {
            self.memory.database_url = Some(url);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.memory.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "memory.window_size must be greater than 0".into(),
            ));
        }
        if self.memory.backend == MemoryBackendKind::Postgres && self.memory.database_url.is_none() {
            return Err(ConfigError::ValidationError(
                "memory.database_url is required for the postgres backend".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be greater than 0".into(),
            ));
        }
        if let Some(min) = self.retrieval.min_score {
            if !(-1.0..=1.0).contains(&min) {
                return Err(ConfigError::ValidationError(
                    "retrieval.min_score must be between -1.0 and 1.0".into(),
                ));
            }
        }
        if self.pipeline.max_tool_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_tool_iterations must be greater than 0".into(),
            ));
        }
        if self.auth.exchange.mode == ExchangeMode::Oauth2 && self.auth.exchange.token_endpoint.is_none() {
            return Err(ConfigError::ValidationError(
                "auth.exchange.token_endpoint is required in oauth2 mode".into(),
            ));
        }
        if self.tools.local_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tools.local_timeout_ms must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.tools.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "tool provider names must not be empty".into(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool provider '{}'",
                    provider.name
                )));
            }
            if provider.call_timeout_ms == 0 || provider.handshake_timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "tool provider '{}': timeouts must be greater than 0",
                    provider.name
                )));
            }
            if provider.requires_auth && provider.audience.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "tool provider '{}' requires auth but declares no audience",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            embedding_model: default_embedding_model(),
            memory: MemoryConfig::default(),
            retrieval: RetrievalConfig::default(),
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            pipeline: PipelineConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.window_size, 20);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.tools.local_audience, "authserver");
        assert_eq!(config.pipeline.prompt_cache_key.as_deref(), Some("system_cache_key"));
        assert!(config.pipeline.system_prompt.contains("Pooch Palace"));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_model, config.default_model);
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.pipeline.memory_mode, MemoryMode::SystemText);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let mut config = AppConfig::default();
        config.memory.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::read_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_model, "gpt-4o-mini");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-openai"),
            ("PARLEY_MODEL", "gpt-4.1"),
            ("PARLEY_JWT_SECRET", "s3cret"),
        ]);
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.default_model, "gpt-4.1");
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));

        let env: HashMap<&str, &str> =
            HashMap::from([("OPENAI_API_KEY", "sk-openai"), ("PARLEY_API_KEY", "sk-parley")]);
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-parley"));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-very-secret".into());
        config.auth.jwt_secret = Some("jwt-very-secret".into());
        config.memory.database_url = Some("postgres://u:pw-very-secret@db/parley".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn tool_provider_parsing() {
        let toml_str = r#"
[[tools.providers]]
name = "scheduler"
audience = "authserver"
requires_auth = true
call_timeout_ms = 5000
[tools.providers.transport]
type = "stdio"
command = "parley"
args = ["serve-tools"]

[[tools.providers]]
name = "weather"
[tools.providers.transport]
type = "http"
url = "http://localhost:8081/mcp"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.tools.providers.len(), 2);
        let scheduler = &config.tools.providers[0];
        assert!(scheduler.requires_auth);
        assert_eq!(scheduler.drain_grace_ms, 2_000);
        assert!(matches!(
            scheduler.transport,
            TransportConfig::Stdio { ref command, .. } if command == "parley"
        ));
        assert!(matches!(
            config.tools.providers[1].transport,
            TransportConfig::Http { .. }
        ));
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let provider = ToolProviderConfig {
            name: "scheduler".into(),
            transport: TransportConfig::Http { url: "http://x".into() },
            audience: None,
            requires_auth: false,
            call_timeout_ms: 1000,
            handshake_timeout_ms: 1000,
            drain_grace_ms: 100,
        };
        let mut config = AppConfig::default();
        config.tools.providers = vec![provider.clone(), provider];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn auth_provider_needs_audience() {
        let mut config = AppConfig::default();
        config.tools.providers.push(ToolProviderConfig {
            name: "scheduler".into(),
            transport: TransportConfig::Http { url: "http://x".into() },
            audience: None,
            requires_auth: true,
            call_timeout_ms: 1000,
            handshake_timeout_ms: 1000,
            drain_grace_ms: 100,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn oauth2_exchange_needs_endpoint() {
        let mut config = AppConfig::default();
        config.auth.exchange.mode = ExchangeMode::Oauth2;
        assert!(config.validate().is_err());
        config.auth.exchange.token_endpoint = Some("http://localhost:9000/oauth2/token".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "default_model = \"gpt-4.1-mini\"\n[memory]\nbackend = \"in_memory\"\nwindow_size = 6\n",
        )
        .unwrap();
        let config = AppConfig::read_file(&path).unwrap();
        assert_eq!(config.default_model, "gpt-4.1-mini");
        assert_eq!(config.memory.backend, MemoryBackendKind::InMemory);
        assert_eq!(config.memory.window_size, 6);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "memory = [").unwrap();
        assert!(matches!(
            AppConfig::read_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
