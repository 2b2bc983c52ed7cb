//! Opening channels to remote tool providers.

use crate::channel::{ChannelError, HttpChannel, RpcChannel, StreamChannel};
use crate::connection::ConnectionSettings;
use async_trait::async_trait;
use parley_config::TransportConfig;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn describe(&self) -> String;

    /// Open a fresh channel. Every call yields a new, independent one.
    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, ChannelError>;
}

/// Build the connector for a configured transport.
pub fn from_config(
    provider: &str,
    transport: &TransportConfig,
    settings: &ConnectionSettings,
) -> Result<Arc<dyn Connector>, ChannelError> {
    Ok(match transport {
        TransportConfig::Stdio { command, args, env } => Arc::new(StdioConnector::new(
            provider,
            command.clone(),
            args.clone(),
            env.clone(),
        )),
        TransportConfig::Http { url } => {
            Arc::new(HttpConnector::new(provider, url.clone(), settings.exchange_timeout())?)
        }
    })
}

/// Spawns a tool server process and talks to it over stdio.
pub struct StdioConnector {
    provider: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl StdioConnector {
    pub fn new(
        provider: impl Into<String>,
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            command,
            args,
            env,
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    fn describe(&self) -> String {
        format!("stdio:{} {}", self.command, self.args.join(" "))
    }

    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, ChannelError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::Io(format!("spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Io("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Io("child stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let provider = self.provider.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "{line}");
                }
            });
        }

        info!(provider = %self.provider, command = %self.command, pid = ?child.id(), "Spawned tool provider");
        Ok(Arc::new(StreamChannel::new(self.provider.clone(), stdout, stdin).with_child(child)))
    }
}

pub struct HttpConnector {
    provider: String,
    url: String,
    client: reqwest::Client,
}

impl HttpConnector {
    /// No single HTTP exchange outlives `exchange_timeout`, answered or not.
    pub fn new(
        provider: impl Into<String>,
        url: impl Into<String>,
        exchange_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(exchange_timeout)
            .build()
            .map_err(|e| ChannelError::Io(format!("HTTP client: {e}")))?;
        Ok(Self {
            provider: provider.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, ChannelError> {
        Ok(Arc::new(HttpChannel::new(
            self.provider.clone(),
            self.client.clone(),
            self.url.clone(),
        )))
    }
}

type ServeFn = dyn Fn(DuplexStream) + Send + Sync;

/// Connects to an in-process server over a `tokio::io::duplex` pipe.
///
/// `serve` receives the server end of every new connection.
pub struct DuplexConnector {
    provider: String,
    serve: Arc<ServeFn>,
    buffer: usize,
    connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new(provider: impl Into<String>, serve: impl Fn(DuplexStream) + Send + Sync + 'static) -> Self {
        Self {
            provider: provider.into(),
            serve: Arc::new(serve),
            buffer: 64 * 1024,
            connects: AtomicUsize::new(0),
        }
    }

    /// How many channels have been opened.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    fn describe(&self) -> String {
        format!("duplex:{}", self.provider)
    }

    async fn connect(&self) -> Result<Arc<dyn RpcChannel>, ChannelError> {
        let (client, server) = tokio::io::duplex(self.buffer);
        (self.serve)(server);
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (read, write) = tokio::io::split(client);
        Ok(Arc::new(StreamChannel::new(self.provider.clone(), read, write)))
    }
}
