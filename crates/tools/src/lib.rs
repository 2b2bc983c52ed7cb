//! Tools for Parley: built-in local tools, remote tool providers reached
//! over JSON-RPC, and the catalog that turns both into registry snapshots.
//!
//! - [`protocol`]: wire frames (`initialize`, `tools/list`, `tools/call`)
//! - [`channel`] / [`connector`]: stdio, HTTP and in-memory transports
//! - [`connection`]: the per-connection state machine
//! - [`remote`]: a provider that reconnects with a fresh handshake
//! - [`catalog`]: registry snapshots for pipeline runs
//! - [`server`]: serves local tools to other clients

pub mod catalog;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod current_time;
pub mod protocol;
pub mod remote;
pub mod schedule_adoption;
pub mod server;

pub use catalog::ToolCatalog;
pub use channel::{ChannelError, HttpChannel, RpcChannel, StreamChannel};
pub use connection::{ConnectionSettings, ConnectionState, RemoteConnection};
pub use connector::{Connector, DuplexConnector, HttpConnector, StdioConnector};
pub use remote::RemoteToolProvider;
pub use server::ToolServer;

use parley_config::ToolsConfig;
use parley_core::auth::TokenExchanger;
use parley_core::error::ToolError;
use parley_core::event::EventBus;
use parley_core::tool::Tool;
use std::sync::Arc;
use std::time::Duration;

/// The built-in local tools.
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(schedule_adoption::ScheduleAdoptionTool),
        Arc::new(current_time::CurrentTimeTool),
    ]
}

/// Assemble the catalog described by `[tools]`.
///
/// Providers are not contacted here; the first snapshot connects them.
pub fn catalog_from_config(
    config: &ToolsConfig,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    events: Option<Arc<EventBus>>,
) -> Result<ToolCatalog, ToolError> {
    let mut catalog = ToolCatalog::new()
        .with_local_timeout(Duration::from_millis(config.local_timeout_ms))
        .with_local_audience(config.local_audience.clone());

    if config.local_enabled {
        for tool in builtin_tools() {
            catalog = catalog.with_local(tool);
        }
    }
    if let Some(exchanger) = exchanger {
        catalog = catalog.with_exchanger(exchanger);
    }
    for provider_config in &config.providers {
        let mut provider = RemoteToolProvider::from_config(provider_config)?;
        if let Some(events) = &events {
            provider = provider.with_events(events.clone());
        }
        catalog = catalog.with_provider(Arc::new(provider));
    }
    Ok(catalog)
}
