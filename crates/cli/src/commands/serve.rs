//! `parley serve` — Start the HTTP gateway.

use super::services::Services;
use parley_config::AppConfig;
use parley_gateway::GatewayState;
use std::sync::Arc;

pub async fn run(mut config: AppConfig, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let services = Services::build(&config).await?;
    let state = Arc::new(GatewayState {
        pipeline: services.pipeline,
        propagator: services.propagator,
        tools: services.tools,
        audit: services.audit,
        event_bus: services.event_bus,
    });

    println!("Parley gateway");
    println!("   Listening: http://{addr}");
    println!("   Model:     {}", config.default_model);
    println!("   Providers: {}", config.tools.providers.len());

    parley_gateway::start(state, &addr).await
}
