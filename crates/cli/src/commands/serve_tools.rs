//! `parley serve-tools` — Serve the built-in tools over stdio.
//!
//! Point another Parley at this with a stdio provider entry:
//!
//! ```toml
//! [[tools.providers]]
//! name = "scheduler"
//! audience = "authserver"
//! requires_auth = true
//! transport = { type = "stdio", command = "parley", args = ["serve-tools"] }
//! ```

use parley_config::AppConfig;
use parley_tools::ToolServer;
use tracing::info;

pub async fn run(config: &AppConfig, audience: &str) -> Result<(), Box<dyn std::error::Error>> {
    let keys = parley_security::keys_from_config(&config.auth)?;

    let mut server = ToolServer::new("parley-tools").with_verifier(keys, audience);
    for tool in parley_tools::builtin_tools() {
        server = server.with_tool(tool);
    }

    info!(audience = %audience, "Serving built-in tools on stdio");
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
    info!(calls = server.calls(), "Client disconnected");
    Ok(())
}
