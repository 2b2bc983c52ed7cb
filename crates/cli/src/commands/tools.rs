//! `parley tools` — List the tools the model can call.

use super::services::Services;
use parley_config::AppConfig;

pub async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services::build(&config).await?;
    let registry = services.tools.snapshot().await?;

    println!("Tools ({})", registry.len());
    for descriptor in registry.descriptors() {
        let auth = if descriptor.auth.is_required() { " [auth]" } else { "" };
        println!("  {:<24} {:<20}{auth}", descriptor.name, descriptor.target.to_string());
        println!("      {}", descriptor.description);
    }
    Ok(())
}
