//! `parley config` — Show, locate or validate configuration.

use parley_config::AppConfig;
use std::path::Path;

const REDACTED: &str = "[REDACTED]";

pub fn path(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", AppConfig::config_dir().join("config.toml").display()),
    }
    Ok(())
}

pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", AppConfig::default_toml());
    Ok(())
}

pub fn show(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string_pretty(&redacted(config))?);
    Ok(())
}

pub fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Configuration is valid with {} warning(s):", warnings.len());
        for warning in &warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}

/// Problems that load fine but will fail at first use.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if !config.has_api_key() {
        warnings.push("no api_key set (PARLEY_API_KEY or OPENAI_API_KEY)".to_string());
    }
    if config.auth.jwt_secret.is_none() {
        warnings.push("no auth.jwt_secret set; sessions cannot be verified (PARLEY_JWT_SECRET)".to_string());
    }
    if config.tools.providers.iter().any(|p| p.requires_auth) && config.auth.jwt_secret.is_none() {
        warnings.push("tool providers require auth but no token can be minted".to_string());
    }
    warnings
}

fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    if config.auth.jwt_secret.is_some() {
        config.auth.jwt_secret = Some(REDACTED.into());
    }
    if config.auth.exchange.client_secret.is_some() {
        config.auth.exchange.client_secret = Some(REDACTED.into());
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_warn_about_missing_secrets() {
        let warnings = warnings(&AppConfig::default());
        assert!(warnings.iter().any(|w| w.contains("api_key")));
        assert!(warnings.iter().any(|w| w.contains("jwt_secret")));
    }

    #[test]
    fn configured_secrets_are_quiet_and_redacted() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-live".into());
        config.auth.jwt_secret = Some("super-secret".into());
        assert!(warnings(&config).is_empty());

        let shown = toml::to_string_pretty(&redacted(&config)).unwrap();
        assert!(!shown.contains("sk-live"));
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn validate_reads_an_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, AppConfig::default_toml()).unwrap();
        assert!(validate(Some(&path)).is_ok());

        std::fs::write(&path, "default_temperature = 9.0\n").unwrap();
        assert!(validate(Some(&path)).is_err());
    }
}
