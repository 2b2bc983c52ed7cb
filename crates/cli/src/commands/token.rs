//! `parley token` — Issue a session token for local testing.

use parley_config::AppConfig;
use parley_core::auth::Principal;
use parley_security::{AuditEvent, AuditLogger, AuditOutcome};

pub fn run(config: &AppConfig, user: &str, scopes: &str, ttl_minutes: i64) -> Result<(), Box<dyn std::error::Error>> {
    if ttl_minutes <= 0 {
        return Err("--ttl-minutes must be positive".into());
    }
    let propagator = parley_security::propagator_from_config(&config.auth)?;
    let scopes: Vec<String> = scopes.split_whitespace().map(String::from).collect();

    let token = propagator.issue_session(&Principal::new(user), &scopes, chrono::Duration::minutes(ttl_minutes))?;

    AuditLogger::tracing().log(
        AuditEvent::SessionIssued,
        user,
        AuditOutcome::Success,
        Some(format!("ttl={ttl_minutes}m fingerprint={}", parley_security::fingerprint(&token))),
    );
    println!("{token}");
    Ok(())
}
