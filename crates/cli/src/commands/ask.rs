//! `parley ask` — Answer one question from the terminal.

use super::services::Services;
use parley_config::AppConfig;
use parley_core::auth::Principal;

pub async fn run(
    config: AppConfig,
    question: &str,
    token: Option<String>,
    user: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services::build(&config).await?;

    let token = match (token, user) {
        (Some(token), _) => token,
        (None, Some(user)) => services.propagator.issue_session(
            &Principal::new(user),
            &["openid".to_string()],
            chrono::Duration::minutes(15),
        )?,
        (None, None) => return Err("pass --token <session jwt> or --user <name>".into()),
    };
    let auth = services
        .propagator
        .extract(Some(&format!("Bearer {token}")))?;

    let response = services.pipeline.run(question, auth).await?;
    println!("{}", response.answer);

    if !response.tool_transcript.is_empty() || !response.document_ids.is_empty() {
        eprintln!();
        for call in &response.tool_transcript {
            let status = if call.success { "ok" } else { "failed" };
            eprintln!("  tool {} ({status}, {}ms)", call.name, call.duration_ms);
        }
        if !response.document_ids.is_empty() {
            eprintln!("  documents: {}", response.document_ids.join(", "));
        }
    }
    Ok(())
}
