//! End-to-end turns through the gateway: session check, memory, retrieval,
//! local tools and a remote tool provider that verifies its own tokens.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use parley_agent::{ChatPipeline, ToolSource};
use parley_core::auth::Principal;
use parley_core::error::{ProviderError, RetrievalError};
use parley_core::event::EventBus;
use parley_core::message::{Message, MessageToolCall, Role};
use parley_core::provider::{Provider, ProviderRequest, ProviderResponse};
use parley_core::retrieval::{Document, Embedder};
use parley_gateway::{GatewayState, SharedState, build_router};
use parley_memory::{InMemoryIndex, InMemoryRepository, MessageWindowMemory};
use parley_security::{AuditEvent, AuditLogger, AuditOutcome, AuthPropagator, CachingExchanger, JwtKeys, LocalTokenMinter};
use parley_tools::current_time::CurrentTimeTool;
use parley_tools::schedule_adoption::ScheduleAdoptionTool;
use parley_tools::{ConnectionSettings, DuplexConnector, RemoteToolProvider, ToolCatalog, ToolServer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &[u8] = b"integration-secret-integration-secret";
const VOCABULARY: [&str; 4] = ["prancer", "rover", "hours", "fee"];

/// Books an adoption when asked to adopt, otherwise answers from the prompt.
struct AdoptionModel {
    requests: Mutex<Vec<ProviderRequest>>,
}

impl AdoptionModel {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for AdoptionModel {
    fn name(&self) -> &str {
        "adoption-model"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let last = request.messages.last().cloned().unwrap_or_else(|| Message::user(""));

        let message = if last.role == Role::Tool {
            Message::assistant(format!("Booked: {}", last.content))
        } else if last.content.contains("adopt") && request.tools.iter().any(|t| t.name == "schedule_adoption") {
            let mut message = Message::assistant("");
            message.tool_calls = vec![MessageToolCall {
                id: "call_1".into(),
                name: "schedule_adoption".into(),
                arguments: r#"{"dogId": 45, "dogName": "Prancer"}"#.into(),
            }];
            message
        } else {
            Message::assistant("We have dogs available.")
        };
        Ok(ProviderResponse {
            message,
            usage: None,
            model: "adoption-model".into(),
        })
    }
}

/// One dimension per vocabulary word.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(inputs
            .iter()
            .map(|text| {
                let text = text.to_lowercase();
                VOCABULARY
                    .iter()
                    .map(|word| if text.contains(word) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect())
    }
}

fn keys() -> Arc<JwtKeys> {
    Arc::new(JwtKeys::from_secret(SECRET, "parley"))
}

fn serving(server: Arc<ToolServer>) -> Arc<DuplexConnector> {
    Arc::new(DuplexConnector::new("scheduler", move |stream| {
        let server = server.clone();
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(stream);
            let _ = server.serve(read, write).await;
        });
    }))
}

struct Harness {
    state: SharedState,
    model: Arc<AdoptionModel>,
    scheduler: Arc<ToolServer>,
}

async fn harness(connector: Option<Arc<DuplexConnector>>) -> Harness {
    let keys = keys();
    let audit = Arc::new(AuditLogger::new());
    let event_bus = Arc::new(EventBus::new(64));
    let model = Arc::new(AdoptionModel::new());

    let scheduler = Arc::new(
        ToolServer::new("scheduler")
            .with_tool(Arc::new(ScheduleAdoptionTool))
            .with_verifier(keys.clone(), "authserver"),
    );
    let connector = connector.unwrap_or_else(|| serving(scheduler.clone()));
    let settings = ConnectionSettings {
        call_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        drain_grace: Duration::from_millis(100),
    };
    let remote = RemoteToolProvider::new("scheduler", connector, settings)
        .with_auth("authserver", true)
        .with_events(event_bus.clone());
    let exchanger = CachingExchanger::new(
        LocalTokenMinter::new(keys.clone(), chrono::Duration::minutes(5)),
        chrono::Duration::seconds(30),
    )
    .with_audit(audit.clone());
    let catalog = ToolCatalog::new()
        .with_local(Arc::new(CurrentTimeTool))
        .with_provider(Arc::new(remote))
        .with_exchanger(Arc::new(exchanger));
    let tools = ToolSource::Catalog(Arc::new(catalog));

    let index = InMemoryIndex::new(Arc::new(KeywordEmbedder));
    index
        .add(vec![
            Document::new("dog-45", "id: 45, name: Prancer, description: A demonic, neurotic, man hating dog"),
            Document::new("dog-7", "id: 7, name: Rover, description: A calm retriever"),
            Document::new("faq-hours", "Opening hours are 9 to 5"),
        ])
        .await
        .unwrap();

    let memory = Arc::new(MessageWindowMemory::new(Arc::new(InMemoryRepository::new()), 20));
    let pipeline = ChatPipeline::builder(model.clone(), "adoption-model")
        .system_prompt("You help people adopt dogs from Pooch Palace.")
        .memory(memory)
        .retrieval(Arc::new(index), 1, None)
        .tools(tools.clone())
        .event_bus(event_bus.clone())
        .audit(audit.clone())
        .build();

    let state = Arc::new(GatewayState {
        pipeline: Arc::new(pipeline),
        propagator: AuthPropagator::new(keys, "parley"),
        tools,
        audit,
        event_bus,
    });
    Harness {
        state,
        model,
        scheduler,
    }
}

fn session(state: &SharedState, user: &str) -> String {
    state
        .propagator
        .issue_session(&Principal::new(user), &["openid".to_string()], chrono::Duration::minutes(10))
        .unwrap()
}

fn ask(question: &str, token: Option<&str>) -> Request<Body> {
    let encoded = question.replace(' ', "%20").replace('?', "%3F");
    let mut builder = Request::builder().uri(format!("/ask?question={encoded}"));
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn adoption_is_booked_for_the_signed_in_caller() {
    let h = harness(None).await;
    let token = session(&h.state, "george");

    let response = build_router(h.state.clone())
        .oneshot(ask("I want to adopt Prancer", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let answer = body_text(response).await;
    assert!(answer.starts_with("Booked:"), "{answer}");
    assert!(answer.contains("\"username\":\"george\""), "{answer}");
    assert_eq!(h.scheduler.calls(), 1);

    // Retrieved listing reached the first prompt
    let first = &h.model.requests()[0];
    let prompt = &first.messages.last().unwrap().content;
    assert!(prompt.contains("name: Prancer"));
    assert!(!prompt.contains("Rover"));

    // The remote call went out with a token minted for the provider
    let exchanges: Vec<_> = h
        .state
        .audit
        .entries()
        .into_iter()
        .filter(|e| matches!(&e.event, AuditEvent::TokenExchange { audience } if audience == "authserver"))
        .collect();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].actor, "george");
    assert_eq!(exchanges[0].outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn unauthenticated_request_never_reaches_model_or_tools() {
    let h = harness(None).await;

    let response = build_router(h.state.clone())
        .oneshot(ask("I want to adopt Prancer", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(h.model.requests().is_empty());
    assert_eq!(h.scheduler.calls(), 0);
}

#[tokio::test]
async fn second_turn_remembers_the_first() {
    let h = harness(None).await;
    let token = session(&h.state, "george");

    for question in ["What are your opening hours?", "And what is the fee?"] {
        let response = build_router(h.state.clone())
            .oneshot(ask(question, Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let second = &h.model.requests()[1];
    let system = &second.messages[0].content;
    assert!(system.contains("USER: What are your opening hours?"));
    assert!(system.contains("ASSISTANT: We have dogs available."));
}

#[tokio::test]
async fn provider_outage_leaves_local_tools_available() {
    let down = Arc::new(DuplexConnector::new("scheduler", drop));
    let h = harness(Some(down)).await;
    let token = session(&h.state, "george");

    let response = build_router(h.state.clone())
        .oneshot(ask("Do you have Rover?", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "We have dogs available.");

    let tools = &h.model.requests()[0].tools;
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["current_time"]);
}
