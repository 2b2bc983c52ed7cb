//! Request/response channels to a remote tool provider.
//!
//! [`StreamChannel`] speaks newline-delimited JSON-RPC over any byte
//! stream pair (child stdio, in-memory duplex). A reader task routes each
//! response to the pending request with the same id; replies nobody is
//! waiting for are dropped. [`HttpChannel`] POSTs each request and may
//! have many in flight at once.

use crate::protocol::{self, JsonRpcError, JsonRpcMessage};
use async_trait::async_trait;
use parley_core::auth::Credential;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type RpcOutcome = Result<Value, JsonRpcError>;

/// A reply that missed its deadline but may still arrive.
pub struct LateReply(oneshot::Receiver<RpcOutcome>);

impl LateReply {
    /// Wait up to `grace` for the reply. True if it drained.
    pub async fn drain(self, grace: Duration) -> bool {
        matches!(tokio::time::timeout(grace, self.0).await, Ok(Ok(_)))
    }
}

impl std::fmt::Debug for LateReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LateReply")
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no reply to '{method}' within {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
        late: LateReply,
    },

    #[error("remote error: {0}")]
    Rpc(JsonRpcError),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("transport I/O failed: {0}")]
    Io(String),

    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Errors after which the channel cannot be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed(_) | ChannelError::Io(_) | ChannelError::Protocol(_)
        )
    }
}

#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and wait up to `deadline` for its response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&Credential>,
        deadline: Duration,
    ) -> Result<Value, ChannelError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError>;

    /// Whether concurrent requests may share this channel.
    fn multiplexed(&self) -> bool;

    async fn close(&self);
}

/// Wait on a pending slot, handing the slot back on timeout.
async fn await_reply(
    method: &str,
    mut rx: oneshot::Receiver<RpcOutcome>,
    deadline: Duration,
    closed_reason: impl FnOnce() -> String,
) -> Result<Value, ChannelError> {
    match tokio::time::timeout(deadline, &mut rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(ChannelError::Rpc(error)),
        Ok(Err(_)) => Err(ChannelError::Closed(closed_reason())),
        Err(_) => Err(ChannelError::Timeout {
            method: method.to_string(),
            timeout_ms: deadline.as_millis() as u64,
            late: LateReply(rx),
        }),
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>>;

struct StreamShared {
    name: String,
    pending: Pending,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl StreamShared {
    fn mark_closed(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(provider = %self.name, reason, "Stream channel closed");
            *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        }
        // Dropping the senders wakes every waiter with a closed error
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "closed".into())
    }
}

/// Line-delimited JSON-RPC over a byte stream.
pub struct StreamChannel {
    shared: Arc<StreamShared>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl StreamChannel {
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(StreamShared {
            name: name.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });
        let reader = tokio::spawn(read_loop(shared.clone(), reader));
        Self {
            shared,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            next_id: AtomicU64::new(1),
            reader,
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Tie a child process to this channel; it is killed on close.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = tokio::sync::Mutex::new(Some(child));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply, late ones included.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn write_frame(&self, frame: &JsonRpcMessage) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(frame).map_err(|e| ChannelError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| {
            self.shared.mark_closed(&format!("write failed: {e}"));
            ChannelError::Io(e.to_string())
        })
    }
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<StreamShared>, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "end of stream".to_string(),
            Err(e) => break format!("read failed: {e}"),
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: JsonRpcMessage = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => break format!("malformed frame: {e}"),
        };
        if !frame.is_response() {
            debug!(provider = %shared.name, method = ?frame.method, "Ignoring server-initiated message");
            continue;
        }

        let Some(id) = frame.numeric_id() else {
            warn!(provider = %shared.name, "Response without a usable id");
            continue;
        };
        let slot = shared.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        match slot {
            Some(tx) => {
                // The waiter may have given up; that is the drain case
                let _ = tx.send(frame.into_outcome());
            }
            None => debug!(provider = %shared.name, id, "Dropping reply nobody is waiting for"),
        }
    };
    shared.mark_closed(&reason);
}

#[async_trait]
impl RpcChannel for StreamChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&Credential>,
        deadline: Duration,
    ) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.shared.reason()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        if self.is_closed() {
            self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(ChannelError::Closed(self.shared.reason()));
        }

        let params = match bearer {
            Some(token) => Some(protocol::with_bearer(params, token.expose())),
            None => params,
        };
        if let Err(e) = self.write_frame(&JsonRpcMessage::request(id, method, params)).await {
            self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(e);
        }

        await_reply(method, rx, deadline, || self.shared.reason()).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.shared.reason()));
        }
        self.write_frame(&JsonRpcMessage::notification(method, params)).await
    }

    fn multiplexed(&self) -> bool {
        false
    }

    async fn close(&self) {
        self.shared.mark_closed("closed by client");
        let _ = self.writer.lock().await.shutdown().await;
        self.reader.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(provider = %self.shared.name, error = %e, "Failed to kill tool provider process");
            }
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST. Each request is independent.
pub struct HttpChannel {
    name: String,
    client: reqwest::Client,
    url: String,
    session_id: Arc<Mutex<Option<String>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    exchanges: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpChannel {
    pub fn new(name: impl Into<String>, client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            session_id: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            exchanges: Mutex::new(Vec::new()),
        }
    }

    /// Exchanges whose task has not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut exchanges = self.exchanges.lock().unwrap_or_else(|e| e.into_inner());
        exchanges.retain(|exchange| !exchange.is_finished());
        exchanges.len()
    }

    fn track(&self, handle: JoinHandle<()>) {
        {
            let mut exchanges = self.exchanges.lock().unwrap_or_else(|e| e.into_inner());
            exchanges.retain(|exchange| !exchange.is_finished());
            exchanges.push(handle);
        }
        // close() may have swept the list before the push
        if self.closed.load(Ordering::SeqCst) {
            self.abort_exchanges();
        }
    }

    fn abort_exchanges(&self) {
        let aborted: Vec<_> = self
            .exchanges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter(|handle| !handle.is_finished())
            .collect();
        if !aborted.is_empty() {
            debug!(provider = %self.name, exchanges = aborted.len(), "Aborting open HTTP exchanges");
        }
        for handle in aborted {
            handle.abort();
        }
    }

    fn post(&self, frame: &JsonRpcMessage, bearer: Option<&Credential>) -> reqwest::RequestBuilder {
        let mut request = self.client.post(&self.url).json(frame);
        if let Some(token) = bearer {
            request = request.bearer_auth(token.expose());
        }
        if let Some(session) = self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }
}

async fn send_http(
    request: reqwest::RequestBuilder,
    session_id: Arc<Mutex<Option<String>>>,
) -> Result<RpcOutcome, ChannelError> {
    let response = request.send().await.map_err(|e| ChannelError::Io(e.to_string()))?;

    if let Some(session) = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        *session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
    }

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Ok(Err(JsonRpcError::new(protocol::UNAUTHORIZED, format!("provider refused the call ({status})"))));
    }
    if !status.is_success() {
        return Err(ChannelError::Io(format!("provider returned {status}")));
    }

    let frame: JsonRpcMessage = response
        .json()
        .await
        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
    Ok(frame.into_outcome())
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&Credential>,
        deadline: Duration,
    ) -> Result<Value, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed("closed by client".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = self.post(&JsonRpcMessage::request(id, method, params), bearer);
        let session_id = self.session_id.clone();
        let name = self.name.clone();

        // Outlives the caller's deadline so a late reply can drain; close() aborts it
        let (tx, rx) = oneshot::channel();
        let exchange = tokio::spawn(async move {
            match send_http(request, session_id).await {
                Ok(outcome) => {
                    let _ = tx.send(outcome);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "HTTP tool request failed");
                    drop(tx);
                }
            }
        });
        self.track(exchange);

        await_reply(method, rx, deadline, || "HTTP request failed".into()).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        let response = self
            .post(&JsonRpcMessage::notification(method, params), None)
            .send()
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::Io(format!("provider returned {}", response.status())));
        }
        Ok(())
    }

    fn multiplexed(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.abort_exchanges();
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        self.abort_exchanges();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Answers each request line with its own params after `delay`.
    async fn echo_server(stream: tokio::io::DuplexStream, delay: Duration) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: JsonRpcMessage = serde_json::from_str(&line).unwrap();
            if frame.id.is_none() {
                continue;
            }
            tokio::time::sleep(delay).await;
            let reply = JsonRpcMessage::success(frame.id, frame.params.unwrap_or(Value::Null));
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    fn channel(delay: Duration) -> StreamChannel {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(echo_server(server, delay));
        let (read, write) = tokio::io::split(client);
        StreamChannel::new("echo", read, write)
    }

    #[tokio::test]
    async fn request_gets_matching_reply() {
        let ch = channel(Duration::ZERO);
        let reply = ch
            .request("tools/call", Some(serde_json::json!({"n": 1})), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply["n"], 1);
        assert_eq!(ch.pending(), 0);
    }

    #[tokio::test]
    async fn bearer_rides_in_meta() {
        let ch = channel(Duration::ZERO);
        let token = Credential::new("scoped.jwt.token");
        let reply = ch
            .request("tools/call", None, Some(&token), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(protocol::bearer_from_params(&reply), Some("scoped.jwt.token"));
    }

    #[tokio::test]
    async fn late_reply_drains_within_grace() {
        let ch = channel(Duration::from_millis(80));
        let err = ch
            .request("tools/call", None, None, Duration::from_millis(20))
            .await
            .unwrap_err();
        let ChannelError::Timeout { late, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert!(late.drain(Duration::from_secs(1)).await);
        assert_eq!(ch.pending(), 0);
        assert!(!ch.is_closed());
    }

    #[tokio::test]
    async fn reply_after_grace_is_dropped() {
        let ch = channel(Duration::from_millis(150));
        let err = ch
            .request("tools/call", None, None, Duration::from_millis(10))
            .await
            .unwrap_err();
        let ChannelError::Timeout { late, .. } = err else {
            panic!("expected timeout");
        };
        assert!(!late.drain(Duration::from_millis(10)).await);

        // The late frame arrives for an abandoned slot and is discarded
        let reply = ch
            .request("tools/call", Some(serde_json::json!({"n": 2})), None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply["n"], 2);
    }

    #[tokio::test]
    async fn eof_closes_and_fails_pending() {
        let (client, server) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(client);
        let ch = StreamChannel::new("dying", read, write);
        drop(server);

        let err = ch
            .request("tools/list", None, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_frame_closes_channel() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(client);
        let ch = StreamChannel::new("garbled", read, write);
        server.write_all(b"this is not json\n").await.unwrap();

        let err = ch
            .request("tools/list", None, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(ch.is_closed());
    }

    /// Serve `app` on an ephemeral port and return its URL.
    async fn http_provider(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    #[tokio::test]
    async fn http_channel_sends_bearer_and_echoes_session() {
        use axum::http::HeaderMap;
        use axum::{Json, Router, routing::post};

        async fn handle(headers: HeaderMap, Json(frame): Json<JsonRpcMessage>) -> (HeaderMap, Json<JsonRpcMessage>) {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            };
            let seen = serde_json::json!({
                "authorization": header("authorization"),
                "session": header(SESSION_HEADER),
            });
            let mut reply_headers = HeaderMap::new();
            reply_headers.insert(SESSION_HEADER, "session-1".parse().unwrap());
            (reply_headers, Json(JsonRpcMessage::success(frame.id, seen)))
        }

        let url = http_provider(Router::new().route("/mcp", post(handle))).await;
        let ch = HttpChannel::new("http", reqwest::Client::new(), url);
        assert!(ch.multiplexed());

        let token = Credential::new("tool-token");
        let first = ch
            .request("tools/list", None, Some(&token), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first["authorization"], "Bearer tool-token");
        assert!(first["session"].is_null());

        let second = ch.request("tools/list", None, None, Duration::from_secs(2)).await.unwrap();
        assert_eq!(second["session"], "session-1");
        assert!(second["authorization"].is_null());
        assert_eq!(ch.in_flight(), 0);
    }

    #[tokio::test]
    async fn http_refusal_is_an_unauthorized_rpc_error() {
        use axum::http::StatusCode;
        use axum::{Router, routing::post};

        let url = http_provider(Router::new().route("/mcp", post(|| async { StatusCode::UNAUTHORIZED }))).await;
        let ch = HttpChannel::new("http", reqwest::Client::new(), url);
        match ch.request("tools/call", None, None, Duration::from_secs(2)).await {
            Err(ChannelError::Rpc(error)) => assert_eq!(error.code, protocol::UNAUTHORIZED),
            other => panic!("expected rpc error, got {other:?}"),
        }

        ch.close().await;
        assert!(matches!(
            ch.request("tools/call", None, None, Duration::from_secs(2)).await,
            Err(ChannelError::Closed(_))
        ));
    }

    /// Counts how many handlers were entered and how many were dropped.
    #[derive(Clone, Default)]
    struct HandlerCount {
        entered: Arc<std::sync::atomic::AtomicUsize>,
        dropped: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct Held(Arc<std::sync::atomic::AtomicUsize>);

    impl Drop for Held {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A provider that accepts every request and never answers.
    async fn silent_http_provider(count: HandlerCount) -> String {
        use axum::{Router, routing::post};

        let handler = move || {
            let count = count.clone();
            async move {
                count.entered.fetch_add(1, Ordering::SeqCst);
                let _held = Held(count.dropped.clone());
                std::future::pending::<()>().await
            }
        };
        http_provider(Router::new().route("/mcp", post(handler))).await
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        let started = std::time::Instant::now();
        while !check() {
            assert!(started.elapsed() < Duration::from_secs(2), "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn http_close_aborts_timed_out_exchange() {
        let count = HandlerCount::default();
        let url = silent_http_provider(count.clone()).await;
        let ch = HttpChannel::new("http", reqwest::Client::new(), url);

        let err = ch
            .request("tools/call", None, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        let ChannelError::Timeout { late, timeout_ms, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(timeout_ms, 100);
        wait_until("handler to start", || count.entered.load(Ordering::SeqCst) == 1).await;
        assert_eq!(ch.in_flight(), 1);
        assert!(!late.drain(Duration::from_millis(50)).await);

        ch.close().await;
        assert_eq!(ch.in_flight(), 0);
        wait_until("handler to be dropped", || count.dropped.load(Ordering::SeqCst) == 1).await;
        assert!(matches!(
            ch.request("tools/call", None, None, Duration::from_secs(1)).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn dropping_http_channel_aborts_open_exchange() {
        let count = HandlerCount::default();
        let url = silent_http_provider(count.clone()).await;
        let ch = HttpChannel::new("http", reqwest::Client::new(), url);

        assert!(matches!(
            ch.request("tools/call", None, None, Duration::from_millis(50)).await,
            Err(ChannelError::Timeout { .. })
        ));
        wait_until("handler to start", || count.entered.load(Ordering::SeqCst) == 1).await;
        drop(ch);
        wait_until("handler to be dropped", || count.dropped.load(Ordering::SeqCst) == 1).await;
    }
}
