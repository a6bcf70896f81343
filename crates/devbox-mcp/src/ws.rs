//! WebSocket transport for remote clients.
//!
//! ## Endpoints
//!
//! - `GET /?token=...` - WebSocket upgrade, token required
//! - `GET /health` - Health check, no token
//!
//! ## Envelopes
//!
//! Requests are `{id, type: "tool_request", timestamp, payload: {tool, params}}`.
//! Responses echo the `id` with `type` `tool_response` (`payload: {tool, result}`)
//! or `tool_error` (`payload: {tool, error}`).

use crate::auth::verify_token;
use crate::config::{ServerConfig, MAX_REQUEST_BYTES};
use crate::lifecycle::Lifecycle;
use crate::tools::ToolRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, Request, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Timing and limits for connections and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_in_flight: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            connection_timeout: config.connection_timeout,
            keepalive_interval: config.keepalive_interval,
            max_in_flight: config.max_in_flight,
        }
    }
}

/// Shared state for the router.
#[derive(Clone)]
pub struct WsState {
    registry: Arc<ToolRegistry>,
    token: Arc<String>,
    settings: ConnectionSettings,
    lifecycle: Arc<Lifecycle>,
}

impl WsState {
    pub fn new(
        registry: Arc<ToolRegistry>,
        token: impl Into<String>,
        settings: ConnectionSettings,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            registry,
            token: Arc::new(token.into()),
            settings,
            lifecycle,
        }
    }
}

/// Build the router. Only `/` sits behind the token check.
pub fn build_router(state: WsState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Reject requests whose `?token=` does not match. Nothing behind this
/// layer runs for a rejected request.
async fn require_token(State(state): State<WsState>, request: Request, next: Next) -> Response {
    let presented = Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .unwrap_or_default();

    if verify_token(&presented, &state.token) {
        return next.run(request).await;
    }

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".into());
    tracing::warn!(remote = %remote, token_present = !presented.is_empty(), "Rejected connection with invalid token");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid or missing token" })),
    )
        .into_response()
}

async fn health_handler(State(state): State<WsState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(json!({
        "status": "healthy",
        "service": "devbox-mcp",
        "tools": state.registry.len(),
    }))
}

async fn ws_upgrade_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.max_message_size(MAX_REQUEST_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Tool calls running on behalf of one connection.
///
/// At most `limit` run at once; a request over the limit is answered with
/// an error right away. Dropping the set aborts whatever is still running.
struct InFlight {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    replies: mpsc::UnboundedSender<Message>,
    conn_id: Arc<str>,
}

impl InFlight {
    fn new(
        registry: Arc<ToolRegistry>,
        settings: ConnectionSettings,
        replies: mpsc::UnboundedSender<Message>,
        conn_id: &str,
    ) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(settings.max_in_flight)),
            registry,
            timeout: settings.request_timeout,
            replies,
            conn_id: conn_id.into(),
        }
    }

    /// Start handling one frame.
    fn dispatch(&mut self, text: String) {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let id = serde_json::from_str::<RequestEnvelope>(&text)
                .map(|request| request.id)
                .unwrap_or(Value::Null);
            tracing::warn!(conn_id = %self.conn_id, in_flight = self.tasks.len(), "Rejecting request over the in-flight limit");
            let busy = ResponseEnvelope::error(id, None, "too many requests in flight");
            send_response(&self.replies, &self.conn_id, &busy);
            return;
        };

        let registry = Arc::clone(&self.registry);
        let replies = self.replies.clone();
        let conn_id = Arc::clone(&self.conn_id);
        let timeout = self.timeout;
        self.tasks.spawn(async move {
            let response = handle_message(&registry, timeout, &text).await;
            send_response(&replies, &conn_id, &response);
            drop(permit);
        });
    }

    /// Wait for the next call to finish. Pending forever when none run.
    async fn reap(&mut self) {
        match self.tasks.join_next().await {
            Some(Err(e)) if e.is_panic() => {
                tracing::error!(conn_id = %self.conn_id, error = %e, "Tool task panicked");
            }
            Some(_) => {}
            None => std::future::pending().await,
        }
    }

    /// Abort every call still running.
    async fn shutdown(mut self) {
        if !self.tasks.is_empty() {
            tracing::info!(conn_id = %self.conn_id, aborted = self.tasks.len(), "Aborting in-flight tool calls");
        }
        self.tasks.shutdown().await;
    }
}

fn send_response(replies: &mpsc::UnboundedSender<Message>, conn_id: &str, response: &ResponseEnvelope) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if replies.send(Message::Text(json)).is_err() {
                tracing::debug!(conn_id = %conn_id, id = %response.id, "Connection closed before the response was sent");
            }
        }
        Err(e) => tracing::error!(conn_id = %conn_id, error = %e, "Failed to encode response"),
    }
}

/// Serve one connection until the client leaves, it goes idle, or the
/// server shuts down.
async fn handle_socket(socket: WebSocket, state: WsState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "Connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer_conn_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() {
                tracing::debug!(conn_id = %writer_conn_id, "Write loop closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let settings = state.settings;
    let mut in_flight = InFlight::new(Arc::clone(&state.registry), settings, out_tx.clone(), &conn_id);
    let mut keepalive = tokio::time::interval(settings.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    let idle = tokio::time::sleep(settings.connection_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "Read error");
                        break;
                    }
                };
                idle.as_mut().reset(Instant::now() + settings.connection_timeout);
                in_flight.dispatch(text);
            }
            () = in_flight.reap() => {}
            _ = keepalive.tick() => {
                if out_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            () = &mut idle => {
                tracing::info!(conn_id = %conn_id, timeout_ms = settings.connection_timeout.as_millis() as u64, "Closing idle connection");
                let _ = out_tx.send(Message::Close(None));
                break;
            }
            () = state.lifecycle.wait_for_shutdown() => {
                let _ = out_tx.send(Message::Close(None));
                break;
            }
        }
    }

    in_flight.shutdown().await;
    drop(out_tx);
    if let Err(e) = writer.await {
        tracing::debug!(conn_id = %conn_id, error = %e, "Writer task ended abnormally");
    }
    tracing::info!(conn_id = %conn_id, "Connection closed");
}

/// Inbound request envelope.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub payload: RequestPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// Outbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub id: Value,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub payload: Value,
}

impl ResponseEnvelope {
    fn response(id: Value, payload: Value) -> Self {
        Self {
            id,
            kind: "tool_response",
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload,
        }
    }

    fn error(id: Value, tool: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            id,
            kind: "tool_error",
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload: json!({ "tool": tool, "error": error.into() }),
        }
    }
}

/// Turn one inbound text frame into its response envelope.
pub(crate) async fn handle_message(
    registry: &ToolRegistry,
    timeout: Duration,
    text: &str,
) -> ResponseEnvelope {
    if text.len() > MAX_REQUEST_BYTES {
        return ResponseEnvelope::error(
            Value::Null,
            None,
            format!("request exceeds {MAX_REQUEST_BYTES} bytes"),
        );
    }

    let request: RequestEnvelope = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed request envelope");
            return ResponseEnvelope::error(Value::Null, None, format!("invalid request: {e}"));
        }
    };

    if request.kind != "tool_request" {
        return ResponseEnvelope::error(
            request.id,
            None,
            format!("unsupported message type: {}", request.kind),
        );
    }
    let tool = request.payload.tool;
    if tool.is_empty() {
        return ResponseEnvelope::error(request.id, None, "payload.tool is required");
    }

    tracing::debug!(id = %request.id, tool = %tool, sent_at = ?request.timestamp, "Tool request");
    match registry
        .invoke_with_timeout(&tool, request.payload.params, timeout)
        .await
    {
        Ok(output) => ResponseEnvelope::response(
            request.id,
            json!({ "tool": tool, "result": output.to_value() }),
        ),
        Err(e) => ResponseEnvelope::error(request.id, Some(&tool), e.to_string()),
    }
}

/// Serve the router on a bound listener until `shutdown` resolves.
pub async fn serve(
    state: WsState,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "WebSocket transport listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolOutput, ToolSpec};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn settings() -> ConnectionSettings {
        ConnectionSettings::from_config(&ServerConfig::default())
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            ToolSpec {
                name: "ping",
                description: "Count and answer.",
                input_schema: crate::tools::empty_schema(),
            },
            move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolOutput::text("pong"))
                }
            },
        );
        registry
    }

    fn router(calls: Arc<AtomicUsize>) -> Router {
        build_router(WsState::new(
            Arc::new(counting_registry(calls)),
            "s3cret",
            settings(),
            Arc::new(Lifecycle::new()),
        ))
    }

    fn upgrade_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_token_is_401() {
        let calls = Arc::new(AtomicUsize::new(0));
        for uri in ["/?token=wrong", "/", "/?token="] {
            let response = router(Arc::clone(&calls))
                .oneshot(upgrade_request(uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_token_passes_middleware() {
        let response = router(Arc::new(AtomicUsize::new(0)))
            .oneshot(upgrade_request("/?token=s3cret"))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let response = router(Arc::new(AtomicUsize::new(0)))
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_handle_message_success() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        let response = handle_message(
            &registry,
            Duration::from_secs(1),
            r#"{"id":"req-1","type":"tool_request","timestamp":"2024-01-01T00:00:00Z","payload":{"tool":"ping","params":{}}}"#,
        )
        .await;
        assert_eq!(response.id, json!("req-1"));
        assert_eq!(response.kind, "tool_response");
        assert_eq!(response.payload["tool"], json!("ping"));
        assert_eq!(
            response.payload["result"],
            json!({"content": [{"type": "text", "text": "pong"}]})
        );
    }

    #[tokio::test]
    async fn test_handle_message_errors() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        let timeout = Duration::from_secs(1);

        let response = handle_message(&registry, timeout, "not json").await;
        assert_eq!(response.kind, "tool_error");
        assert_eq!(response.id, Value::Null);

        let response = handle_message(
            &registry,
            timeout,
            r#"{"id":7,"type":"tool_request","payload":{"tool":"missing"}}"#,
        )
        .await;
        assert_eq!(response.kind, "tool_error");
        assert_eq!(response.id, json!(7));
        assert!(response.payload["error"].as_str().unwrap().contains("unknown tool"));

        let response = handle_message(&registry, timeout, r#"{"id":8,"type":"subscribe"}"#).await;
        assert_eq!(response.kind, "tool_error");
    }

    /// Counts drops, so an aborted tool call is observable.
    struct Released(Arc<AtomicUsize>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hanging_registry(started: Arc<AtomicUsize>, released: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            ToolSpec {
                name: "hang",
                description: "Never finishes.",
                input_schema: crate::tools::empty_schema(),
            },
            move |_| {
                let started = Arc::clone(&started);
                let released = Arc::clone(&released);
                async move {
                    let _released = Released(released);
                    started.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                    Ok(ToolOutput::text("unreachable"))
                }
            },
        );
        registry
    }

    fn tool_request(id: u32, tool: &str) -> String {
        format!(r#"{{"id":{id},"type":"tool_request","payload":{{"tool":"{tool}","params":{{}}}}}}"#)
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_answers_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight = InFlight::new(
            Arc::new(counting_registry(Arc::clone(&calls))),
            settings(),
            tx,
            "conn-1",
        );

        in_flight.dispatch(tool_request(1, "ping"));
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["type"], json!("tool_response"));
        in_flight.reap().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_limit_and_abort_on_close() {
        let started = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let settings = ConnectionSettings {
            max_in_flight: 2,
            ..settings()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight = InFlight::new(
            Arc::new(hanging_registry(Arc::clone(&started), Arc::clone(&released))),
            settings,
            tx,
            "conn-2",
        );

        for id in 1..=3 {
            in_flight.dispatch(tool_request(id, "hang"));
        }

        // The third request is refused without running
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["id"], json!(3));
        assert_eq!(reply["type"], json!("tool_error"));
        assert!(reply["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("in flight"));

        while started.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(released.load(Ordering::SeqCst), 0);

        in_flight.shutdown().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }
}
