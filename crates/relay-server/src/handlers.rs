//! Connection handlers for the Relay server.
//!
//! This module handles the session lifecycle: authentication before the
//! WebSocket upgrade, translating client frames into router commands, and
//! writing router output back to the socket.

use crate::auth::extract_bearer_token;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use relay_protocol::codec::{self, EncodedFrame};
use relay_protocol::{error_codes, ClientFrame, Encoding, ProtocolError, ServerFrame};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tenvis_relay_core::{
    Authenticator, Principal, RouterError, RouterHandle, SessionId, SessionOutbox,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the router actor.
    pub router: RouterHandle,
    /// Session authenticator.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
    /// Sessions currently holding a slot.
    active_sessions: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, router: RouterHandle, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            router,
            authenticator,
            config,
            active_sessions: AtomicUsize::new(0),
        }
    }

    /// Number of sessions currently connected.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

/// A connection slot, released on drop.
pub struct SessionPermit {
    state: Arc<AppState>,
}

impl SessionPermit {
    /// Take a slot if the connection limit allows it.
    #[must_use]
    pub fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let limit = state.config.limits.max_connections;
        state
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                state: state.clone(),
            })
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.state.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Session token, as an alternative to the `Authorization` header.
    pub token: Option<String>,
    /// Outbound encoding, `json` (default) or `msgpack`.
    pub format: Option<String>,
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C, then stop the router.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, closing upstream links");
    state.router.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.router.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": state.active_sessions(),
            "router": stats,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
            .into_response(),
    }
}

/// A refused upgrade request.
#[derive(Debug)]
pub struct Rejection {
    status: StatusCode,
    reason: &'static str,
    message: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

/// Authenticate an upgrade request and pick its outbound encoding.
///
/// # Errors
///
/// Returns a 401 rejection for a missing or invalid token and a 400 rejection
/// for an unknown encoding.
pub async fn authorize(
    state: &AppState,
    params: &ConnectParams,
    headers: &HeaderMap,
) -> Result<(Principal, Encoding), Rejection> {
    let credential = params
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(extract_bearer_token)
        });

    let Some(credential) = credential else {
        return Err(Rejection {
            status: StatusCode::UNAUTHORIZED,
            reason: "missing_token",
            message: "Token is required".to_string(),
        });
    };

    let principal = state
        .authenticator
        .authenticate(credential)
        .await
        .map_err(|e| Rejection {
            status: StatusCode::UNAUTHORIZED,
            reason: "invalid_token",
            message: e.to_string(),
        })?;

    let encoding = params
        .format
        .as_deref()
        .map(str::parse::<Encoding>)
        .transpose()
        .map_err(|e| Rejection {
            status: StatusCode::BAD_REQUEST,
            reason: "bad_format",
            message: e.to_string(),
        })?
        .unwrap_or_default();

    Ok((principal, encoding))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let (principal, encoding) = match authorize(&state, &params, &headers).await {
        Ok(accepted) => accepted,
        Err(rejection) => {
            debug!(reason = rejection.reason, "Refusing WebSocket upgrade");
            metrics::record_rejection(rejection.reason);
            return rejection.into_response();
        }
    };

    let Some(permit) = SessionPermit::acquire(&state) else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_rejection("connection_limit");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "Connection limit reached" })),
        )
            .into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, principal, encoding, permit))
}

/// Handle a WebSocket session.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    principal: Principal,
    encoding: Encoding,
    _permit: SessionPermit,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session_id = SessionId::generate();
    debug!(session = %session_id, subject = %principal.subject, ?encoding, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Send Connected frame
    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = ServerFrame::connected(session_id.as_str(), heartbeat);
    if let Err(e) = send_frame(&mut sender, &connected, encoding).await {
        error!(session = %session_id, error = %e, "Failed to send Connected frame");
        return;
    }

    let (outbox, mut outbound) = SessionOutbox::channel(state.config.limits.session_queue_capacity);
    if let Err(e) = state
        .router
        .connect(session_id.clone(), principal, outbox.clone())
        .await
    {
        warn!(session = %session_id, error = %e, "Router unavailable");
        let _ = send_frame(&mut sender, &e.to_frame(), encoding).await;
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_buffered = state.config.limits.max_message_size;

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Frames from the router and local replies
            Some(frame) = outbound.recv() => {
                if let Err(e) = send_frame(&mut sender, &frame, encoding).await {
                    debug!(session = %session_id, error = %e, "Send failed");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let frames = match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        vec![codec::from_json::<ClientFrame>(&text)]
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        drain_binary_frames(&mut read_buffer, max_buffered)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                };

                let start = Instant::now();
                let mut router_gone = false;
                for frame in frames {
                    let result = match frame {
                        Ok(frame) => dispatch_frame(frame, &session_id, &state.router, &outbox).await,
                        Err(e) => {
                            reject_frame(&session_id, &outbox, &e);
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        error!(session = %session_id, error = %e, "Frame handling error");
                        router_gone = true;
                        break;
                    }
                }
                metrics::record_latency(start.elapsed().as_secs_f64());

                if router_gone {
                    break;
                }
            }
        }
    }

    // Stop reading before leaving the router.
    drop(receiver);
    if let Err(e) = state.router.disconnect(session_id.clone()).await {
        debug!(session = %session_id, error = %e, "Router already stopped");
    }

    debug!(session = %session_id, "WebSocket disconnected");
}

/// Decode every complete binary frame in the buffer.
fn drain_binary_frames(
    buf: &mut BytesMut,
    max_buffered: usize,
) -> Vec<Result<ClientFrame, ProtocolError>> {
    let mut frames = Vec::new();
    loop {
        match codec::decode_from::<ClientFrame>(buf) {
            Ok(Some(frame)) => frames.push(Ok(frame)),
            Ok(None) => {
                if buf.len() > max_buffered {
                    frames.push(Err(ProtocolError::FrameTooLarge(buf.len())));
                    buf.clear();
                }
                break;
            }
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                frames.push(Err(e));
                buf.clear();
                break;
            }
            // The payload was consumed; keep going with the next frame.
            Err(e) => frames.push(Err(e)),
        }
    }
    frames
}

/// Report an undecodable client frame.
fn reject_frame(session: &SessionId, outbox: &SessionOutbox, error: &ProtocolError) {
    debug!(session = %session, error = %error, "Invalid client frame");
    metrics::record_error("decode");
    let frame = ServerFrame::error(error_codes::INVALID_FRAME, error.to_string());
    if outbox.deliver(Arc::new(frame)).is_err() {
        debug!(session = %session, "Dropping error reply");
    }
}

/// Handle a decoded client frame.
///
/// Rejections are reported to the client by the router; only a stopped
/// router is an error here.
///
/// # Errors
///
/// Returns [`RouterError::Closed`] if the router has stopped.
pub async fn dispatch_frame(
    frame: ClientFrame,
    session: &SessionId,
    router: &RouterHandle,
    outbox: &SessionOutbox,
) -> Result<(), RouterError> {
    let result = match frame {
        ClientFrame::Subscribe { instrument } => {
            debug!(session = %session, instrument = %instrument, "Subscribe request");
            let result = router.subscribe(session.clone(), instrument).await;
            if result.is_ok() {
                metrics::record_subscription();
            }
            result
        }

        ClientFrame::Unsubscribe { instrument } => {
            debug!(session = %session, instrument = %instrument, "Unsubscribe request");
            router.unsubscribe(session.clone(), instrument).await
        }

        ClientFrame::Ping { timestamp } => {
            if outbox.deliver(Arc::new(ServerFrame::pong(timestamp))).is_err() {
                debug!(session = %session, "Dropping pong");
            }
            Ok(())
        }
    };

    match result {
        Err(RouterError::Closed) => Err(RouterError::Closed),
        Err(e) => {
            debug!(session = %session, error = %e, "Request rejected");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Encode a frame for the session's transport.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_message(frame: &ServerFrame, encoding: Encoding) -> Result<Message, ProtocolError> {
    Ok(match codec::encode_as(frame, encoding)? {
        EncodedFrame::Text(text) => Message::Text(text),
        EncodedFrame::Binary(data) => Message::Binary(data.to_vec()),
    })
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    encoding: Encoding,
) -> Result<()> {
    let message = match encode_message(frame, encoding) {
        Ok(message) => message,
        Err(e) => {
            // One bad frame does not end the session.
            warn!(frame = frame.name(), error = %e, "Failed to encode frame");
            metrics::record_error("encode");
            return Ok(());
        }
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtAuthenticator;
    use crate::config::AuthConfig;
    use axum::http::HeaderValue;
    use relay_transport::{MemoryAcceptor, MemoryConnector};
    use std::time::Duration;
    use tenvis_relay_core::{NoopArchive, Router as RelayRouter, RouterConfig};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

    const SECRET: &str = "handler-test-secret";
    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(max_connections: usize) -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.to_string();
        config.limits.max_connections = max_connections;
        config.metrics.enabled = false;
        config
    }

    fn jwt() -> JwtAuthenticator {
        JwtAuthenticator::new(&AuthConfig {
            jwt_secret: SECRET.to_string(),
            token_ttl_secs: 60,
        })
    }

    fn test_state(max_connections: usize) -> (Arc<AppState>, MemoryAcceptor) {
        let (connector, acceptor) = MemoryConnector::new();
        let (router, handle) = RelayRouter::new(
            RouterConfig::default(),
            Arc::new(connector),
            Arc::new(NoopArchive),
        );
        router.spawn();
        let state = AppState::new(test_config(max_connections), handle, Arc::new(jwt()));
        (Arc::new(state), acceptor)
    }

    #[tokio::test]
    async fn test_authorize_requires_token() {
        let (state, _acceptor) = test_state(10);

        let rejection = authorize(&state, &ConnectParams::default(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
        assert_eq!(rejection.reason, "missing_token");

        let params = ConnectParams {
            token: Some("garbage".to_string()),
            format: None,
        };
        let rejection = authorize(&state, &params, &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
        assert_eq!(rejection.reason, "invalid_token");
    }

    #[tokio::test]
    async fn test_authorize_accepts_query_or_header() {
        let (state, _acceptor) = test_state(10);
        let token = jwt().issue("42", Some("alice")).unwrap();

        let params = ConnectParams {
            token: Some(token.clone()),
            format: Some("msgpack".to_string()),
        };
        let (principal, encoding) = authorize(&state, &params, &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(principal.subject, "42");
        assert_eq!(encoding, Encoding::Msgpack);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let (principal, encoding) = authorize(&state, &ConnectParams::default(), &headers)
            .await
            .unwrap();
        assert_eq!(principal.name.as_deref(), Some("alice"));
        assert_eq!(encoding, Encoding::Json);

        let params = ConnectParams {
            token: Some(token),
            format: Some("xml".to_string()),
        };
        let rejection = authorize(&state, &params, &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_permits_respect_limit() {
        let (state, _acceptor) = test_state(2);

        let first = SessionPermit::acquire(&state).unwrap();
        let _second = SessionPermit::acquire(&state).unwrap();
        assert!(SessionPermit::acquire(&state).is_none());
        assert_eq!(state.active_sessions(), 2);

        drop(first);
        assert!(SessionPermit::acquire(&state).is_some());
    }

    #[tokio::test]
    async fn test_dispatch_frames() {
        let (state, _acceptor) = test_state(10);
        let session = SessionId::new("s1");
        let (outbox, mut rx) = SessionOutbox::channel(16);
        state
            .router
            .connect(session.clone(), Principal::new("u"), outbox.clone())
            .await
            .unwrap();

        let frames = [
            ClientFrame::Ping {
                timestamp: Some(7),
            },
            ClientFrame::subscribe("BTC-USD"),
            ClientFrame::subscribe("not valid"),
            ClientFrame::unsubscribe("BTC-USD"),
        ];
        for frame in frames {
            dispatch_frame(frame, &session, &state.router, &outbox)
                .await
                .unwrap();
        }

        let mut names = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            names.push(frame.name());
        }
        assert_eq!(names, vec!["pong", "subscribed", "error", "unsubscribed"]);

        state.router.shutdown().await;
        let result =
            dispatch_frame(ClientFrame::subscribe("X"), &session, &state.router, &outbox).await;
        assert!(matches!(result, Err(RouterError::Closed)));
    }

    #[test]
    fn test_drain_binary_frames() {
        let mut buf = BytesMut::new();
        codec::encode_into(&ClientFrame::subscribe("BTC-USD"), &mut buf).unwrap();
        codec::encode_into(&ClientFrame::Ping { timestamp: None }, &mut buf).unwrap();
        let partial = codec::encode(&ClientFrame::unsubscribe("BTC-USD")).unwrap();
        buf.extend_from_slice(&partial[..3]);

        let frames = drain_binary_frames(&mut buf, 1024);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &ClientFrame::subscribe("BTC-USD")
        );
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&partial[3..]);
        let frames = drain_binary_frames(&mut buf, 1024);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &ClientFrame::unsubscribe("BTC-USD")
        );
        assert!(buf.is_empty());

        buf.extend_from_slice(&[0, 0, 0, 200]);
        let frames = drain_binary_frames(&mut buf, 16);
        assert!(matches!(frames[0], Err(ProtocolError::FrameTooLarge(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_message_per_encoding() {
        let frame = ServerFrame::subscribed("BTC-USD");

        match encode_message(&frame, Encoding::Json).unwrap() {
            Message::Text(text) => {
                assert_eq!(text, r#"{"type":"subscribed","instrument":"BTC-USD"}"#)
            }
            other => panic!("Expected text, got {:?}", other),
        }
        match encode_message(&frame, Encoding::Msgpack).unwrap() {
            Message::Binary(data) => {
                let decoded: ServerFrame = codec::decode(&data).unwrap();
                assert_eq!(decoded, frame);
            }
            other => panic!("Expected binary, got {:?}", other),
        }
    }

    async fn serve(state: Arc<AppState>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("Unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let (state, mut acceptor) = test_state(10);
        let addr = serve(state.clone()).await;
        let token = jwt().issue("42", None).unwrap();

        let url = format!("ws://{addr}/ws?token={token}");
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let connected = next_json(&mut ws).await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["version"], 1);

        ws.send(WsMessage::Text(
            r#"{"type":"subscribe","product_id":"BTC-USD"}"#.to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "subscribed");

        let mut feed = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
        feed.next_request().await.unwrap();
        timeout(WAIT, async {
            while state.router.link_state("BTC-USD").await.unwrap()
                != Some(tenvis_relay_core::LinkState::Open)
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        feed.push(r#"{"type":"match","product_id":"BTC-USD","price":"42000.00"}"#);
        let data = next_json(&mut ws).await;
        assert_eq!(data["type"], "data");
        assert_eq!(data["instrument"], "BTC-USD");
        assert_eq!(data["kind"], "trade");
        assert_eq!(data["payload"]["price"], "42000.00");

        ws.send(WsMessage::Text("not json".to_string())).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], error_codes::INVALID_FRAME);

        ws.close(None).await.unwrap();
        timeout(WAIT, feed.closed()).await.unwrap();
        timeout(WAIT, async {
            while state.active_sessions() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_without_token_is_refused() {
        let (state, _acceptor) = test_state(10);
        let addr = serve(state).await;

        let url = format!("ws://{addr}/ws");
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("Expected HTTP 401, got {:?}", other.map(|_| ())),
        }
    }
}
