//! Relay WebSocket server — Axum-based HTTP + WS server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::protocol::InboundEvent;
use crate::registry::Admitted;
use crate::router::{RelayHandle, RelayHub, RelayOptions};

// Time given to the writer to flush a close frame after the reader stops;
// after that the writer is aborted and the socket dropped
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Shared state for all WebSocket connections
#[derive(Clone)]
pub struct RelayState {
    pub relay: RelayHandle,
    pub allowed_origins: Arc<Vec<String>>,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub start_time: Instant,
}

/// The relay server
pub struct RelayServer {
    state: RelayState,
    hub: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create the server and start its hub. Must be called inside a Tokio runtime.
    ///
    /// Cancelling `shutdown` stops accepting connections and closes every
    /// live one.
    pub fn new(options: RelayOptions, shutdown: CancellationToken) -> Self {
        let (relay, hub) = RelayHub::spawn(&options, shutdown.child_token());
        let state = RelayState {
            relay,
            allowed_origins: Arc::new(options.allowed_origins),
            heartbeat_interval: options.heartbeat_interval,
            idle_timeout: options.idle_timeout,
            start_time: Instant::now(),
        };
        Self {
            state,
            hub,
            shutdown,
        }
    }

    /// Handle for talking to the hub from outside the server
    pub fn relay(&self) -> &RelayHandle {
        &self.state.relay
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .layer(cors_layer(&self.state.allowed_origins))
            .with_state(self.state.clone())
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", addr))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let router = self.router();
        let local = listener.local_addr()?;
        info!("Relay listening on {}", local);

        let shutdown = self.shutdown.clone();
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

        // Stop the hub even if the listener failed on its own
        self.shutdown.cancel();
        if let Err(e) = self.hub.await {
            error!("Relay hub task failed: {}", e);
        }
        info!("Relay on {} stopped", local);

        result.context("Relay server error")
    }

    /// Serve in the background, returning a handle
    pub fn spawn(self, listener: TcpListener) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.serve(listener).await })
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allows_any_origin(allowed_origins) {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid allowed origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
}

fn allows_any_origin(allowed_origins: &[String]) -> bool {
    allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*")
}

// ── HTTP Handlers ──

async fn status_handler(State(state): State<RelayState>) -> Response {
    match state.relay.stats().await {
        Ok(stats) => axum::Json(serde_json::json!({
            "status": "ok",
            "connected_clients": stats.connections,
            "rooms": stats.rooms,
            "uptime_secs": state.start_time.elapsed().as_secs(),
        }))
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !check_origin(&state.allowed_origins, &headers) {
        warn!("Rejected WebSocket from {}: origin not allowed", addr);
        return StatusCode::FORBIDDEN.into_response();
    }

    let admitted = match state.relay.admit().await {
        Ok(admitted) => admitted,
        Err(e @ RelayError::TooManyConnections { .. }) => {
            warn!("Rejected WebSocket from {}: {}", addr, e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(e) => {
            error!("Cannot admit WebSocket from {}: {}", addr, e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let relay = state.relay.clone();
    let id = admitted.id;
    ws.on_failed_upgrade(move |e| {
        warn!("WebSocket upgrade for {} failed: {}", addr, e);
        relay.disconnect_detached(id);
    })
    .on_upgrade(move |socket| handle_ws(socket, state, admitted, addr))
}

async fn handle_ws(socket: WebSocket, state: RelayState, admitted: Admitted, addr: SocketAddr) {
    let Admitted {
        id,
        closed,
        mut outbound,
    } = admitted;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!("Connection {} from {}", id, addr);

    // Forward queued frames and heartbeats to this client
    let writer_closed = closed.clone();
    let heartbeat_interval = state.heartbeat_interval;
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_interval,
            heartbeat_interval,
        );
        loop {
            tokio::select! {
                _ = writer_closed.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if ws_sender.send(Message::Text((&*frame).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        // A dead writer means a dead connection
        writer_closed.cancel();
    });

    // Process incoming frames from this client
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => {
                debug!("Connection {} closed by relay", id);
                break;
            }
            next = tokio::time::timeout(state.idle_timeout, ws_receiver.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                info!("Connection {} idle for {:?}, closing", id, state.idle_timeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                debug!("Client {} sent close", id);
                break;
            }
            // Pings, pongs and binary frames only count as activity
            _ => continue,
        };

        match InboundEvent::parse(&text) {
            Ok(InboundEvent::Disconnect) => break,
            Ok(event) => {
                if state.relay.dispatch(id, event).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping frame from {}: {}", id, e),
        }
    }

    closed.cancel();
    state.relay.disconnect(id).await;
    // A peer that stopped reading can park the writer in `send` forever
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        debug!("Writer for {} did not finish in time, aborting", id);
        send_task.abort();
    }
    info!("Connection {} from {} disconnected", id, addr);
}

/// Browsers always send `Origin` on a WebSocket handshake; other clients may
/// omit it and are let through.
fn check_origin(allowed_origins: &[String], headers: &HeaderMap) -> bool {
    if allows_any_origin(allowed_origins) {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let origin = origin.trim_end_matches('/');
    allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("origin", origin.parse().unwrap());
        headers
    }

    #[test]
    fn test_check_origin_any() {
        assert!(check_origin(&[], &with_origin("http://evil.example")));
        assert!(check_origin(&origins(&["*"]), &with_origin("http://evil.example")));
    }

    #[test]
    fn test_check_origin_allowed() {
        let allowed = origins(&["http://localhost:4000"]);
        assert!(check_origin(&allowed, &with_origin("http://localhost:4000")));
        assert!(check_origin(&allowed, &with_origin("http://localhost:4000/")));
    }

    #[test]
    fn test_check_origin_rejected() {
        let allowed = origins(&["http://localhost:4000"]);
        assert!(!check_origin(&allowed, &with_origin("http://localhost:5000")));
    }

    #[test]
    fn test_check_origin_missing_header() {
        let allowed = origins(&["http://localhost:4000"]);
        assert!(check_origin(&allowed, &HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_status_handler() {
        let server = RelayServer::new(RelayOptions::default(), CancellationToken::new());
        let _a = server.relay().admit().await.unwrap();
        let response = status_handler(State(server.state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_handler_after_shutdown() {
        let shutdown = CancellationToken::new();
        let server = RelayServer::new(RelayOptions::default(), shutdown.clone());
        shutdown.cancel();
        let state = server.state.clone();
        server.hub.await.unwrap();
        let response = status_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
