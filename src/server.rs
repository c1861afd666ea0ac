//! WebSocket transport
//!
//! Each upgraded socket is one duplex connection handed to the Connection
//! Gate. Authorization is decided on the HTTP handshake, so a refused client
//! never gets a socket and nothing is spawned for it.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::future::{ready, Future};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::config::{AuthConfig, Config};
use crate::error::BridgeError;
use crate::gate::ConnectionGate;
use crate::session::Session;

/// Close frame reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 120;

/// Extra time granted to sessions after their kill grace during shutdown
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ConnectionGate>,
    pub auth: Arc<AuthConfig>,
}

pub fn router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.gate.registry();
    Json(json!({
        "status": "ok",
        "activeSessions": registry.len(),
        "maxSessions": registry.max_sessions(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    uri: Uri,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let query = Query::<HashMap<String, String>>::try_from_uri(&uri)
        .map(|Query(params)| params)
        .unwrap_or_default();
    let credential = extract_credential(&headers, &query, &state.auth);

    let principal = match state.gate.authorize(credential.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!("Refusing connection from {}: {}", addr, e);
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": "Missing or invalid credential"
                })),
            )
                .into_response();
        }
    };

    debug!("Upgrading connection from {} for {}", addr, principal);
    let gate = state.gate.clone();
    ws.on_upgrade(move |socket| async move {
        match gate.open_session(principal).await {
            Ok(session) => serve_socket(socket, session, addr).await,
            Err(e) => reject_socket(socket, e).await,
        }
    })
}

async fn serve_socket(socket: WebSocket, session: Session, addr: SocketAddr) {
    let id = session.id();
    info!("Client {} attached to session {}", addr, id);

    let (sink, stream) = socket.split();
    let sink = sink.with(|data: Bytes| ready(Ok::<_, axum::Error>(Message::Binary(data))));
    let source = stream
        .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let termination = session.run(Box::pin(sink), Box::pin(source)).await;
    info!("Client {} detached from session {}: {}", addr, id, termination);
}

async fn reject_socket(mut socket: WebSocket, error: BridgeError) {
    let mut reason = error.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    let frame = CloseFrame {
        code: error.close_code(),
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// Pull the raw credential out of a handshake request.
///
/// Checked in order: `Authorization: Bearer`, the configured cookie, then the
/// configured query parameter. The value is not interpreted here.
pub fn extract_credential(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    auth: &AuthConfig,
) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == auth.cookie_name)
        .map(|(_, value)| value.to_string());
    if cookie.is_some() {
        return cookie;
    }

    auth.query_param
        .as_ref()
        .and_then(|param| query.get(param))
        .cloned()
}

/// Serve until `shutdown` resolves, then tear down every live session
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    gate: Arc<ConnectionGate>,
    config: &Config,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = gate.registry().clone();
    let state = AppState {
        gate,
        auth: Arc::new(config.auth.clone()),
    };
    let app = router(state, &config.server.ws_path);

    let signal_registry = registry.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        let count = signal_registry.shutdown_all();
        info!("Shutting down, closing {} live session(s)", count);
    })
    .await?;

    let deadline = tokio::time::Instant::now() + config.limits.kill_grace() + SHUTDOWN_SLACK;
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !registry.is_empty() {
        warn!("{} session(s) still open at exit", registry.len());
    }
    Ok(())
}
