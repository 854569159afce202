//! Relay HTTP + WebSocket server (single port).

use crate::bridge::DeviceBridge;
use crate::config::{self, Config};
use crate::gateway::protocol::{ConnectQuery, ServerMessage};
use crate::gateway::session::{device_address, SessionGateway};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Interval, MissedTickBehavior};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};

/// Shared state for the relay (config, the device bridge, uptime, shutdown fan-out).
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    /// The one device bridge every session shares.
    pub bridge: Arc<DeviceBridge>,
    pub started_at: Instant,
    /// Port actually bound (differs from config when binding port 0).
    pub port: u16,
    /// Fires once on shutdown; every session closes its socket when it does.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Run the relay; binds to config.relay.bind:config.relay.port.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_relay(config: Config) -> Result<()> {
    let bind = config.relay.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "relay bound to non-loopback address {}; sessions are unauthenticated and anyone who can reach it can drive the device",
            bind
        );
    }
    let bind_addr = format!("{}:{}", bind, config.relay.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    serve(listener, config, shutdown_signal()).await
}

/// Serve the relay on an already bound listener until `shutdown` completes.
/// On shutdown, sessions get a close frame and the device connection is torn down.
pub async fn serve<F>(listener: TcpListener, config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener
        .local_addr()
        .context("reading listener address")?
        .port();
    let (shutdown_tx, _) = broadcast::channel(1);
    let bridge = DeviceBridge::new(config.device.clone());
    let state = RelayState {
        config: Arc::new(config),
        bridge: bridge.clone(),
        started_at: Instant::now(),
        port,
        shutdown_tx: shutdown_tx.clone(),
    };

    let app = router(state);
    log::info!("relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, closing sessions");
            let _ = shutdown_tx.send(());
            bridge.teardown().await;
        })
        .await
        .context("relay server exited")?;
    log::info!("relay stopped");
    Ok(())
}

/// Routes plus cross-origin access (browser dashboards read `/status`) and a
/// log line per HTTP request.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(root))
        .route("/status", get(status_http))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET / and /ws: WebSocket sessions (`?ip=..&port=..`); a plain GET gets health JSON.
async fn root(
    State(state): State<RelayState>,
    Query(query): Query<ConnectQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, query)),
        None => Json(json!({
            "runtime": "running",
            "port": state.port,
        }))
        .into_response(),
    }
}

/// GET /status: uptime, device connectivity, live sessions.
async fn status_http(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let secs = state.started_at.elapsed().as_secs();
    Json(json!({
        "uptime": format_uptime(secs),
        "uptimeSecs": secs,
        "deviceConnected": state.bridge.is_connected().await,
        "clientsConnected": state.bridge.session_count().await,
    }))
}

fn format_uptime(secs: u64) -> String {
    format!("{}m {}s", secs / 60, secs % 60)
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    socket.send(Message::Text(msg.to_json())).await
}

/// Next keepalive tick; never completes when keepalive is off.
async fn keepalive_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn handle_socket(mut socket: WebSocket, state: RelayState, query: ConnectQuery) {
    let address = match device_address(&query) {
        Ok(a) => a,
        Err(e) => {
            log::warn!("rejecting session: {}", e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (session, mut events) = SessionGateway::open(state.bridge.clone(), address.clone()).await;
    log::info!(
        "session {} opened for device {} ({} live)",
        session.id(),
        address,
        state.bridge.session_count().await
    );

    let mut keepalive = match state.config.session.keepalive_interval() {
        Some(period) => {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            Some(interval)
        }
        None => None,
    };

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "relay shutting down".into(),
                    })))
                    .await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_json(&mut socket, &SessionGateway::event_message(event)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = session.handle_text(&text).await {
                            if send_json(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = keepalive_tick(&mut keepalive) => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let id = session.id().to_string();
    let remaining = session.close().await;
    log::info!("session {} closed ({} remaining)", id, remaining);
}
