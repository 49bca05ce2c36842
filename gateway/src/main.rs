mod admission;
mod backend_client;
mod broadcast;
mod config;
mod error;
mod forwarder;
mod handlers;
mod health;
mod presence;
mod session;
mod shutdown;
mod signing;
mod updates_subscriber;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protocol::messages::{InboundMessage, OutboundMessage, ProblemDetails};

use crate::admission::{extract_client_ip, origin_allowed, ConnectionLimiter, SessionRateLimiter};
use crate::backend_client::HttpBackendClient;
use crate::broadcast::BroadcastManager;
use crate::config::GatewayConfig;
use crate::forwarder::Forwarder;
use crate::handlers::HandlerContext;
use crate::health::HealthState;
use crate::presence::PresenceTracker;
use crate::session::{Session, SessionManager};
use crate::shutdown::DrainCoordinator;
use crate::signing::{derive_backend_session_id, KeyRegistry};
use crate::updates_subscriber::{apply_event, EventSink, EventWaiter};

/// Frames over this size are rejected pre-parse (spec §6 "Max frame: 64 KiB").
const MAX_FRAME_BYTES: usize = 64 * 1024;

struct AppState {
    config: GatewayConfig,
    backend: Arc<HttpBackendClient>,
    forwarder: Arc<Forwarder<HttpBackendClient>>,
    sessions: Arc<SessionManager>,
    keys: Arc<KeyRegistry>,
    broadcast: Arc<BroadcastManager>,
    presence: Arc<PresenceTracker>,
    waiter: Arc<EventWaiter>,
    connections: Arc<ConnectionLimiter>,
    rate_limiter: Arc<SessionRateLimiter>,
    drain: Arc<DrainCoordinator>,
}

/// Wires decoded backend events into session state and pending waiters.
/// Round-level events (`round_opened`/`locked`/`outcome`/`finalized`) carry
/// no session id and are logged only; per-game broadcast wiring needs a
/// round-to-game mapping the backend event stream does not yet provide.
struct GatewayEventSink {
    sessions: Arc<SessionManager>,
    waiter: Arc<EventWaiter>,
    presence: Arc<PresenceTracker>,
}

impl EventSink for GatewayEventSink {
    async fn handle_event(&self, event: protocol::wire::CasinoEvent) {
        apply_event(&event, &self.sessions, &self.waiter, &self.presence).await;
        if let protocol::wire::CasinoEvent::RoundOpened { round_id, .. }
        | protocol::wire::CasinoEvent::Locked { round_id, .. }
        | protocol::wire::CasinoEvent::Finalized { round_id, .. } = &event
        {
            tracing::debug!(round_id, "round-level event observed");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = config::GatewayConfig::from_env().unwrap_or_else(|err| {
        tracing::error!(%err, "configuration error");
        panic!("invalid configuration: {err}");
    });

    let bind_addr = config.bind_addr.clone();
    let backend = Arc::new(HttpBackendClient::new(config.backend_url.clone(), Duration::from_secs(10)));
    let forwarder = Arc::new(Forwarder::new(
        backend.clone(),
        config.idempotency_ttl,
        config.forwarder_max_retries,
    ));
    let sessions = Arc::new(SessionManager::new());
    let keys = Arc::new(KeyRegistry::new());
    let broadcast = Arc::new(BroadcastManager::new());
    let presence = Arc::new(PresenceTracker::new());
    let waiter = Arc::new(EventWaiter::new());
    let connections = Arc::new(ConnectionLimiter::new(
        config.max_connections_per_ip,
        config.max_total_sessions,
    ));
    let rate_limiter = Arc::new(SessionRateLimiter::new(
        config.session_rate_limit_points,
        Duration::from_secs(10),
        Duration::from_secs(30),
    ));
    let drain = Arc::new(DrainCoordinator::new());

    let state = Arc::new(AppState {
        config: config.clone(),
        backend: backend.clone(),
        forwarder: forwarder.clone(),
        sessions: sessions.clone(),
        keys: keys.clone(),
        broadcast: broadcast.clone(),
        presence: presence.clone(),
        waiter: waiter.clone(),
        connections,
        rate_limiter,
        drain: drain.clone(),
    });

    let health_state = Arc::new(HealthState {
        config: config.clone(),
        backend: backend.clone(),
        forwarder: forwarder.clone(),
        sessions: sessions.clone(),
        presence: presence.clone(),
        drain: drain.clone(),
    });

    spawn_background_tasks(state.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sink = Arc::new(GatewayEventSink {
        sessions: sessions.clone(),
        waiter: waiter.clone(),
        presence: presence.clone(),
    });
    let stream_url = format!("{}/updates", config.backend_url.trim_end_matches('/'));
    tokio::spawn(updates_subscriber::run_subscriber(
        reqwest::Client::new(),
        stream_url,
        sink,
        shutdown_rx,
    ));

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state.clone())
        .merge(
            Router::new()
                .route("/livez", get(health::livez))
                .route("/healthz", get(health::healthz::<HttpBackendClient>))
                .route("/readyz", get(health::readyz::<HttpBackendClient>))
                .route("/metrics", get(health::metrics::<HttpBackendClient>))
                .with_state(health_state),
        )
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    tracing::info!(%bind_addr, "gateway listening");

    let drain_timeout = config.drain_timeout;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone(), drain_timeout, shutdown_tx))
    .await
    .unwrap();
}

/// Waits for Ctrl+C, then begins the drain (spec §4.9 C11): new connections
/// get refused (`DrainCoordinator::is_draining`) while sessions still mid-game
/// are given up to `drain_timeout` before axum's graceful shutdown proceeds.
/// The updates-subscriber shutdown signal fires immediately, before the
/// drain poll loop runs, so in-flight connections and the subscriber learn
/// about the shutdown as soon as it starts rather than after axum's own
/// graceful-shutdown future has already resolved.
async fn shutdown_signal(
    state: Arc<AppState>,
    drain_timeout: Duration,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    let remaining = shutdown::run_drain(
        state.drain.clone(),
        state.sessions.clone(),
        state.presence.clone(),
        Duration::from_millis(200),
        drain_timeout,
    )
    .await;
    if !remaining.is_empty() {
        tracing::warn!(count = remaining.len(), "sessions still connected at drain deadline, force-closing");
    }
}

fn spawn_background_tasks(state: Arc<AppState>) {
    let flush_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            flush_state.broadcast.flush().await;
        }
    });

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_state.forwarder.sweep_expired().await;
        }
    });

    let presence_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let msg = presence_state.presence.presence_message().await;
            presence_state.broadcast.publish_to_topic("presence", msg).await;
        }
    });

    let idle_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let idle = idle_state.sessions.sweep_idle(idle_state.config.idle_session_ttl).await;
            for session in idle {
                idle_state.drain.mark_for_close(&session.id).await;
            }
        }
    });
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if state.drain.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }

    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.config.allowed_origins, state.config.allow_no_origin) {
        let code = if origin.is_none() {
            protocol::ErrorCode::CorsOriginRequired
        } else {
            protocol::ErrorCode::CorsOriginNotAllowed
        };
        let problem = ProblemDetails::new(403, code, "origin not permitted");
        return (StatusCode::FORBIDDEN, axum::Json(problem)).into_response();
    }

    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let client_ip: IpAddr = extract_client_ip(
        peer_addr.ip(),
        forwarded_for,
        real_ip,
        &state.config.trusted_proxy_cidrs,
    );

    if let Err(err) = state.connections.try_register(client_ip).await {
        let problem = ProblemDetails::new(429, err.code(), err.to_string());
        return (StatusCode::TOO_MANY_REQUESTS, axum::Json(problem)).into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, client_ip))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_ip: IpAddr) {
    let (mut sender, mut receiver) = socket.split();

    let signing_key = signing::generate_keypair();
    let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
    let session = Arc::new(Session::new(public_key_hex.clone(), client_ip.to_string()));
    state.keys.create_with_key(&session.id, signing_key).await;
    state.sessions.insert(session.clone()).await;
    state
        .sessions
        .bind_backend_id(&session.id, derive_backend_session_id(&public_key_hex))
        .await;
    state.presence.add(&session.id).await;

    let mut outbound_rx = state.broadcast.register_socket(&session.id).await;
    state
        .broadcast
        .subscribe(&session.id, &["presence".to_string()])
        .await;
    let presence_update = state.presence.presence_message().await;
    state.broadcast.publish_to_topic("presence", presence_update).await;

    let ctx = HandlerContext {
        keys: state.keys.clone(),
        backend: state.backend.clone(),
        forwarder: state.forwarder.clone(),
        broadcast: state.broadcast.clone(),
        presence: state.presence.clone(),
        waiter: state.waiter.clone(),
        event_timeout: state.config.event_timeout,
    };

    let ready = OutboundMessage::SessionReady {
        session_id: session.id.clone(),
        public_key: public_key_hex,
    };
    if send_json(&mut sender, &ready).await.is_err() {
        cleanup_session(&state, &session, client_ip).await;
        return;
    }
    let _ = send_json(&mut sender, &state.presence.clock_sync_message()).await;
    let _ = send_json(&mut sender, &state.presence.presence_message()).await;

    let mut drain_check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = drain_check.tick() => {
                if state.drain.should_close(&session.id).await {
                    let err = OutboundMessage::error(
                        protocol::ErrorCode::SessionExpired,
                        "gateway is shutting down",
                    );
                    let _ = send_json(&mut sender, &err).await;
                    break;
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if send_json(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            let err = OutboundMessage::error(protocol::ErrorCode::InvalidMessage, "frame too large");
                            let _ = send_json(&mut sender, &err).await;
                            continue;
                        }
                        let reply = match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(InboundMessage::Ping) => OutboundMessage::Pong,
                            Ok(parsed) => match state.rate_limiter.check(&session.id).await {
                                Err(err) => err.to_outbound(),
                                Ok(()) => handlers::dispatch(&ctx, &session, parsed).await,
                            },
                            Err(_) => OutboundMessage::error(protocol::ErrorCode::InvalidMessage, "malformed message"),
                        };
                        if send_json(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if bytes.len() > MAX_FRAME_BYTES {
                            break;
                        }
                        let err = OutboundMessage::error(protocol::ErrorCode::InvalidMessage, "binary frames are not supported");
                        if send_json(&mut sender, &err).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: shutdown::CLOSE_CODE_GOING_AWAY,
            reason: "closing".into(),
        })))
        .await;
    cleanup_session(&state, &session, client_ip).await;
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &OutboundMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
    sender.send(Message::Text(text.into())).await
}

/// Every cleanup path flows session → broadcast → presence → rate limiter →
/// forwarder → keys → connection limiter, so a closed session leaves no
/// trace in any index (spec §8 invariant 4).
async fn cleanup_session(state: &Arc<AppState>, session: &Arc<Session>, client_ip: IpAddr) {
    state.broadcast.unsubscribe_all(&session.id).await;
    state.presence.remove(&session.id).await;
    let msg = state.presence.presence_message().await;
    state.broadcast.publish_to_topic("presence", msg).await;
    state.rate_limiter.remove(&session.id).await;
    state.forwarder.remove_session(&session.id).await;
    state.keys.remove(&session.id).await;
    state.sessions.remove(&session.id).await;
    state.connections.unregister(client_ip).await;
    state.drain.clear_close(&session.id).await;
}
