//! HTTP/WebSocket surface: spec §1, §6.1 entry point. One route upgrades the
//! browser's WebSocket into a `session::run` call; `/version` and `/stats`
//! mirror the teacher's admin endpoints. Grounded in `server/src/server.rs`
//! (Router assembly, `axum::serve` + graceful shutdown via a broadcast
//! channel, periodic stats logger) and `server/src/web.rs` (the
//! `ws_*_handler` → `on_upgrade` shape).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use axum_client_ip::ClientIp;
use log::{info, warn};
use serde_json::json;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::env::{self, Env};
use crate::registry::Registry;
use crate::session;
use crate::ssh::DialerConfig;
use crate::stats::Collector;
use crate::store::PostgresStore;
use crate::vault::Vault;

#[derive(Clone)]
struct AppState {
    env: Arc<Env>,
    vault: Arc<Vault>,
    dialer_cfg: Arc<DialerConfig>,
    registry: Arc<Registry>,
    store: Option<Arc<PostgresStore>>,
}

pub async fn start(
    env: Env,
    vault: Vault,
    dialer_cfg: DialerConfig,
    store: Option<PostgresStore>,
) -> anyhow::Result<()> {
    info!("starting sessiongate in {:?} mode", env.mode);

    let registry = Arc::new(Registry::new(env.max_sessions));
    let state = AppState {
        env: Arc::new(env),
        vault: Arc::new(vault),
        dialer_cfg: Arc::new(dialer_cfg),
        registry,
        store: store.map(Arc::new),
    };

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let http_task = start_http_server(state, shutdown_tx.subscribe());
    let stats_task = spawn_stats_logger(Duration::from_secs(30), shutdown_tx.subscribe());

    let shutdown_signal = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {err}");
        } else {
            info!("ctrl+c pressed, shutting down");
        }
    };

    tokio::select! {
        _ = http_task => warn!("http task ended"),
        _ = stats_task => warn!("stats logger task ended"),
        _ = shutdown_signal => info!("shutdown signal received"),
    }

    let _ = shutdown_tx.send(());
    Ok(())
}

fn start_http_server(state: AppState, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
    let listen_addr = state.env.listen_addr.clone();

    tokio::spawn(async move {
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/version", get(get_version))
            .route("/stats", get(get_stats))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("failed to bind {listen_addr}: {e}");
                return;
            }
        };
        info!("listening on: {}", listener.local_addr().map(|a| a.to_string()).unwrap_or(listen_addr));

        let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });

        if let Err(e) = serve.await {
            warn!("http server exited: {e}");
        }
    })
}

fn spawn_stats_logger(period: Duration, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut collector = Collector::new();
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match collector.gather() {
                        Some(sample) => info!("gateway stats: {}", serde_json::to_string(&sample).unwrap_or_default()),
                        None => warn!("stats: unable to read host metrics"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("stats logger shutting down");
                    break;
                }
            }
        }
    })
}

async fn ws_handler(State(state): State<AppState>, ClientIp(ip): ClientIp, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        info!("websocket upgrade from {ip}");
        session::run(socket, state.env, state.vault, state.dialer_cfg, state.registry, state.store).await;
    })
}

async fn get_version() -> impl IntoResponse {
    Json(json!({ "version": env::version() }))
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let body = match Collector::new().gather() {
        Some(sample) => json!({
            "stats": sample,
            "sessions": state.registry.count(),
        }),
        None => json!({ "sessions": state.registry.count() }),
    };
    Json(body)
}
