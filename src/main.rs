//! Glade Social Coordination Server
//!
//! A lightweight WebSocket server that arbitrates social state between
//! connected game clients:
//!
//! 1. **Friend invitations**: a two-party negotiation (availability query,
//!    then accept/decline) coordinated entirely server-side, with recent
//!    declines remembered so a rejected inviter cannot immediately ask again.
//!
//! 2. **Secret friend codes**: a short code issued to one avatar and typed
//!    in by another resolves into the same friendship commit, throttled by
//!    a fixed submission delay to make guessing slow.
//!
//! 3. **Friends-list assembly**: a chained sequence of store lookups and
//!    presence checks that answers with one complete list plus online
//!    notices, or nothing at all.

mod handler;
mod invites;
mod operations;
mod presence;
mod protocol;
mod state;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{SocialConfig, SocialState};
use store::{AvatarRecord, MemoryStore};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "glade-social", version, about = "Glade social coordination server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "SOCIAL_PORT")]
    port: u16,

    /// Decline-memory rotation interval in seconds. A remembered decline
    /// survives one to two intervals.
    #[arg(long, default_value_t = 600, env = "DECLINE_TIMEOUT_SECS")]
    decline_timeout_secs: u64,

    /// Delay before a submitted secret reaches the store, in milliseconds
    #[arg(long, default_value_t = 1000, env = "SECRET_DELAY_MS")]
    secret_delay_ms: u64,

    /// Maximum friends per avatar enforced by the in-memory store
    #[arg(long, default_value_t = 50, env = "MAX_FRIENDS")]
    max_friends: usize,

    /// Maximum outstanding secrets per avatar
    #[arg(long, default_value_t = 3, env = "MAX_SECRETS_PER_AVATAR")]
    max_secrets_per_avatar: usize,

    /// JSON file of avatar records to seed the in-memory store with
    #[arg(long, env = "ROSTER_PATH")]
    roster: Option<PathBuf>,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glade_social=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = SocialConfig {
        port: args.port,
        decline_timeout_secs: args.decline_timeout_secs,
        secret_delay_ms: args.secret_delay_ms,
        max_friends: args.max_friends,
        max_secrets_per_avatar: args.max_secrets_per_avatar,
    };

    let store = Arc::new(MemoryStore::new(
        config.max_friends,
        config.max_secrets_per_avatar,
    ));

    if let Some(path) = &args.roster {
        let data = std::fs::read_to_string(path).expect("Failed to read roster file");
        let records: Vec<AvatarRecord> =
            serde_json::from_str(&data).expect("Invalid roster file");
        tracing::info!(count = records.len(), path = %path.display(), "Seeding roster");
        for record in records {
            store.insert_avatar(record);
        }
    }

    let state = SocialState::new(config, store);

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/info", get(info_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Glade social server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SocialState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "glade-social",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<SocialState>) -> impl IntoResponse {
    Json(json!({
        "online_sessions": state.sessions.online_count(),
        "active_invites": state.coordinator.active_invites(),
        "active_operations": state.runner.active_operations(),
        "remembered_declines": state.coordinator.remembered_declines(),
    }))
}

/// Server info endpoint: metadata plus a timestamp, which also lets
/// clients measure round-trip time.
async fn info_handler(State(state): State<SocialState>) -> impl IntoResponse {
    Json(json!({
        "service": "glade-social",
        "version": env!("CARGO_PKG_VERSION"),
        "online_sessions": state.sessions.online_count(),
        "max_friends": state.config.max_friends,
        "decline_timeout_secs": state.config.decline_timeout_secs,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
