mod sweeps;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use guardian_api::{AppState, AppStateInner, commands, connection, devices, emergency};
use guardian_core::dispatcher::bootstrap_registry;
use guardian_core::interpreter::KeywordInterpreter;
use guardian_core::CommandDispatcher;
use guardian_db::Database;
use guardian_gateway::PresenceChannel;
use guardian_types::api::ErrorResponse;
use guardian_types::events::ObserverRole;

/// How often the expiry sweep runs. The ack timeout itself is configured
/// via GUARDIAN_ACK_TIMEOUT_SECS.
const EXPIRY_SWEEP_SECS: u64 = 5;
const OFFLINE_SWEEP_SECS: u64 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardian=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("GUARDIAN_DB_PATH").unwrap_or_else(|_| "guardian.db".into());
    let host = std::env::var("GUARDIAN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("GUARDIAN_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let ack_timeout_secs: i64 = std::env::var("GUARDIAN_ACK_TIMEOUT_SECS")
        .unwrap_or_else(|_| "30".into())
        .parse()?;
    let offline_after_secs: i64 = std::env::var("GUARDIAN_OFFLINE_AFTER_SECS")
        .unwrap_or_else(|_| "90".into())
        .parse()?;

    // Init database and rebuild the registry from durable state
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let registry = bootstrap_registry(db.clone()).await?;

    // Shared state
    let channel = PresenceChannel::new();
    let dispatcher = CommandDispatcher::with_ack_timeout(
        db.clone(),
        registry.clone(),
        channel.clone(),
        Arc::new(KeywordInterpreter),
        chrono::Duration::seconds(ack_timeout_secs),
    );

    let state: AppState = Arc::new(AppStateInner {
        db,
        registry: registry.clone(),
        channel,
        dispatcher: dispatcher.clone(),
    });

    // Background sweeps
    tokio::spawn(sweeps::run_expiry_loop(dispatcher, EXPIRY_SWEEP_SECS));
    tokio::spawn(sweeps::run_offline_loop(
        registry,
        offline_after_secs,
        OFFLINE_SWEEP_SECS,
    ));

    // Routes
    let app = Router::new()
        .route("/health", get(health))
        .route("/devices", post(devices::register_device))
        .route("/devices", get(devices::list_devices))
        .route("/devices/{device_id}/heartbeat", post(devices::heartbeat))
        .route("/devices/{device_id}/commands", post(commands::issue_command))
        .route("/devices/{device_id}/commands", get(devices::command_history))
        .route("/commands/{command_id}/ack", post(commands::ack_command))
        .route("/interpret", post(commands::interpret))
        .route("/families/{family_id}/lockdown", post(emergency::lockdown))
        .route("/families/{family_id}/release", post(emergency::release))
        .route(
            "/families/{family_id}/emergencies",
            get(emergency::list_emergencies),
        )
        .route("/gateway", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Guardian server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    role: ObserverRole,
    device_id: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if query.role == ObserverRole::DeviceAgent && query.device_id.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "device_agent connections require device_id".to_string(),
            }),
        ));
    }

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state, query.role, query.device_id)
    }))
}
