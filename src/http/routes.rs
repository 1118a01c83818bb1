//! Route table and handlers.
//!
//! The HTTP layer never touches match state directly: it reads the counters
//! each match server publishes and hands upgraded sockets over a channel.

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::game::ServerHandle;
use crate::util::time::uptime_secs;
use crate::ws;

use super::error::ApiError;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/:id", get(join_server))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// One row of the server listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerSummary {
    id: Uuid,
    name: String,
    max_players: usize,
    current_players: usize,
    in_game: bool,
}

impl ServerSummary {
    fn from_handle(handle: &ServerHandle) -> Self {
        Self {
            id: handle.id,
            name: handle.name.clone(),
            max_players: handle.max_players,
            current_players: handle.client_count(),
            in_game: handle.in_race(),
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": uptime_secs(),
        "activeServers": state.registry.active_servers(),
        "totalClients": state.registry.total_clients(),
    }))
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerSummary>> {
    let mut servers: Vec<ServerSummary> = state
        .registry
        .list()
        .iter()
        .map(ServerSummary::from_handle)
        .collect();
    servers.sort_by(|a, b| a.name.cmp(&b.name));
    Json(servers)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateServerRequest {
    name: String,
    #[serde(default)]
    max_players: Option<usize>,
}

async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<CreateServerRequest>,
) -> Result<Json<ServerSummary>, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("server name must not be empty".into()));
    }
    let max_players = request.max_players.unwrap_or(state.config.max_players);
    if max_players == 0 {
        return Err(ApiError::BadRequest("maxPlayers must be positive".into()));
    }

    let handle = state.spawn_match_server(name.to_string(), max_players);
    info!(server_id = %handle.id, name = %handle.name, "Created match server");
    Ok(Json(ServerSummary::from_handle(&handle)))
}

/// Joining a server is a WebSocket upgrade on its listing entry.
async fn join_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let handle = state.registry.get(&id).ok_or(ApiError::ServerNotFound)?;
    Ok(ws::handler::upgrade(ws, handle))
}
