//! WebSocket upgrade glue between the HTTP layer and a match server.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tracing::info;

use crate::game::ServerHandle;

use super::connection::ConnectionWrapper;

/// Upgrade the request and hand the resulting socket to the match server.
pub fn upgrade(ws: WebSocketUpgrade, handle: ServerHandle) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

async fn handle_socket(socket: WebSocket, handle: ServerHandle) {
    let wrapper = ConnectionWrapper::attach(socket);
    info!(
        server_id = %handle.id,
        connection_id = %wrapper.id(),
        "WebSocket connection established"
    );
    handle.connect_client(wrapper);
}
