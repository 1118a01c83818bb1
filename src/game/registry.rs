//! Registry of running match server instances.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::console::CommandSender;
use crate::ws::connection::ConnectionWrapper;

/// Counters a match server publishes for the HTTP listing.
#[derive(Debug, Default)]
pub struct ServerShared {
    pub client_count: AtomicUsize,
    pub in_race: AtomicBool,
}

/// Handle to a running match server.
#[derive(Clone)]
pub struct ServerHandle {
    pub id: Uuid,
    pub name: String,
    pub max_players: usize,
    /// Hands freshly wrapped sockets to the tick loop.
    pub conn_tx: mpsc::UnboundedSender<ConnectionWrapper>,
    pub commands: CommandSender,
    pub shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Relaxed)
    }

    pub fn in_race(&self) -> bool {
        self.shared.in_race.load(Ordering::Relaxed)
    }

    /// Pass an upgraded connection to the match server's tick loop.
    pub fn connect_client(&self, wrapper: ConnectionWrapper) {
        let _ = self.conn_tx.send(wrapper);
    }
}

/// All active match servers, shared between the HTTP layer and main.
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<Uuid, ServerHandle>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<ServerHandle> {
        self.servers.get(id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, handle: ServerHandle) {
        self.servers.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<ServerHandle> {
        self.servers.remove(id).map(|(_, handle)| handle)
    }

    pub fn list(&self) -> Vec<ServerHandle> {
        self.servers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn total_clients(&self) -> usize {
        self.servers.iter().map(|entry| entry.value().client_count()).sum()
    }

    /// Ask every running server to shut down cleanly.
    pub fn stop_all(&self) {
        for entry in self.servers.iter() {
            entry.value().commands.submit(crate::console::Command {
                name: "stop".into(),
                content: String::new(),
            });
        }
    }
}
