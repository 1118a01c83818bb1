//! Shared application state and match server lifecycle.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::game::settings::MatchSettings;
use crate::game::{MatchServer, ServerHandle, ServerOptions, ServerRegistry};
use crate::store::SettingsStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ServerRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ServerRegistry::new()),
        }
    }

    /// Create the default server from config. It keeps a stable nil id, its
    /// settings persist across restarts, and it serves the MOTD file.
    pub fn spawn_default_server(&self, settings: MatchSettings, store: SettingsStore) -> ServerHandle {
        self.spawn(
            ServerOptions {
                id: Uuid::nil(),
                name: self.config.server_name.clone(),
                max_players: self.config.max_players,
                motd_path: Some(self.config.motd_path()),
            },
            settings,
            Some(store),
        )
    }

    /// Create an additional, ephemeral match server (API-created servers
    /// keep no state on disk).
    pub fn spawn_match_server(&self, name: String, max_players: usize) -> ServerHandle {
        self.spawn(
            ServerOptions {
                id: Uuid::new_v4(),
                name,
                max_players,
                motd_path: None,
            },
            MatchSettings::default(),
            None,
        )
    }

    fn spawn(
        &self,
        options: ServerOptions,
        settings: MatchSettings,
        store: Option<SettingsStore>,
    ) -> ServerHandle {
        let (server, handle) = MatchServer::create(options, settings, store);
        self.registry.insert(handle.clone());

        let registry = Arc::clone(&self.registry);
        let id = handle.id;
        tokio::spawn(async move {
            server.run().await;
            registry.remove(&id);
            info!(server_id = %id, "Match server removed from registry");
        });
        handle
    }
}
