mod app;
mod config;
mod console;
mod game;
mod http;
mod store;
mod util;
mod ws;

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use app::AppState;
use config::Config;
use game::settings::MatchSettings;
use game::ServerHandle;
use store::SettingsStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    util::time::init_server_time();

    let config = Config::from_env()?;
    let addr = config.bind_addr()?;
    let state = AppState::new(config);

    let settings_store = SettingsStore::new(state.config.settings_path());
    let settings = match settings_store.load() {
        Ok(Some(settings)) => {
            info!(path = %settings_store.path().display(), "Loaded match settings");
            settings
        }
        Ok(None) => MatchSettings::default(),
        Err(e) => {
            warn!(error = %e, "Could not load match settings, using defaults");
            MatchSettings::default()
        }
    };

    let default_server = state.spawn_default_server(settings, settings_store);
    console::spawn_stdin_reader(default_server.commands.clone());
    info!("Type 'help' for a list of commands. Type 'stop' to shut down the server.");

    let router = http::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(default_server))
        .await?;

    state.registry.stop_all();
    // Let the match servers flush their goodbye frames.
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("Goodbye");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Resolve on Ctrl-C or when the default server stops (console `stop`).
async fn shutdown_signal(default_server: ServerHandle) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = default_server.conn_tx.closed() => info!("Default server stopped, shutting down"),
    }
}
