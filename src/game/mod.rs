//! Match orchestration: state machine, settings, messages, timers.

pub mod messages;
pub mod registry;
pub mod server;
pub mod settings;
pub mod timer;

pub use registry::{ServerHandle, ServerRegistry};
pub use server::{MatchServer, ServerOptions};

/// Game version the server validates clients against.
pub const GAME_VERSION: f32 = 1.0;

/// Set for testing builds; must match between client and server.
pub const IS_TESTING: bool = false;
