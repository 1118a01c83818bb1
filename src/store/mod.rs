//! On-disk persistence for match settings and the message of the day.

pub mod motd;
pub mod settings;

pub use motd::load_motd;
pub use settings::{SettingsStore, StoreError};
