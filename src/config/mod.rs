//! Environment-driven configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Name of the default match server created at startup.
    pub server_name: String,
    pub max_players: usize,
    /// Directory holding the settings file and the message of the day.
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_env("PORT", 8080)?,
            server_name: env::var("SERVER_NAME").unwrap_or_else(|_| "Ball Race Server".into()),
            max_players: parse_env("MAX_PLAYERS", 16)?,
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ConfigError::Invalid {
            key: "HOST",
            value: raw,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("match_settings.json")
    }

    pub fn motd_path(&self) -> PathBuf {
        self.data_dir.join("motd.txt")
    }
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_combines_host_and_port() {
        let mut config = Config {
            host: "127.0.0.1".into(),
            port: 9000,
            server_name: "test".into(),
            max_players: 16,
            data_dir: PathBuf::from("."),
        };
        assert_eq!(config.bind_addr().unwrap().port(), 9000);

        config.host = "not an address".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn data_paths_live_under_data_dir() {
        let config = Config {
            host: "0.0.0.0".into(),
            port: 8080,
            server_name: "test".into(),
            max_players: 16,
            data_dir: PathBuf::from("/var/lib/ballrace"),
        };
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/var/lib/ballrace/match_settings.json")
        );
        assert_eq!(config.motd_path(), PathBuf::from("/var/lib/ballrace/motd.txt"));
    }
}
