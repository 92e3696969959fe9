use std::fs;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    #[serde(default)]
    pub websocket: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default = "default_workers")]
    pub workers: u8,
    #[serde(default = "default_retry_code")]
    pub retry_code: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_workers() -> u8 {
    4
}

fn default_retry_code() -> u16 {
    0xFFFF
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listeners: vec![ListenerConfig { port: 7878, websocket: false }],
            workers: default_workers(),
            retry_code: default_retry_code(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load order: `TCPFRAME_CONFIG` env var path, then `tcpframe.toml` in the
    /// working directory, then compiled-in defaults.
    pub fn load() -> ServerConfig {
        if let Ok(path) = std::env::var("TCPFRAME_CONFIG") {
            return Self::from_path(&path);
        }
        if std::path::Path::new("tcpframe.toml").exists() {
            return Self::from_path("tcpframe.toml");
        }
        ServerConfig::default()
    }

    fn from_path(path: &str) -> ServerConfig {
        let contents = fs::read_to_string(path)
            .unwrap_or_else(|err| panic!("could not read config file {}: {}", path, err));
        toml::from_str(&contents)
            .unwrap_or_else(|err| panic!("invalid config file {}: {}", path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_when_fields_omitted() {
        let config: ServerConfig = toml::from_str("listeners = [{ port = 9001 }]").unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry_code, 0xFFFF);
        assert_eq!(config.log_level, "info");
        assert!(!config.listeners[0].websocket);
    }

    #[test]
    fn test_websocket_flag_parses_per_listener() {
        let config: ServerConfig =
            toml::from_str("workers = 2\nlisteners = [{ port = 9001 }, { port = 9002, websocket = true }]")
                .unwrap();
        assert!(!config.listeners[0].websocket);
        assert!(config.listeners[1].websocket);
        assert_eq!(config.workers, 2);
    }
}
