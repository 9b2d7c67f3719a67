use crate::common::codec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the listener binds; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
    /// When false, any credentials are accepted at LOGIN
    #[serde(default = "default_security")]
    pub security: bool,
    /// Hostname advertised in the greeting and counted as local
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Additional host strings this server receives mail for
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Shared identity used when relaying to other servers
    #[serde(default = "default_relay_username")]
    pub relay_username: String,
    #[serde(default = "default_relay_password")]
    pub relay_password: String,
    /// Port remote servers are expected to listen on
    #[serde(default = "default_port")]
    pub relay_port: u16,
}

fn default_port() -> u16 {
    codec::DEFAULT_PORT
}

fn default_security() -> bool {
    true
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_relay_username() -> String {
    "server".to_string()
}

fn default_relay_password() -> String {
    "server".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            security: default_security(),
            hostname: default_hostname(),
            aliases: Vec::new(),
            relay_username: default_relay_username(),
            relay_password: default_relay_password(),
            relay_port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file, falling back to environment variables
    pub async fn load(storage_path: &Path) -> Result<Self, String> {
        let config_path = storage_path.join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .map_err(|e| format!("Failed to read {:?}: {}", config_path, e))?;
            toml::from_str(&content)
                .map_err(|e| format!("Failed to parse {:?}: {}", config_path, e))?
        } else {
            ServerConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables override config file values
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("RELAY_MAIL_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(security) = std::env::var("RELAY_MAIL_SECURITY") {
            self.security = security != "0" && security.to_lowercase() != "false";
        }
        if let Ok(hostname) = std::env::var("RELAY_MAIL_HOSTNAME") {
            self.hostname = hostname;
        }
        if let Ok(user) = std::env::var("RELAY_MAIL_RELAY_USER") {
            self.relay_username = user;
        }
        if let Ok(pass) = std::env::var("RELAY_MAIL_RELAY_PASS") {
            self.relay_password = pass;
        }
        if let Ok(port) = std::env::var("RELAY_MAIL_RELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.relay_port = port;
            }
        }
    }

    /// Save configuration to file
    pub async fn save(&self, storage_path: &Path) -> Result<(), String> {
        let config_path = storage_path.join("config.toml");
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(&config_path, content)
            .await
            .map_err(|e| format!("Failed to write {:?}: {}", config_path, e))
    }

    /// Generate a sample configuration file
    pub fn sample() -> String {
        let sample = ServerConfig {
            hostname: "mail.example.com".to_string(),
            aliases: vec!["example.com".to_string(), "203.0.113.1".to_string()],
            ..ServerConfig::default()
        };
        toml::to_string_pretty(&sample).expect("sample config serializes")
    }
}

/// Get the storage path from environment (available before config is loaded)
pub fn get_storage_path() -> PathBuf {
    std::env::var("RELAY_MAIL_STORAGE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Default save path for user login data
pub fn user_data_path(storage_path: &Path) -> PathBuf {
    storage_path.join("user-login-data.bin")
}
