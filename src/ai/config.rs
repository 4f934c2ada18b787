//! Endpoint configuration management
//!
//! Handles storage and retrieval of the backend endpoints the chat pipeline
//! talks to, layered as: defaults, then the settings table, then environment
//! variables.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::db::settings::{self, SettingsError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Where requests for each backend kind are sent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Origin serving `/api/chat/*` and `/api/retrieval/retrieve`
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Local model runner
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Query the retrieval endpoint when the send has file context
    #[serde(default = "default_use_retrieval")]
    pub use_retrieval: bool,
    /// Number of reference snippets requested per send
    #[serde(default = "default_source_count")]
    pub source_count: u32,
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_use_retrieval() -> bool {
    true
}

fn default_source_count() -> u32 {
    4
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ollama_url: default_ollama_url(),
            request_timeout_secs: default_request_timeout_secs(),
            use_retrieval: default_use_retrieval(),
            source_count: default_source_count(),
        }
    }
}

const ENDPOINT_CONFIG_KEY: &str = "endpoint_config";

/// Base URL of the chat API
pub const ENV_API_URL: &str = "CHATLINE_API_URL";
/// Ollama URL for the local runner
pub const ENV_OLLAMA_URL: &str = "OLLAMA_URL";
/// Request timeout in seconds
pub const ENV_REQUEST_TIMEOUT: &str = "CHATLINE_REQUEST_TIMEOUT";

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Join `path` onto the chat API origin
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    /// Override values from environment variables
    /// Returns true if any values were updated
    pub fn populate_from_env(&mut self) -> bool {
        self.apply_overrides(
            env_value(ENV_API_URL),
            env_value(ENV_OLLAMA_URL),
            env_value(ENV_REQUEST_TIMEOUT),
        )
    }

    fn apply_overrides(
        &mut self,
        api_url: Option<String>,
        ollama_url: Option<String>,
        timeout: Option<String>,
    ) -> bool {
        let mut updated = false;

        if let Some(url) = api_url {
            if url != self.api_base_url {
                self.api_base_url = url;
                updated = true;
                log::info!("Loaded chat API URL from environment");
            }
        }

        if let Some(url) = ollama_url {
            if url != self.ollama_url {
                self.ollama_url = url;
                updated = true;
                log::info!("Loaded Ollama URL from environment");
            }
        }

        if let Some(raw) = timeout {
            match raw.parse::<u64>() {
                Ok(secs) if secs != self.request_timeout_secs => {
                    self.request_timeout_secs = secs;
                    updated = true;
                    log::info!("Loaded request timeout from environment");
                }
                Ok(_) => {}
                Err(e) => log::warn!("Ignoring {}={:?}: {}", ENV_REQUEST_TIMEOUT, raw, e),
            }
        }

        updated
    }
}

/// Initialize endpoint config - load from DB and populate from environment
pub fn init_endpoint_config(conn: &Connection) -> Result<EndpointConfig, ConfigError> {
    let mut config = load_endpoint_config(conn)?;

    if config.populate_from_env() {
        save_endpoint_config(conn, &config)?;
        log::info!("Endpoint config updated from environment variables");
    }

    Ok(config)
}

/// Save endpoint configuration to the database
pub fn save_endpoint_config(conn: &Connection, config: &EndpointConfig) -> Result<(), ConfigError> {
    settings::set_json(conn, ENDPOINT_CONFIG_KEY, config)?;
    Ok(())
}

/// Load endpoint configuration from the database, defaults if none is stored
pub fn load_endpoint_config(conn: &Connection) -> Result<EndpointConfig, ConfigError> {
    Ok(settings::get_json::<EndpointConfig>(conn, ENDPOINT_CONFIG_KEY)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::init_test_pool;

    #[test]
    fn test_load_defaults_when_missing() {
        let pool = init_test_pool().unwrap();
        let conn = pool.get().unwrap();

        let config = load_endpoint_config(&conn).unwrap();
        assert_eq!(config, EndpointConfig::default());
        assert_eq!(config.api_url("/api/chat/openai"), "http://localhost:3000/api/chat/openai");
    }

    #[test]
    fn test_save_and_load() {
        let pool = init_test_pool().unwrap();
        let conn = pool.get().unwrap();

        let config = EndpointConfig {
            api_base_url: "https://chat.example.com/".to_string(),
            source_count: 8,
            ..Default::default()
        };
        save_endpoint_config(&conn, &config).unwrap();

        let loaded = load_endpoint_config(&conn).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.api_url("/api/chat/tools"), "https://chat.example.com/api/chat/tools");
    }

    #[test]
    fn test_partial_json_uses_field_defaults() {
        let config: EndpointConfig = serde_json::from_str(r#"{"ollamaUrl":"http://gpu:11434"}"#).unwrap();
        assert_eq!(config.ollama_url, "http://gpu:11434");
        assert_eq!(config.request_timeout_secs, 300);
        assert!(config.use_retrieval);
    }

    #[test]
    fn test_overrides() {
        let mut config = EndpointConfig::default();
        assert!(!config.apply_overrides(None, None, None));

        let updated = config.apply_overrides(
            Some("http://api:8080".to_string()),
            None,
            Some("not-a-number".to_string()),
        );
        assert!(updated);
        assert_eq!(config.api_base_url, "http://api:8080");
        assert_eq!(config.request_timeout_secs, 300);

        assert!(config.apply_overrides(None, None, Some("30".to_string())));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }
}
