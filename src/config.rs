//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name shown in the startup banner
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address the WebSocket listener binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port for clients
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to data files (world seed)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// World seed file name, relative to `data_path`
    #[serde(default = "default_world_file")]
    pub world_file: String,

    /// Physics simulation rate in Hz
    #[serde(default = "default_physics_rate")]
    pub physics_rate_hz: u32,

    /// Minimum spacing between two replication messages for one entity
    #[serde(default = "default_replication_window")]
    pub replication_window_ms: u64,

    /// Autosave interval in seconds (0 to disable)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Argon2 time cost used when hashing seed passwords
    #[serde(default = "default_password_iterations")]
    pub password_iterations: u32,

    /// Argon2 memory cost (KiB) used when hashing seed passwords
    #[serde(default = "default_password_memory")]
    pub password_memory_kib: u32,

    /// Development mode flag
    #[serde(default)]
    pub dev_mode: bool,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

// Default value functions
fn default_server_name() -> String {
    "Precursors".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_world_file() -> String {
    "world.json".to_string()
}

fn default_physics_rate() -> u32 {
    60
}

fn default_replication_window() -> u64 {
    100
}

fn default_autosave_interval() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_password_iterations() -> u32 {
    3
}

fn default_password_memory() -> u32 {
    19 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            server_name: default_server_name(),
            host: default_host(),
            port: default_port(),
            data_path: default_data_path(),
            world_file: default_world_file(),
            physics_rate_hz: default_physics_rate(),
            replication_window_ms: default_replication_window(),
            autosave_interval_secs: default_autosave_interval(),
            max_connections: default_max_connections(),
            password_iterations: default_password_iterations(),
            password_memory_kib: default_password_memory(),
            dev_mode: false,
            debug: false,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("PRECURSORS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PRECURSORS_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("PRECURSORS_HOST") {
            self.host = val;
        }
        if let Ok(val) = env::var("PRECURSORS_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = env::var("PRECURSORS_DATA_PATH") {
            self.data_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("PRECURSORS_WORLD_FILE") {
            self.world_file = val;
        }
        if let Ok(val) = env::var("PRECURSORS_PHYSICS_RATE") {
            if let Ok(rate) = val.parse() {
                self.physics_rate_hz = rate;
            }
        }
        if let Ok(val) = env::var("PRECURSORS_REPLICATION_WINDOW_MS") {
            if let Ok(window) = val.parse() {
                self.replication_window_ms = window;
            }
        }
        if let Ok(val) = env::var("PRECURSORS_AUTOSAVE_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.autosave_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("PRECURSORS_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                self.max_connections = max;
            }
        }
        if let Ok(val) = env::var("PRECURSORS_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("PRECURSORS_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("PRECURSORS_JSON_LOGS") {
            self.json_logs = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port must be non-zero");
        }

        if self.physics_rate_hz == 0 || self.physics_rate_hz > 1000 {
            anyhow::bail!("Physics rate must be between 1Hz and 1000Hz");
        }

        if self.replication_window_ms == 0 {
            anyhow::bail!("Replication window must be non-zero");
        }

        if self.max_connections == 0 {
            anyhow::bail!("Max connections must be at least 1");
        }

        if self.password_iterations == 0 {
            anyhow::bail!("Password iterations must be at least 1");
        }

        Ok(())
    }

    /// Socket address string for the WebSocket listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path of the world seed file
    pub fn world_path(&self) -> PathBuf {
        self.data_path.join(&self.world_file)
    }

    /// Interval between physics ticks
    pub fn physics_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.physics_rate_hz.max(1)))
    }

    pub fn replication_window(&self) -> Duration {
        Duration::from_millis(self.replication_window_ms)
    }
}
