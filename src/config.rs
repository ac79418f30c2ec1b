//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub livelog: LiveLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required by the admin endpoints (none = open)
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// SQLite page cache size in MB per connection (default: 16)
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u32,
}

fn default_cache_size_mb() -> u32 {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticsConfig {
    /// When false, traffic events are not buffered at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Site id stamped on inbound records (0 for a single site)
    #[serde(default)]
    pub site: i64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            site: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LiveLogBackend {
    /// Segment files shared by every process of the installation
    #[default]
    Sqlite,
    /// Ring kept in this process only
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    #[default]
    Web,
    Cli,
}

impl ExecMode {
    /// Project character mixed into the segment token
    pub fn project(&self) -> char {
        match self {
            ExecMode::Web => 'w',
            ExecMode::Cli => 'c',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: LiveLogBackend,
    /// Number of lines kept in the ring
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// Viewer poll interval in milliseconds (only reported to the viewer)
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    /// Where segment files live (default: system temp dir)
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Path identifying this installation (default: working directory)
    #[serde(default)]
    pub installation: Option<PathBuf>,
    #[serde(default)]
    pub exec_mode: ExecMode,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LiveLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: LiveLogBackend::default(),
            buffer: default_buffer(),
            frequency: default_frequency(),
            directory: None,
            installation: None,
            exec_mode: ExecMode::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl LiveLogConfig {
    pub fn directory_path(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("traffic"))
    }

    pub fn installation_path(&self) -> PathBuf {
        self.installation
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_true() -> bool {
    true
}

fn default_buffer() -> usize {
    4000
}

fn default_frequency() -> u64 {
    750
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            // e.g. TRAFFIC__LIVELOG__BUFFER=2000
            .add_source(
                config::Environment::with_prefix("TRAFFIC")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if matches!(self.server.api_token.as_deref(), Some("")) {
            anyhow::bail!("api_token cannot be empty; remove it to disable authentication");
        }

        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate live log config
        if self.livelog.buffer == 0 {
            anyhow::bail!("livelog.buffer must be greater than 0");
        }
        if self.livelog.lock_timeout_ms == 0 {
            anyhow::bail!("livelog.lock_timeout_ms must be greater than 0");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }
}
