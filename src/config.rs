//! Configuration module for mathserver.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Connection handling strategy, fixed for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One dedicated execution context per connection.
    Fork,
    /// Single-threaded readiness loop, one request cycle per event.
    Muxbasic,
    /// Pool of readiness loops sharing the port via SO_REUSEPORT.
    Muxscale,
}

/// Command-line arguments for the compute server
#[derive(Parser, Debug)]
#[command(name = "mathserver")]
#[command(version = "0.1.0")]
#[command(about = "Remote kmeans/matinv compute server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Run as a daemon
    #[arg(short, long)]
    pub daemon: bool,

    /// Request handling strategy
    #[arg(short, long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Number of event loops for the muxscale strategy (0 = CPU count)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum open connections per event loop
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Directory receiving per-client results
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Directory holding the kmeans and matinv executables
    #[arg(long)]
    pub bin_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file used once detached from the terminal
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub daemon: bool,
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: default_host(),
            daemon: false,
            strategy: default_strategy(),
            workers: 0,
            max_connections: default_max_connections(),
        }
    }
}

/// Compute job configuration
#[derive(Debug, Deserialize)]
pub struct JobsConfig {
    /// Root directory for per-client results
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Directory holding the job executables
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            bin_dir: default_bin_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_strategy() -> Strategy {
    Strategy::Fork
}

fn default_max_connections() -> usize {
    1024
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("../computed_results")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("mathserver.log")
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub daemon: bool,
    pub strategy: Strategy,
    pub workers: usize,
    pub max_connections: usize,
    pub results_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub log_level: String,
    pub log_file: PathBuf,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
        Self::merge(cli, toml_config, &cwd)
    }

    /// Merge CLI args over TOML values, resolving relative paths against `cwd`.
    ///
    /// Paths are made absolute here because detaching from the terminal
    /// changes the working directory to `/`.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig, cwd: &Path) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            daemon: cli.daemon || toml_config.server.daemon,
            strategy: cli.strategy.unwrap_or(toml_config.server.strategy),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            results_dir: cwd.join(cli.results_dir.unwrap_or(toml_config.jobs.results_dir)),
            bin_dir: cwd.join(cli.bin_dir.unwrap_or(toml_config.jobs.bin_dir)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_file: cwd.join(cli.log_file.unwrap_or(toml_config.logging.file)),
        })
    }

    /// Address string for the listening socket.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of event loops for the muxscale strategy.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    WorkingDir(std::io::Error),
    MissingPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::WorkingDir(e) => {
                write!(f, "Failed to determine working directory: {}", e)
            }
            ConfigError::MissingPort => write!(f, "No port assigned (use -p <port>)"),
        }
    }
}

impl std::error::Error for ConfigError {}
