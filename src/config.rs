//! Service configuration loaded from a TOML file
//!
//! Every field has a default, so a missing file or a missing section is
//! valid. A few settings can be overridden through the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub git: GitConfig,
}

/// `[cache]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Storage root for index files
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Subdirectory and key namespace
    #[serde(default = "default_component")]
    pub component: String,
    /// How long a build may run after its requester went away
    #[serde(default = "default_background_timeout_secs")]
    pub background_timeout_secs: u64,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// 0 = no age limit
    #[serde(default)]
    pub max_age_secs: u64,
    #[serde(default = "default_evict_interval_secs")]
    pub evict_interval_secs: u64,
}

/// `[indexer]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "num_cpus::get")]
    pub parser_pool_size: usize,
    /// Process-wide cap on files being parsed at once, across all builds
    #[serde(default = "num_cpus::get")]
    pub max_concurrent_parses: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    /// Archive fetches running at once; further builds queue
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
}

/// `[git]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory holding one clone per repository name
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("symdex")
}

fn default_component() -> String {
    "symbols".to_string()
}

fn default_background_timeout_secs() -> u64 {
    20 * 60
}

fn default_max_size_mb() -> u64 {
    10 * 1024
}

fn default_evict_interval_secs() -> u64 {
    600
}

fn default_max_file_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_write_batch_size() -> usize {
    1000
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3184
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_results() -> usize {
    100
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("repos")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            component: default_component(),
            background_timeout_secs: default_background_timeout_secs(),
            max_size_mb: default_max_size_mb(),
            max_age_secs: 0,
            evict_interval_secs: default_evict_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            parser_pool_size: num_cpus::get(),
            max_concurrent_parses: num_cpus::get(),
            max_file_size: default_max_file_size(),
            write_batch_size: default_write_batch_size(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            default_max_results: default_max_results(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
        }
    }
}

/// Load configuration from `path`, or defaults when no path is given
///
/// Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = match path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            parse_config(&config_str)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => {
            log::debug!("No config file given, using defaults");
            ServiceConfig::default()
        }
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse configuration from TOML text
pub fn parse_config(config_str: &str) -> Result<ServiceConfig> {
    let config: ServiceConfig = toml::from_str(config_str).context("Invalid TOML")?;

    if config.indexer.parser_pool_size == 0 {
        anyhow::bail!("indexer.parser_pool_size must be at least 1");
    }
    if config.indexer.max_concurrent_parses == 0 {
        anyhow::bail!("indexer.max_concurrent_parses must be at least 1");
    }
    if config.indexer.max_concurrent_fetches == 0 {
        anyhow::bail!("indexer.max_concurrent_fetches must be at least 1");
    }

    Ok(config)
}

fn apply_env_overrides(config: &mut ServiceConfig) -> Result<()> {
    if let Ok(dir) = env::var("SYMDEX_CACHE_DIR") {
        log::debug!("Cache dir overridden by SYMDEX_CACHE_DIR: {}", dir);
        config.cache.dir = PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("SYMDEX_REPOS_DIR") {
        log::debug!("Repos dir overridden by SYMDEX_REPOS_DIR: {}", dir);
        config.git.repos_dir = PathBuf::from(dir);
    }
    if let Ok(port) = env::var("SYMDEX_PORT") {
        config.server.port = port
            .parse()
            .with_context(|| format!("SYMDEX_PORT is not a valid port: {}", port))?;
    }
    Ok(())
}
