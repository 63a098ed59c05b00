//! Configuration management
//!
//! Loads TOML configuration from a prioritized search path: the working
//! directory, the OS config directory, then (on Unix) a system-wide path.
//! The first readable, parseable file wins; absent values fall back to the
//! compiled-in defaults below. If nothing is found, defaults are written to
//! the working-directory location so a second run finds a starting point.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_mode")]
    pub mode: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_memory_items")]
    pub max_memory_items: u64,
    #[serde(default = "default_max_memory_size_mb")]
    pub max_memory_size_mb: u64,
}

fn default_database_mode() -> String {
    "embedded".to_string()
}

fn default_database_path() -> PathBuf {
    data_dir().unwrap_or_else(|_| PathBuf::from(".")).join("memory.sqlite3")
}

fn default_max_memory_items() -> u64 {
    1_000_000
}

fn default_max_memory_size_mb() -> u64 {
    2048
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mode: default_database_mode(),
            uri: None,
            path: default_database_path(),
            max_memory_items: default_max_memory_items(),
            max_memory_size_mb: default_max_memory_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub use_gpu: bool,
    #[serde(default = "default_true")]
    pub async_enabled: bool,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_model_name() -> String {
    "hash-fallback".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    1000
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            model_path: None,
            use_gpu: false,
            async_enabled: true,
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_scope_name")]
    pub default_scope: String,
    #[serde(default = "default_true")]
    pub auto_create_scope: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_scope_name() -> String {
    "Global".to_string()
}

fn default_retention_days() -> u32 {
    180
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_scope: default_scope_name(),
            auto_create_scope: true,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub retention: Option<u32>,
    #[serde(default)]
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            memory: MemoryConfig::default(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration by walking the prioritized search path. The first
    /// existing, parseable file wins; if none is found, defaults are used
    /// and written to the working-directory location.
    pub fn load() -> Result<Self> {
        for path in search_path() {
            if path.is_file() {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                let config: EngineConfig = toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                return Ok(config);
            }
        }

        let config = EngineConfig::default();
        config.save(&search_path()[0])?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents).context("failed to write config file")?;
        Ok(())
    }
}

/// Prioritized search path: working directory, OS config dir, then (Unix) a
/// system-wide path. Mirrors the source's `CONFIG_PATHS` list.
fn search_path() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./config/memory-engine.toml")];
    if let Some(dirs) = directories::ProjectDirs::from("com", "memory-engine", "memory-engine") {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    #[cfg(unix)]
    paths.push(PathBuf::from("/etc/memory-engine/config.toml"));
    paths
}

/// The platform data directory, used for the default database path.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "memory-engine", "memory-engine")
        .context("failed to resolve project directories")?;
    Ok(dirs.data_dir().to_path_buf())
}
