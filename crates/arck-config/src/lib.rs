//! # arck-config
//!
//! Configuration management for the arck coherence core.
//!
//! Loads configuration from:
//! 1. `~/.arck/config.toml` (global)
//! 2. `.arck/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lease: LeaseConfig,
    pub table: TableConfig,
    pub inodes: InodeConfig,
}

impl Config {
    /// Load config from standard locations, relative to the current directory
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_layers(Self::global_config_path().as_deref(), Path::new("."))
    }

    /// Load config using `project_root/.arck/config.toml` as the project layer
    pub fn load_from(project_root: &Path) -> Result<Self, ConfigError> {
        Self::load_layers(Self::global_config_path().as_deref(), project_root)
    }

    fn load_layers(global: Option<&Path>, project_root: &Path) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        // 1. Global config (~/.arck/config.toml)
        if let Some(global_path) = global {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(global_path)?;
                merge_toml(&mut merged, toml::from_str(&contents)?);
            }
        }

        // 2. Project config (.arck/config.toml) - overrides global
        let project_path = project_root.join(".arck/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(&project_path)?;
            merge_toml(&mut merged, toml::from_str(&contents)?);
        }

        let mut config: Config = merged.try_into()?;

        // 3. Environment variable overrides
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document (no layering, no env overrides)
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.arck/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".arck/config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(period) = std::env::var("ARCK_LEASE_PERIOD_MS") {
            self.lease.period_ms = period.parse().map_err(|_| ConfigError::Invalid {
                key: "ARCK_LEASE_PERIOD_MS",
                reason: format!("not an integer: {period}"),
            })?;
        }
        if let Ok(mode) = std::env::var("ARCK_ADMISSION") {
            self.lease.admission = mode.parse()?;
        }
        if let Ok(mode) = std::env::var("ARCK_LOCK_MODE") {
            self.table.lock_mode = mode.parse()?;
        }
        Ok(())
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.period_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "lease.period_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.table.size_classes.is_empty() {
            return Err(ConfigError::Invalid {
                key: "table.size_classes",
                reason: "at least one size class is required".to_string(),
            });
        }
        if self.table.max_load == 0 {
            return Err(ConfigError::Invalid {
                key: "table.max_load",
                reason: "must be positive".to_string(),
            });
        }
        if self.inodes.capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "inodes.capacity",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default().to_toml()
    }

    /// Render this config as TOML
    pub fn to_toml(&self) -> String {
        // Plain structs of scalars and arrays always serialize.
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, everything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Which expiration test the lease manager runs against an owner's lease ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
    /// One usage bit per inode; the controller tests it and revokes when clear.
    PlainBit,
    /// One critical-section counter byte per inode, claimed with a sentinel CAS.
    Sentinel,
}

impl std::str::FromStr for AdmissionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain-bit" | "plain" | "bit" => Ok(Self::PlainBit),
            "sentinel" => Ok(Self::Sentinel),
            other => Err(ConfigError::Invalid {
                key: "lease.admission",
                reason: format!("unknown admission mode `{other}`"),
            }),
        }
    }
}

/// Bucket lock strategy of a chained hash table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// Readers and writers are exclusive; critical sections never block.
    Spin,
    /// Shared readers, exclusive writers.
    RwLock,
}

impl std::str::FromStr for LockMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spin" => Ok(Self::Spin),
            "rw-lock" | "rwlock" => Ok(Self::RwLock),
            other => Err(ConfigError::Invalid {
                key: "table.lock_mode",
                reason: format!("unknown lock mode `{other}`"),
            }),
        }
    }
}

/// Lease protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Hard lease timeout in milliseconds
    pub period_ms: u64,
    /// Admission test variant
    pub admission: AdmissionMode,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            admission: AdmissionMode::Sentinel,
        }
    }
}

impl LeaseConfig {
    /// Lease period in clock ticks (nanoseconds)
    pub fn period_ticks(&self) -> u64 {
        self.period_ms.saturating_mul(1_000_000)
    }
}

/// Chained hash table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub lock_mode: LockMode,
    /// Initial bucket counts, selected by the table's init index
    pub size_classes: Vec<usize>,
    /// Average items per bucket that triggers an automatic resize
    pub max_load: usize,
    pub auto_resize: bool,
    /// Buckets a writer migrates on behalf of an open resize epoch
    pub migrate_step: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Spin,
            size_classes: vec![64, 1024, 16384],
            max_load: 4,
            auto_resize: true,
            migrate_step: 8,
        }
    }
}

impl TableConfig {
    /// Initial bucket count for `index`, rounded up to a power of two.
    /// Indices past the configured classes use the largest class.
    pub fn buckets_for(&self, index: usize) -> usize {
        let base = self
            .size_classes
            .get(index)
            .or_else(|| self.size_classes.last())
            .copied()
            .unwrap_or(64);
        base.max(1).next_power_of_two()
    }
}

/// Shadow inode table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeConfig {
    pub capacity: usize,
}

impl Default for InodeConfig {
    fn default() -> Self {
        Self { capacity: 65536 }
    }
}
