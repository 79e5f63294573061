//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated project root with its own `.arck/config.toml`
//! - Scratch paths for file-backed ring regions
//!
//! # Usage
//!
//! ```ignore
//! use arck_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! env.write_project_config("[lease]\nperiod_ms = 5\n")?;
//! let config = env.load_config()?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, ConfigError};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Directory for file-backed ring regions
    pub ring_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let project_root = root.join("project");
        let ring_dir = root.join("rings");

        std::fs::create_dir_all(project_root.join(".arck"))?;
        std::fs::create_dir_all(&ring_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            project_root,
            ring_dir,
            test_id,
        })
    }

    /// Path of the project-local config file
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(".arck").join("config.toml")
    }

    /// Write the project-local config file
    pub fn write_project_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_config_path();
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Load config with this environment's project root as the project layer
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        Config::load_from(&self.project_root)
    }

    /// Unique path for a file-backed ring of trust group `tgid`
    pub fn ring_path(&self, kind: &str, tgid: u32) -> PathBuf {
        self.ring_dir
            .join(format!("arck-test-{}-{}-{}.ring", self.test_id, kind, tgid))
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.project_root.join(".arck").exists());
        assert!(env.ring_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_ring_paths() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.ring_path("lease", 1), env2.ring_path("lease", 1));
    }

    #[test]
    fn test_write_project_config() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_project_config("[inodes]\ncapacity = 12\n").unwrap();
        assert!(path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[inodes]\ncapacity = 12\n"
        );
    }
}
