//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - a private storage directory
//! - a config pointing at it
//! - local files to import
//!
//! # Usage
//!
//! ```ignore
//! use tfs_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let store = tfs_fs::open_store(env.config().backend_kind()?, &env.storage_dir(), env.config().codec())?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Password of every test environment's codec
pub const TEST_PASSWORD: &str = "tfs-test-password";

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    temp_dir: TempDir,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        std::fs::create_dir_all(temp_dir.path().join("storage"))?;
        std::fs::create_dir_all(temp_dir.path().join("local"))?;
        Ok(Self { temp_dir, test_id })
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root().join("storage")
    }

    /// Loopback address with a port picked by the OS at bind time
    pub fn socket_addr(&self) -> String {
        "127.0.0.1:0".to_string()
    }

    /// Config using this environment's storage, a per-test root name and
    /// an encrypted codec shared by every test environment, so peers can sync
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.directory = self.storage_dir();
        cfg.storage.backend = "file".to_string();
        cfg.crypto.password = TEST_PASSWORD.to_string();
        cfg.crypto.iterations = 100;
        cfg.fs.root_name = format!("test{}", self.test_id);
        cfg.sync.listen = self.socket_addr();
        cfg
    }

    /// Write `config()` as TOML and return its path
    pub fn write_config(&self) -> anyhow::Result<PathBuf> {
        let path = self.root().join("config.toml");
        std::fs::write(&path, toml::to_string_pretty(&self.config())?)?;
        Ok(path)
    }

    /// Create a local (host) file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root().join("local").join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
