//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A free localhost port for a throwaway controller
//! - A temporary directory holding filter files
//! - A `Config` pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use loom_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let filter = env.write_filter("cs.filter", "1 2 0 42 1 43 0 0 0").unwrap();
//!     // env.config().controller points at env.port
//! }
//! ```

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with a unique port and filter directory
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the temporary directory
    pub root: PathBuf,
    /// Directory holding filter files written by the test
    pub filter_dir: PathBuf,
    /// Localhost port that was free when the environment was created
    pub port: u16,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let filter_dir = root.join("filters");
        std::fs::create_dir_all(&filter_dir)?;

        // Let the OS pick a port, then release it for the controller under test
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0")?;
            probe.local_addr()?.port()
        };

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            filter_dir,
            port,
            test_id,
        })
    }

    /// Config whose controller endpoint is this environment's port, with a
    /// short reconnect interval so daemons under test find the controller fast
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.controller.host = crate::DEFAULT_CONTROLLER_HOST.to_string();
        cfg.controller.port = self.port;
        cfg.daemon.reconnect_interval_ms = 20;
        cfg
    }

    /// Write a filter file and return its absolute path
    pub fn write_filter(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.filter_dir.join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// `host:port` of the controller under test
    pub fn controller_addr(&self) -> String {
        format!("{}:{}", crate::DEFAULT_CONTROLLER_HOST, self.port)
    }
}
