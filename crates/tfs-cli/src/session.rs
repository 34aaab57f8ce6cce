use std::sync::Arc;

use anyhow::{Context, Result};
use tfs_config::{log_cli_debug, Config};
use tfs_fs::{open_store, Ctx, Fs, FsUser};

/// An opened store and filesystem, closed explicitly when done.
pub struct Session {
    fs: Arc<Fs>,
}

impl Session {
    pub fn open(config: &Config) -> Result<Self> {
        let dir = config.storage_dir();
        let kind = config.backend_kind()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        let store = open_store(kind, &dir, config.codec())
            .with_context(|| format!("Failed to open {} store at {}", kind, dir.display()))?;
        let fs = Fs::mount(Arc::new(store), config.fs_options())
            .with_context(|| format!("Failed to open filesystem {}", config.fs.root_name))?;
        log_cli_debug!("session opened", root = config.fs.root_name.as_str());
        Ok(Self { fs: Arc::new(fs) })
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    /// Path-level access as the invoking user
    pub fn user(&self) -> FsUser {
        let ctx = Ctx::new(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            std::process::id(),
        );
        FsUser::new(self.fs.clone(), ctx)
    }

    /// Flush the filesystem and shut the store down
    pub fn close(self) -> Result<()> {
        self.fs.flush().context("Failed to flush filesystem")?;
        self.fs.store().close().context("Failed to close store")?;
        Ok(())
    }
}
