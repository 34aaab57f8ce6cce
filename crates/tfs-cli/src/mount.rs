use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tfs_config::{log_cli_info, Config};

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Mount point directory; defaults to mount.mountpoint
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: Option<PathBuf>,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,
}

/// Execute the mount command; blocks until unmounted
pub fn run(args: MountArgs, config: &Config) -> Result<()> {
    let mountpoint = args
        .mountpoint
        .or_else(|| config.mount.mountpoint.clone())
        .context("No mount point given and mount.mountpoint is unset")?;

    if !mountpoint.exists() {
        std::fs::create_dir_all(&mountpoint)
            .with_context(|| format!("Failed to create mountpoint: {}", mountpoint.display()))?;
    }

    log_cli_info!(
        "mounting",
        root = config.fs.root_name.as_str(),
        storage = config.storage_dir().display().to_string(),
        mountpoint = mountpoint.display().to_string()
    );

    #[cfg(feature = "fuse")]
    {
        let session = crate::session::Session::open(config)?;
        let options = tfs_fuse::MountOptions {
            fsname: format!("tfs:{}", config.fs.root_name),
            allow_other: args.allow_other || config.mount.allow_other,
            flush_interval: config.storage.flush_interval(),
        };
        let mounted = tfs_fuse::TfsFuse::new(session.fs().clone(), options).mount(&mountpoint);
        let closed = session.close();
        mounted?;
        closed?;
        Ok(())
    }

    #[cfg(not(feature = "fuse"))]
    {
        let _ = args.allow_other;
        anyhow::bail!("FUSE support disabled. Rebuild with: cargo build -p tfs-cli --features fuse")
    }
}
