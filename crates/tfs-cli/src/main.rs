//! # tfs CLI
//!
//! Command-line interface for the tfs encrypted, deduplicating filesystem.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tfs_config::logging::{init_logging, LogLevel};
use tfs_config::{log_cli_debug, Config};

mod files;
mod mount;
mod session;
mod sync;

/// tfs - content-addressed, encrypted filesystem with peer sync
#[derive(Parser)]
#[command(name = "tfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the global and local ones
    #[arg(long, global = true, env = "TFS_CONFIG")]
    config: Option<PathBuf>,

    /// Block storage directory
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Block backend: memory, file, lmdb or log
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Encryption password; empty disables encryption
    #[arg(long, global = true)]
    password: Option<String>,

    /// Name the filesystem root is stored under
    #[arg(long, global = true)]
    root_name: Option<String>,

    /// More output per occurrence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration as TOML
    InitConfig,

    /// Mount the filesystem through FUSE
    Mount(mount::MountArgs),

    /// Serve the store to sync peers over TCP
    Serve(sync::ServeArgs),

    /// Keep two served filesystems in sync
    Sync(sync::SyncArgs),

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,

        /// One entry per line with mode and size
        #[arg(short, long)]
        long: bool,
    },

    /// Print a file
    Cat { path: String },

    /// Copy a local file or directory tree into the filesystem
    Put {
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
        path: String,
    },

    /// Create a directory
    Mkdir {
        path: String,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a file, or a directory tree with -r
    Rm {
        path: String,

        #[arg(short, long)]
        recursive: bool,
    },

    /// Show attributes of a path
    Stat {
        path: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = Config::from_file(path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?;
                config.apply_env_overrides();
                config
            }
            None => tfs_config::config().clone(),
        };
        if let Some(storage) = &self.storage {
            config.storage.directory = storage.clone();
        }
        if let Some(backend) = &self.backend {
            config.storage.backend = backend.clone();
        }
        if let Some(password) = &self.password {
            config.crypto.password = password.clone();
        }
        if let Some(root_name) = &self.root_name {
            config.fs.root_name = root_name.clone();
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));
    let config = cli.load_config()?;
    log_cli_debug!(
        "configuration loaded",
        storage = config.storage_dir().display().to_string(),
        root = config.fs.root_name.clone()
    );

    match cli.command {
        Commands::InitConfig => {
            print!("{}", Config::default_toml()?);
            Ok(())
        }
        Commands::Mount(args) => mount::run(args, &config),
        Commands::Serve(args) => sync::serve(args, &config),
        Commands::Sync(args) => sync::run(args, &config),
        Commands::Ls { path, long } => files::ls(&config, &path, long),
        Commands::Cat { path } => files::cat(&config, &path),
        Commands::Put { local, path } => files::put(&config, &local, &path),
        Commands::Mkdir { path, parents } => files::mkdir(&config, &path, parents),
        Commands::Rm { path, recursive } => files::rm(&config, &path, recursive),
        Commands::Stat { path, json } => files::stat(&config, &path, json),
    }
}
