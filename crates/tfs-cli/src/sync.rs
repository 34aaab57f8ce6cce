//! `serve` and `sync`: the two halves of peer synchronization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tfs_config::{log_cli_error, log_cli_info, log_sync_info, log_sync_warn, Config};
use tfs_sync::{Connection, Connector, Server, TcpEndpoint};
use tokio::net::TcpListener;

use crate::session::Session;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on; defaults to sync.listen
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Endpoint serving the first filesystem
    #[arg(long)]
    left: String,

    /// Endpoint serving the second filesystem; defaults to sync.peer
    #[arg(long)]
    right: Option<String>,

    /// Root name on the left side; defaults to fs.root_name
    #[arg(long)]
    left_root: Option<String>,

    /// Name the left side keeps the right tree under
    #[arg(long)]
    left_other: Option<String>,

    /// Root name on the right side
    #[arg(long)]
    right_root: Option<String>,

    /// Name the right side keeps the left tree under
    #[arg(long)]
    right_other: Option<String>,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

pub fn serve(args: ServeArgs, config: &Config) -> Result<()> {
    let session = Session::open(config)?;
    let server = Arc::new(Server::new(session.fs().clone(), config.codec())?);
    let listen = args.listen.unwrap_or_else(|| config.sync.listen.clone());
    let interval = config.storage.flush_interval();

    let served = runtime()?.block_on(async {
        let listener = TcpListener::bind(listen.as_str())
            .await
            .with_context(|| format!("Failed to listen on {listen}"))?;
        let addr = listener.local_addr()?;
        println!("listening on {addr}");
        log_cli_info!("serving", addr = addr.to_string(), root = config.fs.root_name.as_str());

        let fs = session.fs().clone();
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let fs = fs.clone();
                match tokio::task::spawn_blocking(move || fs.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log_cli_error!("flush failed", error = err.to_string()),
                    Err(err) => log_cli_error!("flush task failed", error = err.to_string()),
                }
            }
        });

        tokio::select! {
            _ = tfs_sync::serve(listener, server) => {}
            signal = tokio::signal::ctrl_c() => {
                signal?;
                log_cli_info!("shutting down");
            }
        }
        flusher.abort();
        anyhow::Ok(())
    });

    let closed = session.close();
    served?;
    closed
}

pub fn run(args: SyncArgs, config: &Config) -> Result<()> {
    let right = args
        .right
        .clone()
        .or_else(|| config.sync.peer.clone())
        .context("No right endpoint given and sync.peer is unset")?;

    let left_endpoint = TcpEndpoint::connect(args.left.as_str())
        .with_context(|| format!("Cannot reach {}", args.left))?;
    let right_endpoint =
        TcpEndpoint::connect(right.as_str()).with_context(|| format!("Cannot reach {right}"))?;

    let left = Connection::new(
        Arc::new(left_endpoint),
        args.left_root.unwrap_or_else(|| config.fs.root_name.clone()),
        args.left_other
            .unwrap_or_else(|| config.sync.other_root_name.clone()),
    );
    let right = Connection::new(
        Arc::new(right_endpoint),
        args.right_root
            .unwrap_or_else(|| config.sync.peer_root_name.clone()),
        args.right_other
            .unwrap_or_else(|| config.sync.peer_other_root_name.clone()),
    );
    let connector = match config.sync.parallelism {
        Some(threads) => Connector::with_threads(left, right, threads)?,
        None => Connector::new(left, right)?,
    };

    if args.once {
        let copied = connector.run()?;
        println!("{copied} blocks copied");
        log_sync_info!("round done", copied = copied);
        return Ok(());
    }

    let interval = config.sync.interval();
    let stop = Arc::new(AtomicBool::new(false));
    runtime()?.block_on(async {
        let worker = {
            let stop = stop.clone();
            tokio::task::spawn_blocking(move || connector.run_every(interval, &stop))
        };
        if let Err(err) = tokio::signal::ctrl_c().await {
            log_sync_warn!("signal handler failed", error = err.to_string());
        }
        stop.store(true, Ordering::Relaxed);
        worker.await.context("sync worker failed")
    })
}
