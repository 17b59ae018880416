// swarm-node: directory service, serving peer, and download client in one binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swarm_core::Directory;
use swarm_node::config::{self, Config};
use swarm_node::directory_service::{run_directory_service, run_liveness_sweep};
use swarm_node::{DirectoryApi, DownloadEngine, FragmentFetcher, Peer, RemoteDirectory, SharedFolder};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/swarm/config.toml, then /etc/swarm/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the directory service and its liveness sweep.
    Directory,
    /// Serve the shared folder and stay registered until interrupted.
    Peer,
    /// Download a file from the peers that advertise it.
    Download {
        name: String,
        #[arg(long)]
        fragments: Option<usize>,
        #[arg(long)]
        no_compression: bool,
    },
    /// List files advertised at the directory.
    Files,
    /// List peers registered at the directory.
    Peers,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    init_logging(&cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Directory => run_directory(&cfg).await,
            Commands::Peer => run_peer(&cfg).await,
            Commands::Download {
                name,
                fragments,
                no_compression,
            } => {
                run_download(&cfg, &name, fragments.unwrap_or(cfg.fragment_count), !no_compression)
                    .await
            }
            Commands::Files => {
                for name in remote_directory(&cfg).list_files().await? {
                    println!("{name}");
                }
                Ok(())
            }
            Commands::Peers => {
                for peer in remote_directory(&cfg).list_peers().await? {
                    println!(
                        "{}\t{}\tload={}",
                        peer.peer_id,
                        peer.endpoint(),
                        peer.active_connections
                    );
                }
                Ok(())
            }
        }
    })
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn remote_directory(cfg: &Config) -> RemoteDirectory {
    RemoteDirectory::connect_to(cfg.directory_addr.clone(), cfg.connect_timeout() * 2)
}

fn fetcher(cfg: &Config, use_compression: bool) -> FragmentFetcher {
    FragmentFetcher::new(cfg.connect_timeout(), cfg.retry_policy(), use_compression)
}

async fn run_directory(cfg: &Config) -> Result<()> {
    let directory = Arc::new(Directory::new());
    let listener = TcpListener::bind(("0.0.0.0", cfg.directory_listen_port))
        .await
        .with_context(|| format!("bind directory port {}", cfg.directory_listen_port))?;
    tokio::spawn(run_liveness_sweep(
        directory.clone(),
        cfg.sweep_interval(),
        cfg.peer_timeout(),
    ));
    tokio::select! {
        res = run_directory_service(listener, directory) => res?,
        res = shutdown_signal() => res?,
    }
    info!("directory service stopped");
    Ok(())
}

async fn run_peer(cfg: &Config) -> Result<()> {
    let store = Arc::new(
        SharedFolder::open(&cfg.shared_dir)
            .await
            .with_context(|| format!("open shared folder {}", cfg.shared_dir.display()))?,
    );
    let directory: Arc<dyn DirectoryApi> = Arc::new(remote_directory(cfg));
    let engine = DownloadEngine::new(
        cfg.peer_id.clone(),
        cfg.download_dir(),
        directory.clone(),
        fetcher(cfg, cfg.use_compression),
    )
    .with_shared_dir(cfg.shared_dir.clone());
    let peer = Peer::new(
        cfg.peer_id.clone(),
        cfg.advertise_address.clone(),
        cfg.listen_port,
        store,
        directory,
        engine,
    );
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("bind serving port {}", cfg.listen_port))?;
    peer.announce().await.context("register with directory")?;

    tokio::select! {
        res = peer.serve(listener) => res?,
        _ = peer.run_heartbeat(cfg.heartbeat_interval()) => {}
        _ = peer.run_rescan(cfg.rescan_interval()) => {}
        res = shutdown_signal() => res?,
    }
    if let Err(e) = peer.leave().await {
        warn!(error = %e, "could not unregister");
    }
    Ok(())
}

async fn run_download(cfg: &Config, name: &str, fragments: usize, use_compression: bool) -> Result<()> {
    let directory: Arc<dyn DirectoryApi> = Arc::new(remote_directory(cfg));
    let candidates: Vec<_> = directory
        .peers_with_file(name)
        .await?
        .into_values()
        .filter(|p| p.peer_id != cfg.peer_id)
        .collect();
    let engine = DownloadEngine::new(
        cfg.peer_id.clone(),
        cfg.download_dir(),
        directory,
        fetcher(cfg, use_compression),
    )
    .with_shared_dir(cfg.shared_dir.clone());
    let report = engine.download(name, candidates, fragments).await?;
    println!(
        "{} ({} bytes) in {}ms",
        report.file_name, report.file_size, report.elapsed_millis
    );
    for f in &report.fragments {
        println!(
            "  fragment {} from {} in {}ms",
            f.fragment_index, f.source_peer_id, f.elapsed_millis
        );
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown requested");
    Ok(())
}
