//! A running peer: serves its shared folder, keeps its directory entry alive, downloads.

use std::sync::Arc;
use std::time::Duration;

use swarm_core::{DownloadReport, PeerRecord};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::api::{ApiError, DirectoryApi};
use crate::engine::{DownloadEngine, DownloadError};
use crate::serve::{run_serving, ConnectionGauge};
use crate::store::SharedFolder;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("directory: {0}")]
    Directory(#[from] ApiError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

pub struct Peer {
    id: String,
    address: String,
    port: u16,
    store: Arc<SharedFolder>,
    directory: Arc<dyn DirectoryApi>,
    engine: DownloadEngine,
    gauge: ConnectionGauge,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        store: Arc<SharedFolder>,
        directory: Arc<dyn DirectoryApi>,
        engine: DownloadEngine,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            store,
            directory,
            engine,
            gauge: ConnectionGauge::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &SharedFolder {
        &self.store
    }

    /// Register with the directory, advertising the folder's current contents.
    pub async fn announce(&self) -> Result<(), ApiError> {
        let files = self.store.names();
        info!(peer = %self.id, files = files.len(), port = self.port, "registering with directory");
        self.directory
            .register(&self.id, &self.address, self.port, files)
            .await
    }

    /// Serve the shared folder on `listener` until it fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        run_serving(listener, self.store.clone(), self.gauge.clone()).await
    }

    /// Heartbeat plus current load every `interval`. A directory that has forgotten this
    /// peer (restart or eviction) gets a fresh registration.
    pub async fn run_heartbeat(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = match self.directory.heartbeat(&self.id).await {
                Ok(()) => self.directory.update_load(&self.id, self.gauge.current()).await,
                Err(e) => Err(e),
            };
            self.recover(result, "heartbeat").await;
        }
    }

    /// Re-read the shared folder every `interval` and publish its contents.
    pub async fn run_rescan(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let files = match self.store.rescan().await {
                Ok(files) => files,
                Err(e) => {
                    warn!(peer = %self.id, error = %e, "shared folder rescan failed");
                    continue;
                }
            };
            debug!(peer = %self.id, files = files.len(), "rescanned shared folder");
            let result = self.directory.update_files(&self.id, files).await;
            self.recover(result, "file update").await;
        }
    }

    async fn recover(&self, result: Result<(), ApiError>, what: &'static str) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_unknown_peer() => {
                warn!(peer = %self.id, "directory no longer knows this peer; re-registering");
                if let Err(e) = self.announce().await {
                    warn!(peer = %self.id, error = %e, "re-registration failed");
                }
            }
            Err(e) => warn!(peer = %self.id, error = %e, "{what} failed"),
        }
    }

    /// Download `name` from every other peer that advertises it, then advertise it ourselves.
    pub async fn fetch_and_advertise(
        &self,
        name: &str,
        fragment_count: usize,
    ) -> Result<DownloadReport, PeerError> {
        let candidates: Vec<PeerRecord> = self
            .directory
            .peers_with_file(name)
            .await?
            .into_values()
            .filter(|p| p.peer_id != self.id)
            .collect();
        let report = self.engine.download(name, candidates, fragment_count).await?;
        match self.store.rescan().await {
            Ok(files) if files.iter().any(|f| f == name) => {
                if let Err(e) = self.directory.add_file(&self.id, name).await {
                    warn!(peer = %self.id, file = %name, error = %e, "could not advertise download");
                }
            }
            Ok(_) => debug!(file = %name, "download folder is not shared; not advertising"),
            Err(e) => warn!(peer = %self.id, error = %e, "shared folder rescan failed"),
        }
        Ok(report)
    }

    /// Remove this peer from the directory.
    pub async fn leave(&self) -> Result<(), ApiError> {
        info!(peer = %self.id, "unregistering from directory");
        self.directory.unregister(&self.id).await
    }
}
