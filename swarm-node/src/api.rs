//! Directory access seam. Peers and the download engine talk to `dyn DirectoryApi`, which
//! is either the in-process `Directory` or a TCP client for a remote directory service.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use swarm_core::{
    AuditEntry, Directory, DirectoryError, DirectoryRequest, DirectoryResponse, FragmentStats,
    PeerRecord,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::net::{read_frame, write_frame, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("directory transport: {0}")]
    Stream(#[from] StreamError),
    #[error("directory did not answer in time")]
    Timeout,
    #[error("directory closed the connection without answering")]
    NoAnswer,
    #[error("unexpected directory response: {0}")]
    UnexpectedResponse(&'static str),
}

impl ApiError {
    pub fn is_unknown_peer(&self) -> bool {
        matches!(self, ApiError::Directory(DirectoryError::UnknownPeer(_)))
    }
}

fn expect_ok(response: DirectoryResponse) -> Result<(), ApiError> {
    match response {
        DirectoryResponse::Ok => Ok(()),
        DirectoryResponse::Error(e) => Err(e.into()),
        other => Err(ApiError::UnexpectedResponse(other.kind())),
    }
}

fn unexpected(response: DirectoryResponse) -> ApiError {
    match response {
        DirectoryResponse::Error(e) => e.into(),
        other => ApiError::UnexpectedResponse(other.kind()),
    }
}

/// Every directory operation, expressed over one request/response exchange.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn call(&self, request: DirectoryRequest) -> Result<DirectoryResponse, ApiError>;

    async fn register(
        &self,
        peer_id: &str,
        address: &str,
        port: u16,
        files: Vec<String>,
    ) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::Register {
                peer_id: peer_id.to_string(),
                address: address.to_string(),
                port,
                files,
            })
            .await?,
        )
    }

    async fn unregister(&self, peer_id: &str) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::Unregister {
                peer_id: peer_id.to_string(),
            })
            .await?,
        )
    }

    async fn update_files(&self, peer_id: &str, files: Vec<String>) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::UpdateFiles {
                peer_id: peer_id.to_string(),
                files,
            })
            .await?,
        )
    }

    async fn add_file(&self, peer_id: &str, file_name: &str) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::AddFile {
                peer_id: peer_id.to_string(),
                file_name: file_name.to_string(),
            })
            .await?,
        )
    }

    async fn remove_file(&self, peer_id: &str, file_name: &str) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::RemoveFile {
                peer_id: peer_id.to_string(),
                file_name: file_name.to_string(),
            })
            .await?,
        )
    }

    async fn peers_with_file(&self, file_name: &str) -> Result<HashMap<String, PeerRecord>, ApiError> {
        match self
            .call(DirectoryRequest::PeersWithFile {
                file_name: file_name.to_string(),
            })
            .await?
        {
            DirectoryResponse::PeerMap(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, ApiError> {
        match self.call(DirectoryRequest::ListPeers).await? {
            DirectoryResponse::Peers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn list_files(&self) -> Result<BTreeSet<String>, ApiError> {
        match self.call(DirectoryRequest::ListFiles).await? {
            DirectoryResponse::Files(files) => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    async fn heartbeat(&self, peer_id: &str) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::Heartbeat {
                peer_id: peer_id.to_string(),
            })
            .await?,
        )
    }

    async fn update_load(&self, peer_id: &str, active_connections: u32) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::UpdateLoad {
                peer_id: peer_id.to_string(),
                active_connections,
            })
            .await?,
        )
    }

    async fn record_download_start(
        &self,
        downloader_id: &str,
        file_name: &str,
        source_peer_ids: Vec<String>,
    ) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::RecordDownloadStart {
                downloader_id: downloader_id.to_string(),
                file_name: file_name.to_string(),
                source_peer_ids,
            })
            .await?,
        )
    }

    async fn record_download_complete(
        &self,
        downloader_id: &str,
        file_name: &str,
        success: bool,
        elapsed_millis: u64,
        fragments: Vec<FragmentStats>,
    ) -> Result<(), ApiError> {
        expect_ok(
            self.call(DirectoryRequest::RecordDownloadComplete {
                downloader_id: downloader_id.to_string(),
                file_name: file_name.to_string(),
                success,
                elapsed_millis,
                fragments,
            })
            .await?,
        )
    }

    async fn activity_log(&self) -> Result<Vec<AuditEntry>, ApiError> {
        match self.call(DirectoryRequest::ActivityLog).await? {
            DirectoryResponse::Log(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl DirectoryApi for Directory {
    async fn call(&self, request: DirectoryRequest) -> Result<DirectoryResponse, ApiError> {
        Ok(self.handle(request))
    }
}

/// Where the directory service lives.
#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    async fn resolve(&self) -> io::Result<Vec<SocketAddr>>;
}

/// Resolves a fixed `host:port` through the system resolver on every call.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    authority: String,
}

impl StaticResolver {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }
}

#[async_trait]
impl DirectoryResolver for StaticResolver {
    async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host(&self.authority).await?.collect())
    }
}

/// Client for a remote directory service. One connection per call.
pub struct RemoteDirectory<R = StaticResolver> {
    resolver: R,
    call_timeout: Duration,
}

impl RemoteDirectory<StaticResolver> {
    pub fn connect_to(authority: impl Into<String>, call_timeout: Duration) -> Self {
        Self::new(StaticResolver::new(authority), call_timeout)
    }
}

impl<R: DirectoryResolver> RemoteDirectory<R> {
    pub fn new(resolver: R, call_timeout: Duration) -> Self {
        Self {
            resolver,
            call_timeout,
        }
    }

    async fn open(&self) -> Result<TcpStream, ApiError> {
        let addrs = self.resolver.resolve().await.map_err(StreamError::from)?;
        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "directory address did not resolve");
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "directory connect failed");
                    last_err = e;
                }
            }
        }
        Err(StreamError::Io(last_err).into())
    }
}

#[async_trait]
impl<R: DirectoryResolver> DirectoryApi for RemoteDirectory<R> {
    async fn call(&self, request: DirectoryRequest) -> Result<DirectoryResponse, ApiError> {
        timeout(self.call_timeout, async {
            let mut stream = self.open().await?;
            write_frame(&mut stream, &request).await?;
            match read_frame::<_, DirectoryResponse>(&mut stream).await? {
                Some(response) => Ok(response),
                None => Err(ApiError::NoAnswer),
            }
        })
        .await
        .map_err(|_| ApiError::Timeout)?
    }
}
