//! Fragment fetcher: one peer, one request per connection, bounded retries.

use std::time::Duration;

use swarm_core::{
    compression, decode_response, encode_request, Fragment, PeerRecord, PeerRequest,
    PeerResponse, RequestKind,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::net::{read_message, write_message, StreamError};

/// Cap for list / info responses.
const MAX_CONTROL_RESPONSE: usize = 16 * 1024 * 1024;

/// Attempts against a single source, with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Per-attempt failure. These are retried and failed over, never shown to the end caller.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("fragment not found on peer {0}")]
    FragmentNotFound(String),
    #[error("peer answered with the wrong response type")]
    UnexpectedResponse,
    #[error("expected {expected} bytes, got {actual}")]
    ShortPayload { expected: u64, actual: u64 },
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FragmentFetcher {
    connect_timeout: Duration,
    read_timeout: Duration,
    retry: RetryPolicy,
    use_compression: bool,
}

impl FragmentFetcher {
    /// Read timeout is twice the connect timeout. It limits each wait for data,
    /// not the transfer as a whole.
    pub fn new(connect_timeout: Duration, retry: RetryPolicy, use_compression: bool) -> Self {
        Self {
            connect_timeout,
            read_timeout: connect_timeout * 2,
            retry,
            use_compression,
        }
    }

    /// Fetch `fragment` of `file_name` from `peer`, retrying the same peer per the policy.
    pub async fn fetch(
        &self,
        peer: &PeerRecord,
        file_name: &str,
        fragment: &Fragment,
    ) -> Result<Vec<u8>, FetchError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once(peer, file_name, fragment).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < attempts => {
                    debug!(
                        peer = %peer.peer_id,
                        fragment = fragment.index,
                        attempt,
                        error = %e,
                        "fragment attempt failed; retrying"
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        peer: &PeerRecord,
        file_name: &str,
        fragment: &Fragment,
    ) -> Result<Vec<u8>, FetchError> {
        let expected = fragment.len();
        let request = PeerRequest::DownloadFragment {
            file_name: file_name.to_string(),
            start: fragment.start,
            end: fragment.end,
            use_compression: self.use_compression,
        };
        // gzip never grows a payload by more than a small fraction plus its header.
        let limit = usize::try_from(expected + expected / 64 + 1024).unwrap_or(usize::MAX);
        let payload = match self.exchange(peer, &request, limit).await? {
            PeerResponse::Fragment(Some(payload)) => payload,
            PeerResponse::Fragment(None) => {
                return Err(FetchError::FragmentNotFound(peer.peer_id.clone()))
            }
            _ => return Err(FetchError::UnexpectedResponse),
        };
        let data = if self.use_compression {
            tokio::task::spawn_blocking(move || compression::gunzip(&payload, expected))
                .await
                .map_err(|e| FetchError::Decompress(std::io::Error::other(e)))?
                .map_err(FetchError::Decompress)?
        } else {
            payload
        };
        if data.len() as u64 != expected {
            return Err(FetchError::ShortPayload {
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Single-attempt `FILE_INFO`. `Ok(None)` when the peer does not hold the file.
    pub async fn file_size(&self, peer: &PeerRecord, file_name: &str) -> Result<Option<u64>, FetchError> {
        let request = PeerRequest::FileInfo {
            file_name: file_name.to_string(),
        };
        match self.exchange(peer, &request, MAX_CONTROL_RESPONSE).await? {
            PeerResponse::FileInfo(size) => Ok(size),
            _ => Err(FetchError::UnexpectedResponse),
        }
    }

    /// Single-attempt `LIST_FILES`.
    pub async fn list_files(&self, peer: &PeerRecord) -> Result<Vec<String>, FetchError> {
        match self
            .exchange(peer, &PeerRequest::ListFiles, MAX_CONTROL_RESPONSE)
            .await?
        {
            PeerResponse::FileList(names) => Ok(names),
            _ => Err(FetchError::UnexpectedResponse),
        }
    }

    async fn exchange(
        &self,
        peer: &PeerRecord,
        request: &PeerRequest,
        limit: usize,
    ) -> Result<PeerResponse, FetchError> {
        let endpoint = peer.endpoint();
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| FetchError::Timeout("connect"))?
            .map_err(|e| FetchError::Connect(endpoint.clone(), e))?;
        let bytes = encode_request(request).map_err(StreamError::from)?;
        let kind: RequestKind = request.kind();
        timeout(self.read_timeout, write_message(&mut stream, &bytes))
            .await
            .map_err(|_| FetchError::Timeout("write"))??;
        let response = read_message(&mut stream, limit, self.read_timeout, |buf| {
            decode_response(kind, buf)
        })
        .await
        .map_err(|e| match e {
            StreamError::Idle(_) => FetchError::Timeout("read"),
            other => FetchError::Stream(other),
        })?;
        Ok(response)
    }
}
