//! Peer serving endpoint: one request and one response per TCP connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swarm_core::{compression, decode_request, encode_response, PeerRequest, PeerResponse};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::net::{read_message, write_message, StreamError};
use crate::store::SharedFolder;

/// Requests are tag + name + fixed fields; anything bigger is not a request.
const MAX_REQUEST_LEN: usize = 256 * 1024;

/// How long a client may take to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a client may leave a response unread before the connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts open serving connections; reported to the directory as load.
#[derive(Debug, Default, Clone)]
pub struct ConnectionGauge(Arc<AtomicU32>);

impl ConnectionGauge {
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    fn enter(&self) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(self.0.clone())
    }
}

struct ConnectionGuard(Arc<AtomicU32>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept connections forever, each on its own task. A failed connection is logged
/// and dropped; it never stops the loop.
pub async fn run_serving(
    listener: TcpListener,
    store: Arc<SharedFolder>,
    gauge: ConnectionGauge,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "serving endpoint listening");
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let store = store.clone();
        let guard = gauge.enter();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = handle_connection(stream, &store).await {
                warn!(peer = %from, error = %e, "serving connection failed");
            }
        });
    }
}

pub async fn handle_connection(mut stream: TcpStream, store: &SharedFolder) -> Result<(), StreamError> {
    let request = tokio::time::timeout(
        REQUEST_TIMEOUT,
        read_message(&mut stream, MAX_REQUEST_LEN, REQUEST_TIMEOUT, decode_request),
    )
    .await
    .map_err(|_| timed_out("request not received in time"))??;
    let response = respond(request, store).await?;
    let bytes = encode_response(&response)?;
    send_response(&mut stream, &bytes, WRITE_TIMEOUT).await
}

/// Write the whole response and close our half, within `limit`.
async fn send_response<W>(writer: &mut W, bytes: &[u8], limit: Duration) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, async {
        write_message(writer, bytes).await?;
        writer.shutdown().await?;
        Ok::<_, StreamError>(())
    })
    .await
    .map_err(|_| timed_out("response not taken in time"))?
}

fn timed_out(what: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, what)
}

/// Handler table: one arm per request type.
pub async fn respond(request: PeerRequest, store: &SharedFolder) -> Result<PeerResponse, StreamError> {
    match request {
        PeerRequest::ListFiles => Ok(PeerResponse::FileList(store.names())),
        PeerRequest::FileInfo { file_name } => {
            let size = store.size_of(&file_name).await;
            if size.is_none() {
                debug!(file = %file_name, "file info for unknown file");
            }
            Ok(PeerResponse::FileInfo(size))
        }
        PeerRequest::DownloadFragment {
            file_name,
            start,
            end,
            use_compression,
        } => {
            let Some(data) = store.read_range(&file_name, start, end).await? else {
                debug!(file = %file_name, start, end, "fragment not held");
                return Ok(PeerResponse::Fragment(None));
            };
            let raw_len = data.len();
            let payload = if use_compression {
                tokio::task::spawn_blocking(move || compression::gzip(&data))
                    .await
                    .map_err(std::io::Error::other)??
            } else {
                data
            };
            debug!(
                file = %file_name,
                start,
                end,
                raw_len,
                sent = payload.len(),
                "sending fragment"
            );
            Ok(PeerResponse::Fragment(Some(payload)))
        }
    }
}
