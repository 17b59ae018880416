//! Directory service host: bincode-framed request loop per connection, plus the liveness sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use swarm_core::{Directory, DirectoryRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::net::{read_frame, write_frame, StreamError};

/// A client connection that sends nothing for this long is closed.
pub const DIRECTORY_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Serve directory requests until the listener fails. Each connection may carry any number
/// of request frames; each gets exactly one response frame.
pub async fn run_directory_service(listener: TcpListener, directory: Arc<Directory>) -> std::io::Result<()> {
    serve_directory(listener, directory, DIRECTORY_IDLE_TIMEOUT).await
}

/// As [`run_directory_service`], closing connections idle for `idle`. The same limit
/// applies to writing each response.
pub async fn serve_directory(
    listener: TcpListener,
    directory: Arc<Directory>,
    idle: Duration,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "directory service listening");
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "directory accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, &directory, idle).await {
                warn!(peer = %from, error = %e, "directory connection failed");
            }
        });
    }
}

async fn serve_client(mut stream: TcpStream, directory: &Directory, idle: Duration) -> Result<(), StreamError> {
    loop {
        let next = match timeout(idle, read_frame::<_, DirectoryRequest>(&mut stream)).await {
            Ok(next) => next?,
            Err(_) => {
                debug!(?idle, "closing idle directory connection");
                return Ok(());
            }
        };
        let Some(request) = next else {
            return Ok(());
        };
        debug!(?request, "directory request");
        let response = directory.handle(request);
        timeout(idle, write_frame(&mut stream, &response))
            .await
            .map_err(|_| StreamError::Idle(idle))??;
    }
}

/// Every `interval`, evict peers silent for longer than `timeout`. Never returns.
pub async fn run_liveness_sweep(directory: Arc<Directory>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for peer_id in directory.sweep_expired(SystemTime::now(), timeout) {
            warn!(peer = %peer_id, "evicted peer after missed heartbeats");
        }
    }
}
