//! Swarm node: the tokio host for the swarm core. Serving endpoint, fragment fetcher,
//! download engine, directory service and client, peer maintenance loops.

pub mod api;
pub mod config;
pub mod directory_service;
pub mod engine;
pub mod fetch;
pub mod net;
pub mod peer;
pub mod serve;
pub mod sinks;
pub mod store;

pub use api::{ApiError, DirectoryApi, DirectoryResolver, RemoteDirectory, StaticResolver};
pub use engine::{DownloadEngine, DownloadError};
pub use fetch::{FetchError, FragmentFetcher, RetryPolicy};
pub use peer::{Peer, PeerError};
pub use serve::ConnectionGauge;
pub use sinks::{EventSink, ProgressSink, TracingEvents, TracingProgress};
pub use store::SharedFolder;
