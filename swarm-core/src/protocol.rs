//! Swarm message types: the peer fragment protocol and the directory protocol.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::directory::{AuditEntry, DirectoryError, PeerRecord};
use crate::report::FragmentStats;

pub const LIST_FILES: &str = "LIST_FILES";
pub const FILE_INFO: &str = "FILE_INFO";
pub const DOWNLOAD_FRAGMENT: &str = "DOWNLOAD_FRAGMENT";

/// Requests a peer's serving endpoint answers. Encoding: see `codec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    ListFiles,
    FileInfo {
        file_name: String,
    },
    /// `end` is inclusive.
    DownloadFragment {
        file_name: String,
        start: u64,
        end: u64,
        use_compression: bool,
    },
}

impl PeerRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            PeerRequest::ListFiles => RequestKind::ListFiles,
            PeerRequest::FileInfo { .. } => RequestKind::FileInfo,
            PeerRequest::DownloadFragment { .. } => RequestKind::DownloadFragment,
        }
    }
}

/// Request type tag. Responses are untagged, so decoding one needs the kind of
/// request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ListFiles,
    FileInfo,
    DownloadFragment,
}

impl RequestKind {
    pub fn tag(self) -> &'static str {
        match self {
            RequestKind::ListFiles => LIST_FILES,
            RequestKind::FileInfo => FILE_INFO,
            RequestKind::DownloadFragment => DOWNLOAD_FRAGMENT,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            LIST_FILES => Some(RequestKind::ListFiles),
            FILE_INFO => Some(RequestKind::FileInfo),
            DOWNLOAD_FRAGMENT => Some(RequestKind::DownloadFragment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    FileList(Vec<String>),
    /// `None` when the file is not held.
    FileInfo(Option<u64>),
    /// `None` when the file (or the range) is not held. Payload is gzip-compressed
    /// when the request asked for compression.
    Fragment(Option<Vec<u8>>),
}

/// Directory operations as they cross the wire. Encoding: bincode frames (see `wire`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryRequest {
    Register {
        peer_id: String,
        address: String,
        port: u16,
        files: Vec<String>,
    },
    Unregister {
        peer_id: String,
    },
    UpdateFiles {
        peer_id: String,
        files: Vec<String>,
    },
    AddFile {
        peer_id: String,
        file_name: String,
    },
    RemoveFile {
        peer_id: String,
        file_name: String,
    },
    PeersWithFile {
        file_name: String,
    },
    ListPeers,
    ListFiles,
    Heartbeat {
        peer_id: String,
    },
    UpdateLoad {
        peer_id: String,
        active_connections: u32,
    },
    RecordDownloadStart {
        downloader_id: String,
        file_name: String,
        source_peer_ids: Vec<String>,
    },
    RecordDownloadComplete {
        downloader_id: String,
        file_name: String,
        success: bool,
        elapsed_millis: u64,
        fragments: Vec<FragmentStats>,
    },
    ActivityLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryResponse {
    Ok,
    Peers(Vec<PeerRecord>),
    PeerMap(HashMap<String, PeerRecord>),
    Files(BTreeSet<String>),
    Log(Vec<AuditEntry>),
    Error(DirectoryError),
}

impl DirectoryResponse {
    /// Variant name, for "unexpected response" diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryResponse::Ok => "Ok",
            DirectoryResponse::Peers(_) => "Peers",
            DirectoryResponse::PeerMap(_) => "PeerMap",
            DirectoryResponse::Files(_) => "Files",
            DirectoryResponse::Log(_) => "Log",
            DirectoryResponse::Error(_) => "Error",
        }
    }
}
