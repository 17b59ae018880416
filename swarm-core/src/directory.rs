//! Peer directory: registry of live peers, file -> holders index, audit trail.
//!
//! Invariant: every peer id in a file's holder set has a live `PeerRecord`. All
//! removals (explicit unregister and heartbeat eviction) go through
//! `Registry::remove_peer`, which detaches the peer from every holder set in the
//! same critical section.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::protocol::{DirectoryRequest, DirectoryResponse};
use crate::report::FragmentStats;

/// Recommended interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat age after which a peer is evicted (two missed heartbeats).
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Audit entries kept in memory; the oldest are dropped first.
pub const MAX_AUDIT_ENTRIES: usize = 10_000;

/// Most recent entries returned by an `ActivityLog` request.
pub const ACTIVITY_LOG_TAIL: usize = 1_000;

/// Longest stored audit message, in bytes. Longer messages are cut and marked with `...`.
pub const MAX_AUDIT_MESSAGE_LEN: usize = 2_048;

/// A registered peer as the directory sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: String,
    pub port: u16,
    pub last_heartbeat_at: SystemTime,
    pub active_connections: u32,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            port,
            last_heartbeat_at: SystemTime::now(),
            active_connections: 0,
        }
    }

    /// `host:port` suitable for socket address resolution (IPv6 literals bracketed).
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    fn heartbeat_age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_heartbeat_at)
            .unwrap_or(Duration::ZERO)
    }
}

/// One line of the directory's activity log. The log keeps the newest `MAX_AUDIT_ENTRIES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: SystemTime,
    pub message: String,
}

/// Directory operation referencing a peer that is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

#[derive(Debug, Default)]
struct Registry {
    peers: HashMap<String, PeerRecord>,
    files: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn attach_file(&mut self, peer_id: &str, file_name: String) {
        self.files
            .entry(file_name)
            .or_default()
            .insert(peer_id.to_string());
    }

    fn detach_file(&mut self, peer_id: &str, file_name: &str) -> bool {
        let Some(holders) = self.files.get_mut(file_name) else {
            return false;
        };
        let removed = holders.remove(peer_id);
        if holders.is_empty() {
            self.files.remove(file_name);
        }
        removed
    }

    fn detach_all_files(&mut self, peer_id: &str) {
        self.files.retain(|_, holders| {
            holders.remove(peer_id);
            !holders.is_empty()
        });
    }

    fn remove_peer(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(peer_id)?;
        self.detach_all_files(peer_id);
        Some(record)
    }

    fn peer_mut(&mut self, peer_id: &str) -> Result<&mut PeerRecord, DirectoryError> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| DirectoryError::UnknownPeer(peer_id.to_string()))
    }

    fn require_peer(&self, peer_id: &str) -> Result<(), DirectoryError> {
        if self.peers.contains_key(peer_id) {
            Ok(())
        } else {
            Err(DirectoryError::UnknownPeer(peer_id.to_string()))
        }
    }
}

/// Central registry shared by every peer. Mutations take the registry write lock;
/// reads clone a snapshot under the read lock.
#[derive(Debug, Default)]
pub struct Directory {
    registry: RwLock<Registry>,
    audit: Mutex<VecDeque<AuditEntry>>,
}

impl Directory {
    pub fn new() -> Self {
        let directory = Self::default();
        directory.log("Directory service started".to_string());
        directory
    }

    /// Create or replace `peer_id`'s record and advertise `files` for it.
    /// A replaced record's previous advertisements are dropped first.
    pub fn register<I, S>(&self, peer_id: &str, address: &str, port: u16, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let count = {
            let mut registry = self.registry.write();
            registry.remove_peer(peer_id);
            registry
                .peers
                .insert(peer_id.to_string(), PeerRecord::new(peer_id, address, port));
            let mut count = 0usize;
            for name in files {
                registry.attach_file(peer_id, name.into());
                count += 1;
            }
            count
        };
        self.log(format!(
            "Peer connected: {peer_id} at {address}:{port} with {count} files"
        ));
    }

    /// Remove `peer_id` and purge it from every file. Unknown ids are ignored.
    pub fn unregister(&self, peer_id: &str) {
        let removed = self.registry.write().remove_peer(peer_id).is_some();
        if removed {
            self.log(format!("Peer disconnected: {peer_id}"));
        }
    }

    /// Replace the peer's advertised set. Also counts as a heartbeat.
    pub fn update_files<I, S>(&self, peer_id: &str, files: I) -> Result<(), DirectoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let count = {
            let mut registry = self.registry.write();
            registry.peer_mut(peer_id)?.last_heartbeat_at = SystemTime::now();
            registry.detach_all_files(peer_id);
            let mut count = 0usize;
            for name in files {
                registry.attach_file(peer_id, name.into());
                count += 1;
            }
            count
        };
        self.log(format!("Files updated for peer {peer_id}: {count} files"));
        Ok(())
    }

    pub fn add_file(&self, peer_id: &str, file_name: &str) -> Result<(), DirectoryError> {
        {
            let mut registry = self.registry.write();
            registry.require_peer(peer_id)?;
            registry.attach_file(peer_id, file_name.to_string());
        }
        self.log(format!("File added: '{file_name}' by peer {peer_id}"));
        Ok(())
    }

    pub fn remove_file(&self, peer_id: &str, file_name: &str) -> Result<(), DirectoryError> {
        let removed = {
            let mut registry = self.registry.write();
            registry.require_peer(peer_id)?;
            registry.detach_file(peer_id, file_name)
        };
        if removed {
            self.log(format!("File removed: '{file_name}' from peer {peer_id}"));
        }
        Ok(())
    }

    /// Holders of `file_name`, keyed by peer id. Empty when nobody advertises it.
    pub fn peers_with_file(&self, file_name: &str) -> HashMap<String, PeerRecord> {
        let registry = self.registry.read();
        let Some(holders) = registry.files.get(file_name) else {
            return HashMap::new();
        };
        holders
            .iter()
            .filter_map(|id| registry.peers.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }

    /// Every registered peer, ordered by peer id.
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.registry.read().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn list_files(&self) -> BTreeSet<String> {
        self.registry.read().files.keys().cloned().collect()
    }

    pub fn heartbeat(&self, peer_id: &str) -> Result<(), DirectoryError> {
        self.registry.write().peer_mut(peer_id)?.last_heartbeat_at = SystemTime::now();
        Ok(())
    }

    /// Record how many serving connections the peer currently has open.
    pub fn update_load(&self, peer_id: &str, active_connections: u32) -> Result<(), DirectoryError> {
        self.registry.write().peer_mut(peer_id)?.active_connections = active_connections;
        Ok(())
    }

    pub fn record_download_start(&self, downloader_id: &str, file_name: &str, sources: &[String]) {
        self.log(format!(
            "Download started: peer {downloader_id} is downloading '{file_name}' from {}",
            sources.join(", ")
        ));
    }

    pub fn record_download_complete(
        &self,
        downloader_id: &str,
        file_name: &str,
        success: bool,
        elapsed_millis: u64,
        fragments: &[FragmentStats],
    ) {
        if success {
            self.log(format!(
                "Download completed: peer {downloader_id} downloaded '{file_name}' in {elapsed_millis}ms"
            ));
        } else {
            self.log(format!(
                "Download failed: peer {downloader_id} failed to download '{file_name}'"
            ));
        }
        for stats in fragments {
            let outcome = match &stats.error {
                None => "success".to_string(),
                Some(reason) => format!("failed - {reason}"),
            };
            self.log(format!(
                "Fragment {}: from {}, time: {}ms, {outcome}",
                stats.fragment_index, stats.source_peer_id, stats.elapsed_millis
            ));
        }
    }

    /// Every retained entry, oldest first.
    pub fn activity_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().iter().cloned().collect()
    }

    /// The newest `n` entries, oldest first.
    pub fn activity_log_tail(&self, n: usize) -> Vec<AuditEntry> {
        let audit = self.audit.lock();
        audit.iter().skip(audit.len().saturating_sub(n)).cloned().collect()
    }

    /// Evict every peer whose last heartbeat is older than `timeout` at `now`.
    /// Returns the evicted ids.
    pub fn sweep_expired(&self, now: SystemTime, timeout: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .registry
            .read()
            .peers
            .values()
            .filter(|p| p.heartbeat_age(now) > timeout)
            .map(|p| p.peer_id.clone())
            .collect();
        let mut evicted = Vec::with_capacity(candidates.len());
        for peer_id in candidates {
            let removed = {
                let mut registry = self.registry.write();
                // A heartbeat may have landed between the scan and this lock.
                let still_expired = registry
                    .peers
                    .get(&peer_id)
                    .is_some_and(|p| p.heartbeat_age(now) > timeout);
                still_expired && registry.remove_peer(&peer_id).is_some()
            };
            if removed {
                self.log(format!("Peer timed out: {peer_id}"));
                evicted.push(peer_id);
            }
        }
        evicted
    }

    /// Dispatch one wire request to the matching operation.
    pub fn handle(&self, request: DirectoryRequest) -> DirectoryResponse {
        fn done(result: Result<(), DirectoryError>) -> DirectoryResponse {
            match result {
                Ok(()) => DirectoryResponse::Ok,
                Err(e) => DirectoryResponse::Error(e),
            }
        }
        match request {
            DirectoryRequest::Register {
                peer_id,
                address,
                port,
                files,
            } => {
                self.register(&peer_id, &address, port, files);
                DirectoryResponse::Ok
            }
            DirectoryRequest::Unregister { peer_id } => {
                self.unregister(&peer_id);
                DirectoryResponse::Ok
            }
            DirectoryRequest::UpdateFiles { peer_id, files } => {
                done(self.update_files(&peer_id, files))
            }
            DirectoryRequest::AddFile { peer_id, file_name } => {
                done(self.add_file(&peer_id, &file_name))
            }
            DirectoryRequest::RemoveFile { peer_id, file_name } => {
                done(self.remove_file(&peer_id, &file_name))
            }
            DirectoryRequest::PeersWithFile { file_name } => {
                DirectoryResponse::PeerMap(self.peers_with_file(&file_name))
            }
            DirectoryRequest::ListPeers => DirectoryResponse::Peers(self.list_peers()),
            DirectoryRequest::ListFiles => DirectoryResponse::Files(self.list_files()),
            DirectoryRequest::Heartbeat { peer_id } => done(self.heartbeat(&peer_id)),
            DirectoryRequest::UpdateLoad {
                peer_id,
                active_connections,
            } => done(self.update_load(&peer_id, active_connections)),
            DirectoryRequest::RecordDownloadStart {
                downloader_id,
                file_name,
                source_peer_ids,
            } => {
                self.record_download_start(&downloader_id, &file_name, &source_peer_ids);
                DirectoryResponse::Ok
            }
            DirectoryRequest::RecordDownloadComplete {
                downloader_id,
                file_name,
                success,
                elapsed_millis,
                fragments,
            } => {
                self.record_download_complete(
                    &downloader_id,
                    &file_name,
                    success,
                    elapsed_millis,
                    &fragments,
                );
                DirectoryResponse::Ok
            }
            DirectoryRequest::ActivityLog => {
                DirectoryResponse::Log(self.activity_log_tail(ACTIVITY_LOG_TAIL))
            }
        }
    }

    fn log(&self, mut message: String) {
        tracing::info!(target: "swarm::directory", "{message}");
        if message.len() > MAX_AUDIT_MESSAGE_LEN {
            let mut cut = MAX_AUDIT_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("...");
        }
        let mut audit = self.audit.lock();
        if audit.len() == MAX_AUDIT_ENTRIES {
            audit.pop_front();
        }
        audit.push_back(AuditEntry {
            at: SystemTime::now(),
            message,
        });
    }

    #[cfg(test)]
    fn set_last_heartbeat(&self, peer_id: &str, at: SystemTime) {
        if let Some(p) = self.registry.write().peers.get_mut(peer_id) {
            p.last_heartbeat_at = at;
        }
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let registry = self.registry.read();
        registry.files.values().all(|holders| {
            !holders.is_empty() && holders.iter().all(|id| registry.peers.contains_key(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn holders(dir: &Directory, file: &str) -> BTreeSet<String> {
        dir.peers_with_file(file).into_keys().collect()
    }

    #[test]
    fn register_advertises_files() {
        let dir = Directory::new();
        dir.register("p1", "10.0.0.1", 5000, ["a.txt", "b.txt"]);
        let peers = dir.peers_with_file("a.txt");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers["p1"].port, 5000);
        assert_eq!(
            dir.list_files(),
            BTreeSet::from(["a.txt".to_string(), "b.txt".to_string()])
        );
    }

    #[test]
    fn register_twice_is_idempotent() {
        let dir = Directory::new();
        dir.register("p1", "10.0.0.1", 5000, ["a.txt"]);
        let files_once = dir.list_files();
        let holders_once = holders(&dir, "a.txt");
        dir.register("p1", "10.0.0.1", 5000, ["a.txt"]);
        assert_eq!(dir.list_files(), files_once);
        assert_eq!(holders(&dir, "a.txt"), holders_once);
        assert_eq!(dir.list_peers().len(), 1);
    }

    #[test]
    fn reregister_replaces_advertisements() {
        let dir = Directory::new();
        dir.register("p1", "10.0.0.1", 5000, ["a.txt"]);
        dir.register("p1", "10.0.0.2", 5001, ["b.txt"]);
        assert!(dir.peers_with_file("a.txt").is_empty());
        assert_eq!(dir.peers_with_file("b.txt")["p1"].address, "10.0.0.2");
    }

    #[test]
    fn update_files_swaps_advertised_set() {
        let dir = Directory::new();
        dir.register("p1", "10.0.0.1", 5000, ["a.txt"]);
        dir.update_files("p1", ["b.txt"]).unwrap();
        assert!(dir.peers_with_file("a.txt").is_empty());
        assert!(dir.peers_with_file("b.txt").contains_key("p1"));
        assert!(!dir.list_files().contains("a.txt"));
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let dir = Directory::new();
        let unknown = Err(DirectoryError::UnknownPeer("ghost".to_string()));
        assert_eq!(dir.heartbeat("ghost"), unknown.clone());
        assert_eq!(dir.update_files("ghost", ["x"]), unknown.clone());
        assert_eq!(dir.add_file("ghost", "x"), unknown.clone());
        assert_eq!(dir.remove_file("ghost", "x"), unknown.clone());
        assert_eq!(dir.update_load("ghost", 3), unknown);
        assert!(dir.list_files().is_empty());
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let dir = Directory::new();
        dir.register("p1", "10.0.0.1", 5000, ["a.txt"]);
        dir.unregister("ghost");
        assert_eq!(dir.list_peers().len(), 1);
    }

    #[test]
    fn file_disappears_with_last_holder() {
        let dir = Directory::new();
        dir.register("p1", "h", 1, ["shared.bin"]);
        dir.register("p2", "h", 2, ["shared.bin"]);
        dir.remove_file("p1", "shared.bin").unwrap();
        assert_eq!(holders(&dir, "shared.bin"), BTreeSet::from(["p2".to_string()]));
        dir.unregister("p2");
        assert!(dir.list_files().is_empty());
        assert!(dir.index_is_consistent());
    }

    #[test]
    fn sweep_evicts_stale_peers_from_every_file() {
        let dir = Directory::new();
        dir.register("stale", "h", 1, ["a.txt", "b.txt"]);
        dir.register("fresh", "h", 2, ["a.txt"]);
        let now = SystemTime::now();
        dir.set_last_heartbeat("stale", now - Duration::from_secs(90));

        let evicted = dir.sweep_expired(now, DEFAULT_PEER_TIMEOUT);

        assert_eq!(evicted, vec!["stale".to_string()]);
        let ids: Vec<String> = dir.list_peers().into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["fresh".to_string()]);
        assert_eq!(holders(&dir, "a.txt"), BTreeSet::from(["fresh".to_string()]));
        assert!(dir.peers_with_file("b.txt").is_empty());
        assert!(dir
            .activity_log()
            .iter()
            .any(|e| e.message == "Peer timed out: stale"));
    }

    #[test]
    fn sweep_spares_peer_within_timeout() {
        let dir = Directory::new();
        dir.register("p1", "h", 1, ["a.txt"]);
        let later = SystemTime::now() + Duration::from_secs(59);
        assert!(dir.sweep_expired(later, DEFAULT_PEER_TIMEOUT).is_empty());
        let much_later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(dir.sweep_expired(much_later, DEFAULT_PEER_TIMEOUT), vec!["p1"]);
    }

    #[test]
    fn update_load_is_visible_in_snapshots() {
        let dir = Directory::new();
        dir.register("p1", "h", 1, ["a.txt"]);
        dir.update_load("p1", 7).unwrap();
        assert_eq!(dir.peers_with_file("a.txt")["p1"].active_connections, 7);
    }

    #[test]
    fn audit_log_records_download_lifecycle() {
        let dir = Directory::new();
        dir.record_download_start("me", "movie.mkv", &["p1".to_string(), "p2".to_string()]);
        dir.record_download_complete(
            "me",
            "movie.mkv",
            false,
            12,
            &[FragmentStats {
                fragment_index: 0,
                source_peer_id: "p1".to_string(),
                elapsed_millis: 5,
                error: Some("fragment not found".to_string()),
            }],
        );
        let messages: Vec<String> = dir.activity_log().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(
            &"Download started: peer me is downloading 'movie.mkv' from p1, p2".to_string()
        ));
        assert!(messages.contains(&"Download failed: peer me failed to download 'movie.mkv'".to_string()));
        assert!(messages
            .contains(&"Fragment 0: from p1, time: 5ms, failed - fragment not found".to_string()));
    }

    #[test]
    fn audit_log_drops_oldest_past_capacity() {
        let dir = Directory::new();
        for i in 0..MAX_AUDIT_ENTRIES + 5 {
            dir.record_download_start("me", &format!("f{i}"), &["p1".to_string()]);
        }
        let log = dir.activity_log();
        assert_eq!(log.len(), MAX_AUDIT_ENTRIES);
        assert_eq!(
            log[0].message,
            "Download started: peer me is downloading 'f4' from p1"
        );

        let DirectoryResponse::Log(tail) = dir.handle(DirectoryRequest::ActivityLog) else {
            panic!("expected a log");
        };
        assert_eq!(tail.len(), ACTIVITY_LOG_TAIL);
        assert_eq!(tail.last(), log.last());
    }

    #[test]
    fn oversized_audit_messages_are_cut() {
        let dir = Directory::new();
        let sources: Vec<String> = (0..1000).map(|i| format!("peer-{i:04}-é")).collect();
        dir.record_download_start("me", "big.iso", &sources);
        let last = dir.activity_log().pop().unwrap();
        assert!(last.message.len() <= MAX_AUDIT_MESSAGE_LEN + 3);
        assert!(last
            .message
            .starts_with("Download started: peer me is downloading 'big.iso' from peer-0000-é"));
        assert!(last.message.ends_with("..."));
    }

    #[test]
    fn handle_maps_errors_to_responses() {
        let dir = Directory::new();
        let resp = dir.handle(DirectoryRequest::Heartbeat {
            peer_id: "ghost".to_string(),
        });
        assert!(matches!(
            resp,
            DirectoryResponse::Error(DirectoryError::UnknownPeer(id)) if id == "ghost"
        ));
        let resp = dir.handle(DirectoryRequest::Register {
            peer_id: "p1".to_string(),
            address: "h".to_string(),
            port: 1,
            files: vec!["a.txt".to_string()],
        });
        assert!(matches!(resp, DirectoryResponse::Ok));
        match dir.handle(DirectoryRequest::ListFiles) {
            DirectoryResponse::Files(files) => assert!(files.contains("a.txt")),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8, Vec<u8>),
        Unregister(u8),
        UpdateFiles(u8, Vec<u8>),
    }

    fn op() -> impl Strategy<Value = Op> {
        let files = proptest::collection::vec(0u8..6, 0..4);
        prop_oneof![
            (0u8..4, files.clone()).prop_map(|(p, f)| Op::Register(p, f)),
            (0u8..4).prop_map(Op::Unregister),
            (0u8..4, files).prop_map(|(p, f)| Op::UpdateFiles(p, f)),
        ]
    }

    fn names(files: &[u8]) -> Vec<String> {
        files.iter().map(|f| format!("file-{f}")).collect()
    }

    proptest! {
        #[test]
        fn holders_always_have_live_records(ops in proptest::collection::vec(op(), 0..40)) {
            let dir = Directory::new();
            for op in ops {
                match op {
                    Op::Register(p, f) => dir.register(&format!("peer-{p}"), "h", 1, names(&f)),
                    Op::Unregister(p) => dir.unregister(&format!("peer-{p}")),
                    Op::UpdateFiles(p, f) => {
                        let _ = dir.update_files(&format!("peer-{p}"), names(&f));
                    }
                }
                prop_assert!(dir.index_is_consistent());
            }
            let horizon = SystemTime::now() + Duration::from_secs(3600);
            dir.sweep_expired(horizon, DEFAULT_PEER_TIMEOUT);
            prop_assert!(dir.list_peers().is_empty());
            prop_assert!(dir.list_files().is_empty());
        }
    }
}
