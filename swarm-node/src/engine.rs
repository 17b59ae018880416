//! Download engine: plan, schedule, fan out one task per fragment, write at offsets, commit.

use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use swarm_core::{
    assign_fragments_to_sources, order_by_load, plan, Assignment, DownloadReport, FragmentOutcome,
    FragmentResult, FragmentStats, PeerRecord,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::DirectoryApi;
use crate::fetch::FragmentFetcher;
use crate::sinks::{EventSink, ProgressSink, TracingEvents, TracingProgress};
use crate::store::PART_SUFFIX;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("'{0}' is already present locally")]
    AlreadyPresent(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no peer holds '{0}'")]
    NoSources(String),
    #[error("no source reported the size of '{0}'")]
    SizeUnknown(String),
    #[error("download of '{}' failed: {} fragment(s) did not arrive", .0.file_name, .0.failures().len())]
    PartialFailure(DownloadReport),
    #[error("local i/o error: {0}")]
    Io(#[from] io::Error),
}

pub struct DownloadEngine {
    peer_id: String,
    download_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    directory: Arc<dyn DirectoryApi>,
    fetcher: FragmentFetcher,
    progress: Arc<dyn ProgressSink>,
    events: Arc<dyn EventSink>,
}

impl DownloadEngine {
    pub fn new(
        peer_id: impl Into<String>,
        download_dir: impl Into<PathBuf>,
        directory: Arc<dyn DirectoryApi>,
        fetcher: FragmentFetcher,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            download_dir: download_dir.into(),
            shared_dir: None,
            directory,
            fetcher,
            progress: Arc::new(TracingProgress),
            events: Arc::new(TracingEvents),
        }
    }

    /// Also treat a file already in `shared_dir` as present, when downloads land elsewhere.
    pub fn with_shared_dir(mut self, shared_dir: impl Into<PathBuf>) -> Self {
        self.shared_dir = Some(shared_dir.into());
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Download `name` from `candidates` in `fragment_count` parallel fragments.
    ///
    /// The file appears at `download_dir/name` only when every fragment arrived; on any
    /// failure nothing is left on disk. Start and completion are recorded in the
    /// directory's activity log whatever the outcome.
    pub async fn download(
        &self,
        name: &str,
        candidates: Vec<PeerRecord>,
        fragment_count: usize,
    ) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();
        let candidates = dedup_by_peer(candidates);
        let source_ids: Vec<String> = candidates.iter().map(|p| p.peer_id.clone()).collect();
        if let Err(e) = self
            .directory
            .record_download_start(&self.peer_id, name, source_ids)
            .await
        {
            warn!(file = %name, error = %e, "could not record download start");
        }

        let result = self.run(name, candidates, fragment_count, started).await;

        let elapsed_millis = elapsed_millis(started);
        let (success, fragments) = match &result {
            Ok(report) => (true, report.fragments.clone()),
            Err(DownloadError::PartialFailure(report)) => (false, report.fragments.clone()),
            Err(_) => (false, Vec::new()),
        };
        if let Err(e) = self
            .directory
            .record_download_complete(&self.peer_id, name, success, elapsed_millis, fragments)
            .await
        {
            warn!(file = %name, error = %e, "could not record download completion");
        }
        match &result {
            Ok(_) => self
                .events
                .on_event(&format!("Download of '{name}' completed in {elapsed_millis}ms")),
            Err(e) => self.events.on_event(&format!("Download of '{name}' failed: {e}")),
        }
        result
    }

    async fn run(
        &self,
        name: &str,
        candidates: Vec<PeerRecord>,
        fragment_count: usize,
        started: Instant,
    ) -> Result<DownloadReport, DownloadError> {
        validate_name(name)?;
        let final_path = self.download_dir.join(name);
        if self.is_present(name).await? {
            return Err(DownloadError::AlreadyPresent(name.to_string()));
        }
        if candidates.is_empty() {
            return Err(DownloadError::NoSources(name.to_string()));
        }
        let ordered = order_by_load(candidates);
        let file_size = self.discover_size(name, &ordered).await?;
        let fragments =
            plan(file_size, fragment_count).map_err(|e| DownloadError::InvalidArgument(e.to_string()))?;
        let assignments = assign_fragments_to_sources(&fragments, ordered)
            .map_err(|_| DownloadError::NoSources(name.to_string()))?;
        info!(
            file = %name,
            file_size,
            fragments = fragments.len(),
            "starting download"
        );

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let part_path = self.download_dir.join(format!("{name}{PART_SUFFIX}"));
        let mut stats = match self
            .fetch_into(&part_path, name, file_size, assignments)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                remove_quietly(&part_path).await;
                return Err(e.into());
            }
        };

        for fragment in &fragments {
            if !stats.iter().any(|s| s.fragment_index == fragment.index) {
                stats.push(FragmentStats {
                    fragment_index: fragment.index,
                    source_peer_id: String::new(),
                    elapsed_millis: 0,
                    error: Some("fragment task did not finish".to_string()),
                });
            }
        }
        let report = DownloadReport::new(name, file_size, elapsed_millis(started), stats);
        if report.success() {
            commit(&part_path, &final_path).await?;
            info!(file = %name, elapsed_ms = report.elapsed_millis, "download complete");
            Ok(report)
        } else {
            remove_quietly(&part_path).await;
            for (index, reason) in report.failures() {
                warn!(file = %name, fragment = index, reason, "fragment failed");
            }
            Err(DownloadError::PartialFailure(report))
        }
    }

    async fn is_present(&self, name: &str) -> io::Result<bool> {
        for dir in std::iter::once(&self.download_dir).chain(&self.shared_dir) {
            if tokio::fs::try_exists(dir.join(name)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Ask candidates in load order for the file size; the first answer wins.
    async fn discover_size(&self, name: &str, ordered: &[PeerRecord]) -> Result<u64, DownloadError> {
        for peer in ordered {
            match self.fetcher.file_size(peer, name).await {
                Ok(Some(size)) => {
                    debug!(file = %name, peer = %peer.peer_id, size, "file size");
                    return Ok(size);
                }
                Ok(None) => debug!(file = %name, peer = %peer.peer_id, "peer does not hold file"),
                Err(e) => debug!(file = %name, peer = %peer.peer_id, error = %e, "file info failed"),
            }
        }
        Err(DownloadError::SizeUnknown(name.to_string()))
    }

    /// Pre-size `part_path`, run one task per assignment and write each fragment at its
    /// offset as it arrives. Returns the stats of every task that finished.
    async fn fetch_into(
        &self,
        part_path: &Path,
        name: &str,
        file_size: u64,
        assignments: Vec<Assignment>,
    ) -> io::Result<Vec<FragmentStats>> {
        let mut file = tokio::fs::File::create(part_path).await?;
        file.set_len(file_size).await?;

        let mut offsets = vec![0u64; assignments.len()];
        let mut tasks = JoinSet::new();
        for assignment in assignments {
            offsets[assignment.fragment.index] = assignment.fragment.start;
            let fetcher = self.fetcher.clone();
            let name = name.to_string();
            tasks.spawn(async move { fetch_with_failover(&fetcher, &name, &assignment).await });
        }

        let mut stats = Vec::with_capacity(offsets.len());
        let mut written = 0u64;
        let mut last_percent = 0u8;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(file = %name, error = %e, "fragment task panicked");
                    continue;
                }
            };
            if let FragmentOutcome::Success(bytes) = &result.outcome {
                file.seek(SeekFrom::Start(offsets[result.fragment_index])).await?;
                file.write_all(bytes).await?;
                written += bytes.len() as u64;
                let percent = (written.saturating_mul(100) / file_size).min(100) as u8;
                if percent > last_percent {
                    last_percent = percent;
                    self.progress.on_progress(percent);
                }
                self.events.on_event(&format!(
                    "Fragment {} of '{name}' received from {} in {}ms",
                    result.fragment_index, result.source_peer_id, result.elapsed_millis
                ));
            }
            stats.push(result.stats());
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(stats)
    }
}

/// Try the primary then each alternate until one delivers the fragment.
async fn fetch_with_failover(
    fetcher: &FragmentFetcher,
    name: &str,
    assignment: &Assignment,
) -> FragmentResult {
    let started = Instant::now();
    let fragment = &assignment.fragment;
    let mut last_source = assignment.primary.peer_id.clone();
    let mut last_error = String::from("no source tried");
    for source in assignment.sources() {
        match fetcher.fetch(source, name, fragment).await {
            Ok(bytes) => {
                return FragmentResult {
                    fragment_index: fragment.index,
                    source_peer_id: source.peer_id.clone(),
                    elapsed_millis: elapsed_millis(started),
                    outcome: FragmentOutcome::Success(bytes),
                }
            }
            Err(e) => {
                warn!(
                    file = %name,
                    fragment = fragment.index,
                    peer = %source.peer_id,
                    error = %e,
                    "source exhausted; failing over"
                );
                last_source = source.peer_id.clone();
                last_error = e.to_string();
            }
        }
    }
    FragmentResult {
        fragment_index: fragment.index,
        source_peer_id: last_source,
        elapsed_millis: elapsed_millis(started),
        outcome: FragmentOutcome::Failure(last_error),
    }
}

/// Names are flat file names inside the download folder.
fn validate_name(name: &str) -> Result<(), DownloadError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.ends_with(PART_SUFFIX)
        || name.contains(|c| c == '/' || c == '\\' || c == '\0');
    if bad {
        return Err(DownloadError::InvalidArgument(format!(
            "'{name}' is not a plain file name"
        )));
    }
    Ok(())
}

fn dedup_by_peer(candidates: Vec<PeerRecord>) -> Vec<PeerRecord> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|p| seen.insert(p.peer_id.clone()))
        .collect()
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Move the finished part file into place. On failure the part file is removed.
async fn commit(part_path: &Path, final_path: &Path) -> io::Result<()> {
    if let Err(e) = tokio::fs::rename(part_path, final_path).await {
        remove_quietly(part_path).await;
        return Err(e);
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_and_part_names() {
        for name in ["", ".", "..", "a/b", "..\\x", "movie.part", "nul\0byte"] {
            assert!(
                matches!(validate_name(name), Err(DownloadError::InvalidArgument(_))),
                "{name:?} accepted"
            );
        }
        assert!(validate_name("report.final.pdf").is_ok());
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("movie.mkv.part");
        std::fs::write(&part, b"bytes").unwrap();
        let unreachable = dir.path().join("gone").join("movie.mkv");
        assert!(commit(&part, &unreachable).await.is_err());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn commit_moves_part_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("movie.mkv.part");
        std::fs::write(&part, b"bytes").unwrap();
        let done = dir.path().join("movie.mkv");
        commit(&part, &done).await.unwrap();
        assert!(!part.exists());
        assert_eq!(std::fs::read(&done).unwrap(), b"bytes");
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut loaded = PeerRecord::new("P1", "10.0.0.1", 5001);
        loaded.active_connections = 9;
        let peers = vec![
            loaded,
            PeerRecord::new("P2", "10.0.0.2", 5002),
            PeerRecord::new("P1", "10.0.0.1", 5001),
        ];
        let unique = dedup_by_peer(peers);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].active_connections, 9);
    }
}
