//! Per-fragment results and the aggregate download report.

use serde::{Deserialize, Serialize};

/// What one fragment task ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Success(Vec<u8>),
    Failure(String),
}

/// Terminal result of one fragment task, across all sources it tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentResult {
    pub fragment_index: usize,
    /// The source that delivered the bytes, or the last one tried on failure.
    pub source_peer_id: String,
    pub elapsed_millis: u64,
    pub outcome: FragmentOutcome,
}

impl FragmentResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FragmentOutcome::Success(_))
    }

    /// Payload-free projection for reports and the directory audit log.
    pub fn stats(&self) -> FragmentStats {
        FragmentStats {
            fragment_index: self.fragment_index,
            source_peer_id: self.source_peer_id.clone(),
            elapsed_millis: self.elapsed_millis,
            error: match &self.outcome {
                FragmentOutcome::Success(_) => None,
                FragmentOutcome::Failure(reason) => Some(reason.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentStats {
    pub fragment_index: usize,
    pub source_peer_id: String,
    pub elapsed_millis: u64,
    /// `None` on success, otherwise the terminal failure reason.
    pub error: Option<String>,
}

impl FragmentStats {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of every fragment of one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub file_name: String,
    pub file_size: u64,
    pub elapsed_millis: u64,
    /// Ordered by fragment index.
    pub fragments: Vec<FragmentStats>,
}

impl DownloadReport {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        elapsed_millis: u64,
        mut fragments: Vec<FragmentStats>,
    ) -> Self {
        fragments.sort_by_key(|s| s.fragment_index);
        Self {
            file_name: file_name.into(),
            file_size,
            elapsed_millis,
            fragments,
        }
    }

    /// True iff there is at least one fragment and every fragment succeeded.
    pub fn success(&self) -> bool {
        !self.fragments.is_empty() && self.fragments.iter().all(FragmentStats::success)
    }

    /// `(fragment_index, reason)` for every failed fragment.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.fragments
            .iter()
            .filter_map(|s| s.error.as_deref().map(|e| (s.fragment_index, e)))
            .collect()
    }
}
