//! Source scheduler: assign fragments to peers; order failover candidates.

use std::iter;

use crate::directory::PeerRecord;
use crate::fragment::Fragment;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("no sources hold the file")]
    NoSources,
}

/// A fragment with its primary source and the failover order behind it.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub fragment: Fragment,
    pub primary: PeerRecord,
    /// Every other candidate, least loaded first.
    pub alternates: Vec<PeerRecord>,
}

impl Assignment {
    /// Primary first, then alternates: the order a fetch task walks on failure.
    pub fn sources(&self) -> impl Iterator<Item = &PeerRecord> {
        iter::once(&self.primary).chain(self.alternates.iter())
    }
}

/// Stable sort by ascending `active_connections`; equal load keeps input order,
/// so peers without load information stay in the order they were given.
pub fn order_by_load(mut candidates: Vec<PeerRecord>) -> Vec<PeerRecord> {
    candidates.sort_by_key(|p| p.active_connections);
    candidates
}

/// Round-robin over load-ordered candidates: fragment `i` gets `ordered[i % n]` as
/// primary and the remaining candidates, in the same order, as alternates.
pub fn assign_fragments_to_sources(
    fragments: &[Fragment],
    candidates: Vec<PeerRecord>,
) -> Result<Vec<Assignment>, ScheduleError> {
    if candidates.is_empty() {
        return Err(ScheduleError::NoSources);
    }
    let ordered = order_by_load(candidates);
    Ok(fragments
        .iter()
        .enumerate()
        .map(|(i, fragment)| {
            let pick = i % ordered.len();
            let alternates = ordered
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != pick)
                .map(|(_, p)| p.clone())
                .collect();
            Assignment {
                fragment: *fragment,
                primary: ordered[pick].clone(),
                alternates,
            }
        })
        .collect())
}
