//! Fragment planner: split a file into contiguous byte ranges of near-equal size.

use serde::{Deserialize, Serialize};

/// One contiguous byte range of a file. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fragment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Fragment {
    /// Number of bytes covered. Never zero for planner output.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Rejected planner input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Split `file_size` bytes into at most `fragment_count` fragments.
/// The first `file_size % fragment_count` fragments carry one extra byte; zero-sized
/// fragments (only possible when `fragment_count > file_size`) are omitted and the
/// survivors are indexed densely from 0.
pub fn plan(file_size: u64, fragment_count: usize) -> Result<Vec<Fragment>, PlanError> {
    if file_size == 0 {
        return Err(PlanError::InvalidArgument("file size must be positive"));
    }
    if fragment_count == 0 {
        return Err(PlanError::InvalidArgument("fragment count must be positive"));
    }
    let count = fragment_count as u64;
    let base = file_size / count;
    let remainder = file_size % count;
    let mut out = Vec::with_capacity(count.min(file_size) as usize);
    let mut start = 0u64;
    for i in 0..count {
        let size = base + u64::from(i < remainder);
        if size == 0 {
            // Every later fragment is zero-sized too.
            break;
        }
        out.push(Fragment {
            index: out.len(),
            start,
            end: start + size - 1,
        });
        start += size;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(fragments: &[Fragment]) -> Vec<(u64, u64)> {
        fragments.iter().map(|f| (f.start, f.end)).collect()
    }

    #[test]
    fn one_megabyte_in_four() {
        let fragments = plan(1_000_000, 4).unwrap();
        assert_eq!(
            ranges(&fragments),
            vec![
                (0, 249_999),
                (250_000, 499_999),
                (500_000, 749_999),
                (750_000, 999_999)
            ]
        );
    }

    #[test]
    fn remainder_goes_to_leading_fragments() {
        let fragments = plan(10, 3).unwrap();
        let sizes: Vec<u64> = fragments.iter().map(Fragment::len).collect();
        let offsets: Vec<u64> = fragments.iter().map(|f| f.start).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(offsets, vec![0, 4, 7]);
    }

    #[test]
    fn more_fragments_than_bytes_drops_empty_ones() {
        let fragments = plan(3, 8).unwrap();
        assert_eq!(ranges(&fragments), vec![(0, 0), (1, 1), (2, 2)]);
        let indices: Vec<usize> = fragments.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn single_fragment_spans_file() {
        let fragments = plan(42, 1).unwrap();
        assert_eq!(ranges(&fragments), vec![(0, 41)]);
    }

    #[test]
    fn rejects_empty_file_and_zero_count() {
        assert!(matches!(plan(0, 4), Err(PlanError::InvalidArgument(_))));
        assert!(matches!(plan(100, 0), Err(PlanError::InvalidArgument(_))));
    }

    proptest! {
        #[test]
        fn fragments_tile_the_file(file_size in 1u64..5_000_000, count in 1usize..64) {
            prop_assume!(count as u64 <= file_size);
            let fragments = plan(file_size, count).unwrap();
            prop_assert_eq!(fragments.len(), count);
            prop_assert_eq!(fragments[0].start, 0);
            prop_assert_eq!(fragments[fragments.len() - 1].end, file_size - 1);
            for pair in fragments.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].start);
            }
            let min = fragments.iter().map(Fragment::len).min().unwrap();
            let max = fragments.iter().map(Fragment::len).max().unwrap();
            prop_assert!(max - min <= 1);
            let total: u64 = fragments.iter().map(Fragment::len).sum();
            prop_assert_eq!(total, file_size);
        }
    }
}
