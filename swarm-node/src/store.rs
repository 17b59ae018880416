//! Shared folder: the flat set of files a peer serves and advertises.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Suffix of in-progress downloads; never served or advertised.
pub const PART_SUFFIX: &str = ".part";

pub struct SharedFolder {
    root: PathBuf,
    files: RwLock<HashMap<String, PathBuf>>,
}

impl SharedFolder {
    /// Open (creating if needed) `root` and index its regular files.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let folder = Self {
            root: root.into(),
            files: RwLock::new(HashMap::new()),
        };
        tokio::fs::create_dir_all(&folder.root).await?;
        folder.rescan().await?;
        Ok(folder)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-read the folder. Subdirectories, non-UTF-8 names and partial downloads are skipped.
    /// Returns the sorted names now indexed.
    pub async fn rescan(&self) -> io::Result<Vec<String>> {
        let mut found = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(PART_SUFFIX) {
                continue;
            }
            found.insert(name, entry.path());
        }
        *self.files.write() = found;
        Ok(self.names())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.files.read().get(name).cloned()
    }

    /// Current on-disk size, or `None` if the file is not indexed or has vanished.
    pub async fn size_of(&self, name: &str) -> Option<u64> {
        let path = self.path_of(name)?;
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    /// Positioned read of `[start, end]` (inclusive), clamped to the file's length.
    /// `Ok(None)` when the file is not held or `start` lies at or past its end.
    pub async fn read_range(&self, name: &str, start: u64, end: u64) -> io::Result<Option<Vec<u8>>> {
        let Some(path) = self.path_of(name) else {
            return Ok(None);
        };
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if start >= len || end < start {
            return Ok(None);
        }
        let last = end.min(len - 1);
        let want = last - start + 1;
        file.seek(SeekFrom::Start(start)).await?;
        let mut out = Vec::with_capacity(want as usize);
        file.take(want).read_to_end(&mut out).await?;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn folder_with(files: &[(&str, &str)]) -> (tempfile::TempDir, SharedFolder) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let folder = SharedFolder::open(dir.path()).await.unwrap();
        (dir, folder)
    }

    #[tokio::test]
    async fn indexes_plain_files_only() {
        let (dir, folder) = folder_with(&[("a.txt", "hello"), ("b.bin.part", "xx")]).await;
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        folder.rescan().await.unwrap();
        assert_eq!(folder.names(), vec!["a.txt".to_string()]);
        assert_eq!(folder.size_of("a.txt").await, Some(5));
        assert_eq!(folder.size_of("b.bin.part").await, None);
    }

    #[tokio::test]
    async fn reads_inclusive_ranges() {
        let (_dir, folder) = folder_with(&[("digits", "0123456789")]).await;
        assert_eq!(
            folder.read_range("digits", 2, 5).await.unwrap(),
            Some(b"2345".to_vec())
        );
        assert_eq!(
            folder.read_range("digits", 8, 100).await.unwrap(),
            Some(b"89".to_vec())
        );
        assert_eq!(folder.read_range("digits", 10, 12).await.unwrap(), None);
        assert_eq!(folder.read_range("digits", 5, 4).await.unwrap(), None);
        assert_eq!(folder.read_range("missing", 0, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rescan_picks_up_new_files() {
        let (dir, folder) = folder_with(&[]).await;
        assert!(folder.names().is_empty());
        std::fs::write(dir.path().join("late.txt"), b"x").unwrap();
        assert_eq!(folder.rescan().await.unwrap(), vec!["late.txt".to_string()]);
        assert!(folder.contains("late.txt"));
    }
}
