use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// The on-disk layout of a cache directory.
///
/// Completed media lives below `data/`, in-flight downloads below `tmp/`. Both directories are
/// created when the cache directory is prepared.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
    data_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl CacheDir {
    /// Prepares the cache directory at `root`.
    ///
    /// When `clear` is set, all previous contents are removed first. Stale temporary files are
    /// always removed.
    pub fn prepare(root: impl Into<PathBuf>, clear: bool) -> io::Result<Self> {
        let root = root.into();
        if clear {
            Self::clear(&root)?;
        }

        let dir = Self {
            data_dir: root.join("data"),
            tmp_dir: root.join("tmp"),
            root,
        };
        std::fs::create_dir_all(&dir.data_dir)?;
        dir.clear_tmp()?;

        Ok(dir)
    }

    /// Removes the cache directory at `root` with all of its contents.
    ///
    /// A directory that does not exist is not an error.
    pub fn clear(root: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(root) {
            Ok(()) => {
                tracing::debug!(path = %root.display(), "cleared cache directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Clear the temporary files.
    ///
    /// Temporary files which survive a hard crash would otherwise never be cleaned up.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding completed media files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The directory holding in-flight downloads.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Create a new temporary file to download into.
    ///
    /// The file is deleted when dropped, unless it is persisted into the data directory.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp_dir) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // somebody removed the directory from under us, recreate it once
                std::fs::create_dir_all(&self.tmp_dir)?;
                tempfile::Builder::new()
                    .prefix("tmp")
                    .tempfile_in(&self.tmp_dir)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_layout() {
        let root = feedcache_test::tempdir();
        let dir = CacheDir::prepare(root.path().join("cache"), true).unwrap();

        assert!(dir.data_dir().is_dir());
        assert!(dir.tmp_dir().is_dir());
        assert_eq!(dir.data_dir(), root.path().join("cache/data"));
        assert_eq!(dir.root(), root.path().join("cache"));
    }

    #[test]
    fn test_clear_on_start() {
        let root = feedcache_test::tempdir();
        let dir = CacheDir::prepare(root.path(), false).unwrap();

        let stale = dir.data_dir().join("stale.mp4");
        std::fs::write(&stale, b"old session").unwrap();
        let leftover = dir.tmp_dir().join("tmp-crashed");
        std::fs::write(&leftover, b"partial").unwrap();

        // without clearing, completed data survives but temp files never do
        let dir = CacheDir::prepare(root.path(), false).unwrap();
        assert!(stale.exists());
        assert!(!leftover.exists());

        CacheDir::prepare(root.path(), true).unwrap();
        assert!(!stale.exists());
        assert!(dir.data_dir().is_dir());
    }

    #[test]
    fn test_clear_missing() {
        let root = feedcache_test::tempdir();
        CacheDir::clear(&root.path().join("does-not-exist")).unwrap();
    }

    #[test]
    fn test_tempfile() {
        let root = feedcache_test::tempdir();
        let dir = CacheDir::prepare(root.path(), true).unwrap();

        let file = dir.tempfile().unwrap();
        assert!(file.path().starts_with(dir.tmp_dir()));

        std::fs::remove_dir_all(dir.tmp_dir()).unwrap();
        let file = dir.tempfile().unwrap();
        assert!(file.path().exists());
    }
}
