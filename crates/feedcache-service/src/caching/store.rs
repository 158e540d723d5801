use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CacheError, CacheKey};

/// The state of a [`CacheEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// A download for the entry is queued or running.
    Pending,
    /// The entry is backed by a complete, size-verified file.
    Ready,
    /// The last download failed. The entry is not resident.
    Failed(CacheError),
}

/// Bookkeeping of a single asset in the [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// The file backing the entry, only meaningful for ready entries.
    pub local_path: PathBuf,
    /// Size of the file, only meaningful for ready entries.
    pub size_bytes: u64,
    pub state: EntryState,
    /// Access stamp of the last [`touch`](CacheStore::touch), increasing monotonically.
    pub last_access: u64,
    /// Number of holders of the entry. Held entries are never evicted.
    pub ref_count: usize,
}

impl CacheEntry {
    fn new(key: &CacheKey) -> Self {
        Self {
            key: key.clone(),
            local_path: PathBuf::new(),
            size_bytes: 0,
            state: EntryState::Pending,
            last_access: 0,
            ref_count: 0,
        }
    }

    /// Deletes the file of an entry that was removed from its store.
    ///
    /// Only ready entries have a file. This does file-system work and must not run under the
    /// lock guarding the store.
    pub fn delete_file(&self) {
        if self.state != EntryState::Ready {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.local_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %self.local_path.display(),
                    "failed to delete cached media"
                );
            }
        }
    }
}

/// A verified download moved into the data directory, but not yet recorded in the store.
#[derive(Debug)]
#[must_use = "a staged file is either committed or discarded"]
pub struct StagedFile {
    key: CacheKey,
    path: PathBuf,
    size: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Deletes the file again.
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %self.path.display(),
                "failed to discard staged media"
            );
        }
    }
}

/// The file-system side of a [`CacheStore`].
///
/// This can be cloned out of the store and used without holding it, so that the slow parts of
/// storing a download happen outside of the lock guarding the store.
#[derive(Debug, Clone)]
pub struct CacheFiles {
    data_dir: PathBuf,
    budget: u64,
}

impl CacheFiles {
    /// Verifies a completely downloaded `file` and moves it to its place for `key`.
    ///
    /// The size of the file is verified against `expected_size` if one is given, and against the
    /// budget. A file that is larger than the whole budget could never be kept and is rejected
    /// with [`CacheError::TooLarge`]. Each `version` gets its own file, so that a staged file
    /// never replaces the file of an entry that is still being deleted.
    ///
    /// On error, the file is discarded.
    pub fn stage(
        &self,
        key: &CacheKey,
        version: u64,
        file: NamedTempFile,
        expected_size: Option<u64>,
    ) -> Result<StagedFile, CacheError> {
        let actual = file.as_file().metadata()?.len();
        if let Some(expected) = expected_size {
            if expected != actual {
                return Err(CacheError::SizeMismatch { expected, actual });
            }
        }
        if actual > self.budget {
            tracing::debug!(
                %key,
                size = actual,
                budget = self.budget,
                "media exceeds cache budget"
            );
            return Err(CacheError::TooLarge {
                size: actual,
                budget: self.budget,
            });
        }

        let path = self.data_dir.join(key.relative_path(version));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        file.persist(&path).map_err(|e| CacheError::from(e.error))?;

        Ok(StagedFile {
            key: key.clone(),
            path,
            size: actual,
        })
    }
}

/// The metadata of all cached media, and the files they are backed by.
///
/// The store itself is synchronous. It is owned by the prefetch controller and mutated under
/// the same lock as the download scheduler's task table. None of its methods touch the file
/// system: files are placed by [`CacheFiles::stage`] and deleted by
/// [`CacheEntry::delete_file`], both outside of that lock.
///
/// The budget is soft: if every ready entry is held, the store keeps all of them and exceeds
/// the budget until some are released again.
#[derive(Debug)]
pub struct CacheStore {
    files: CacheFiles,
    entries: HashMap<CacheKey, CacheEntry>,
    ready_bytes: u64,
    ready_count: usize,
    access_clock: u64,
}

impl CacheStore {
    /// Creates an empty store placing files below `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, budget: u64) -> Self {
        Self {
            files: CacheFiles {
                data_dir: data_dir.into(),
                budget,
            },
            entries: HashMap::new(),
            ready_bytes: 0,
            ready_count: 0,
            access_clock: 0,
        }
    }

    pub fn files(&self) -> &CacheFiles {
        &self.files
    }

    /// Whether `key` is backed by a ready file.
    pub fn has(&self, key: &CacheKey) -> bool {
        matches!(self.state(key), Some(EntryState::Ready))
    }

    /// Returns the local file of `key`, if it is ready.
    pub fn get(&self, key: &CacheKey) -> Option<&Path> {
        self.entries
            .get(key)
            .filter(|entry| entry.state == EntryState::Ready)
            .map(|entry| entry.local_path.as_path())
    }

    pub fn state(&self, key: &CacheKey) -> Option<&EntryState> {
        self.entries.get(key).map(|entry| &entry.state)
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        matches!(self.state(key), Some(EntryState::Pending))
    }

    /// Returns the full entry of `key`, for diagnostics.
    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn ready_count(&self) -> usize {
        self.ready_count
    }

    pub fn ready_bytes(&self) -> u64 {
        self.ready_bytes
    }

    pub fn pending_count(&self) -> usize {
        self.count(|state| *state == EntryState::Pending)
    }

    pub fn failed_count(&self) -> usize {
        self.count(|state| matches!(state, EntryState::Failed(_)))
    }

    fn count(&self, f: impl Fn(&EntryState) -> bool) -> usize {
        self.entries.values().filter(|entry| f(&entry.state)).count()
    }

    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    /// Records that a download for `key` was requested.
    ///
    /// Absent and failed entries become pending, the reference count is kept. Ready entries
    /// are left untouched.
    pub fn mark_pending(&mut self, key: &CacheKey) {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key));
        if entry.state != EntryState::Ready {
            entry.state = EntryState::Pending;
        }
    }

    /// Records a staged file as the ready copy of its key.
    ///
    /// If the key already had a ready copy, that copy is returned so the caller can delete its
    /// file. This does not evict anything; call
    /// [`evict_if_over_budget`](Self::evict_if_over_budget) afterwards.
    pub fn commit(&mut self, staged: StagedFile) -> Option<CacheEntry> {
        let StagedFile { key, path, size } = staged;
        let stamp = self.tick();
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(&key));

        let replaced = if entry.state == EntryState::Ready {
            self.ready_bytes -= entry.size_bytes;
            self.ready_count -= 1;
            Some(entry.clone())
        } else {
            None
        };
        entry.state = EntryState::Ready;
        entry.local_path = path;
        entry.size_bytes = size;
        entry.last_access = stamp;

        self.ready_bytes += size;
        self.ready_count += 1;

        metric!(histogram("cache.file.size") = size);
        metric!(gauge("cache.ready_bytes") = self.ready_bytes);

        replaced
    }

    /// Marks `key` as most recently used. Returns `false` if the key is not ready.
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        let stamp = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) if entry.state == EntryState::Ready => {
                entry.last_access = stamp;
                true
            }
            _ => false,
        }
    }

    /// Takes a reference on `key`, protecting it from eviction.
    ///
    /// Returns `false` if there is no entry for `key`.
    pub fn pin(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Releases a reference on `key`.
    ///
    /// An unreferenced failed entry is dropped, so that it does not linger in the store.
    pub fn unpin(&mut self, key: &CacheKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 && matches!(entry.state, EntryState::Failed(_)) {
            self.entries.remove(key);
        }
    }

    /// Records a failed download of `key`.
    ///
    /// Unreferenced entries are dropped right away.
    pub fn fail(&mut self, key: &CacheKey, error: CacheError) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.state == EntryState::Ready {
            return;
        }
        if entry.ref_count == 0 {
            self.entries.remove(key);
        } else {
            entry.state = EntryState::Failed(error);
        }
    }

    /// Removes `key` from the store.
    ///
    /// The file of a removed ready entry is left for the caller to
    /// [delete](CacheEntry::delete_file).
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if entry.state == EntryState::Ready {
            self.ready_bytes -= entry.size_bytes;
            self.ready_count -= 1;
            metric!(gauge("cache.ready_bytes") = self.ready_bytes);
        }
        Some(entry)
    }

    /// Evicts unreferenced ready entries in least-recently-used order until the ready bytes are
    /// within budget again.
    ///
    /// Returns the evicted entries, oldest first. Their files still need to be deleted.
    pub fn evict_if_over_budget(&mut self) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while self.ready_bytes > self.files.budget {
            let victim = self
                .entries
                .values()
                .filter(|entry| entry.state == EntryState::Ready && entry.ref_count == 0)
                .min_by_key(|entry| entry.last_access)
                .map(|entry| entry.key.clone());

            let Some(victim) = victim else {
                tracing::debug!(
                    ready_bytes = self.ready_bytes,
                    budget = self.files.budget,
                    "cache over budget, all entries are held"
                );
                metric!(counter("cache.overflow") += 1);
                break;
            };

            tracing::trace!(key = %victim, "evicting cached media");
            evicted.extend(self.remove(&victim));
        }

        if !evicted.is_empty() {
            metric!(counter("cache.evictions") += evicted.len() as i64);
        }
        evicted
    }
}
