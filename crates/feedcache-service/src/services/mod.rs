//! Provides the prefetch services.
//!
//! The [`PrefetchController`] is the single entry point. It owns a [`DownloadScheduler`] and
//! hands out [`PlaybackResolver`]s. All of them share one [`Resources`] value behind a
//! [`Mutex`], which serializes reconciliation passes with download completions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

use crate::caching::{CacheKey, CacheStore};
use crate::config::Config;
use crate::download::HttpFetcher;

pub mod catalog;
pub mod controller;
pub mod resolver;
pub mod scheduler;
pub mod window;

#[cfg(test)]
pub(crate) mod testutils;

pub use catalog::{AssetCatalog, ResolvedAsset};
pub use controller::{PrefetchController, PrefetchStats};
pub use resolver::{PlaybackResolver, PlaybackSource};
pub use scheduler::{DownloadScheduler, SchedulerOptions, TaskState, TaskTable};
pub use window::{PrefetchWindow, WindowOptions, WindowSlot, compute_window};

/// Mutable state shared by the controller, the scheduler's workers and the resolvers.
#[derive(Debug)]
pub struct Resources {
    pub store: CacheStore,
    pub tasks: TaskTable,
    pub catalog: AssetCatalog,
    /// Keys currently referenced by the prefetch window.
    ///
    /// Every key in here holds exactly one reference in the store.
    pub pinned: HashSet<CacheKey>,
    /// Number of storage errors since the last successfully stored download.
    pub storage_failures: usize,
    /// Whether prefetching is active. Once disabled, it stays disabled.
    pub enabled: bool,
}

impl Resources {
    pub fn new(store: CacheStore, enabled: bool) -> Self {
        Self {
            store,
            tasks: TaskTable::default(),
            catalog: AssetCatalog::new(),
            pinned: HashSet::new(),
            storage_failures: 0,
            enabled,
        }
    }

    /// Moves `key` into the pinned set, taking a store reference if it was not pinned before.
    pub(crate) fn pin(&mut self, key: &CacheKey) {
        if !self.pinned.contains(key) && self.store.pin(key) {
            self.pinned.insert(key.clone());
        }
    }

    /// Removes `key` from the pinned set, releasing its store reference.
    pub(crate) fn unpin(&mut self, key: &CacheKey) {
        if self.pinned.remove(key) {
            self.store.unpin(key);
        }
    }

    /// Releases all references held by the prefetch window.
    pub(crate) fn unpin_all(&mut self) {
        for key in std::mem::take(&mut self.pinned) {
            self.store.unpin(&key);
        }
    }
}

/// The shared handle to [`Resources`].
pub type SharedResources = Arc<Mutex<Resources>>;

/// Locks the shared resources, recovering from poisoning.
pub(crate) fn lock(resources: &Mutex<Resources>) -> MutexGuard<'_, Resources> {
    resources.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates a [`PrefetchController`] downloading over HTTP, as configured by `config`.
///
/// Downloads are spawned onto `runtime`.
pub fn create_controller(
    config: &Config,
    runtime: tokio::runtime::Handle,
) -> Result<PrefetchController> {
    let fetcher = HttpFetcher::from_config(config).context("failed to create HTTP client")?;
    Ok(PrefetchController::new(config, fetcher, runtime))
}
