//! Reconciliation of the cache with the prefetch window.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::caching::{CacheDir, CacheKey, CacheStore};
use crate::config::{Config, PrefetchConfig};
use crate::download::{HttpFetcher, MediaFetcher};
use crate::types::{FeedItem, PostId, ScrollDirection};

use super::resolver::{PlaybackResolver, PlaybackSource};
use super::scheduler::{DownloadScheduler, Leftovers, SchedulerOptions};
use super::window::{PrefetchWindow, WindowOptions, compute_window};
use super::{Resources, SharedResources, lock};

/// A snapshot of the controller's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub ready_count: usize,
    pub ready_bytes: u64,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub enabled: bool,
}

/// Keeps the media around the active feed position resident.
///
/// On every [`update_position`](Self::update_position), the prefetch window is recomputed and
/// the cache is reconciled with it: assets leaving the window are released and their downloads
/// cancelled, new assets are requested by priority, and resident assets are kept from eviction.
pub struct PrefetchController<F: MediaFetcher = HttpFetcher> {
    options: WindowOptions,
    resources: SharedResources,
    /// `None` if the cache directory could not be prepared.
    scheduler: Option<DownloadScheduler<F>>,
    generation: AtomicU64,
}

impl<F: MediaFetcher> std::fmt::Debug for PrefetchController<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchController")
            .field("options", &self.options)
            .field("scheduler", &self.scheduler)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<F: MediaFetcher> PrefetchController<F> {
    /// Creates a controller caching into the configured cache directory.
    ///
    /// If there is no cache directory configured, or it cannot be prepared, the controller is
    /// created with prefetching disabled. Every post then resolves to its remote URL.
    pub fn new(config: &Config, fetcher: F, runtime: tokio::runtime::Handle) -> Self {
        let prefetch = &config.prefetch;
        let dir = match config.cache_dir.as_deref() {
            Some(root) => match CacheDir::prepare(root, config.clear_on_start) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        cache_dir = %root.display(),
                        "failed to prepare cache directory, prefetching is disabled"
                    );
                    None
                }
            },
            None => {
                tracing::info!("no cache directory configured, prefetching is disabled");
                None
            }
        };

        let store = match &dir {
            Some(dir) => CacheStore::new(dir.data_dir(), prefetch.cache_budget_bytes),
            None => CacheStore::new(std::path::PathBuf::new(), prefetch.cache_budget_bytes),
        };
        let resources = Arc::new(Mutex::new(Resources::new(store, dir.is_some())));

        let scheduler = dir.map(|dir| {
            DownloadScheduler::new(
                fetcher,
                resources.clone(),
                dir,
                SchedulerOptions::from_config(config),
                runtime,
            )
        });

        Self::log_config(prefetch);

        Self {
            options: WindowOptions::from(prefetch),
            resources,
            scheduler,
            generation: AtomicU64::new(0),
        }
    }

    fn log_config(prefetch: &PrefetchConfig) {
        tracing::debug!(
            forward_count = prefetch.forward_count,
            backward_count = prefetch.backward_count,
            max_concurrent_downloads = prefetch.max_concurrent_downloads,
            cache_budget_bytes = prefetch.cache_budget_bytes,
            "created prefetch controller"
        );
    }

    /// Updates the active feed position and reconciles the cache with it.
    ///
    /// `active_index` is `None` when no item is active, which releases the whole window. Calls
    /// may come from several threads, a call that was overtaken by a newer one before it got to
    /// reconcile is skipped.
    pub fn update_position(
        &self,
        active_index: Option<usize>,
        items: &[FeedItem],
        direction: ScrollDirection,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let window = compute_window(active_index, items, direction, &self.options);

        let mut leftovers = Leftovers::default();
        {
            let mut guard = lock(&self.resources);
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::trace!(generation, "skipping superseded position update");
                metric!(counter("prefetch.coalesced") += 1);
                return;
            }
            let resources = &mut *guard;

            resources.catalog.observe(items, generation);

            if let Some(scheduler) = self.scheduler.as_ref().filter(|_| resources.enabled) {
                reconcile(scheduler, resources, &window, &mut leftovers);
            }

            let store = &resources.store;
            resources
                .catalog
                .prune(generation, |key| store.entry(key).is_some());
        }
        leftovers.delete();

        metric!(counter("prefetch.reconcile") += 1);
    }

    /// Returns a resolver sharing this controller's cache.
    pub fn resolver(&self) -> PlaybackResolver {
        PlaybackResolver::new(self.resources.clone())
    }

    /// See [`PlaybackResolver::resolve`].
    pub fn resolve(&self, post_id: &PostId) -> Option<PlaybackSource> {
        self.resolver().resolve(post_id)
    }

    /// See [`PlaybackResolver::resolve_item`].
    pub fn resolve_item(&self, item: &FeedItem) -> PlaybackSource {
        self.resolver().resolve_item(item)
    }

    /// See [`PlaybackResolver::is_cached`].
    pub fn is_cached(&self, post_id: &PostId) -> bool {
        self.resolver().is_cached(post_id)
    }

    /// The number of resident assets.
    pub fn preloaded_count(&self) -> usize {
        lock(&self.resources).store.ready_count()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.resources).enabled
    }

    pub fn stats(&self) -> PrefetchStats {
        let resources = lock(&self.resources);
        PrefetchStats {
            ready_count: resources.store.ready_count(),
            ready_bytes: resources.store.ready_bytes(),
            pending: resources.store.pending_count(),
            running: resources.tasks.running_count(),
            failed: resources.store.failed_count(),
            enabled: resources.enabled,
        }
    }

    /// Cancels all downloads and releases the window.
    ///
    /// Resident assets stay resolvable. A later position update starts prefetching again.
    pub fn release(&self) {
        let mut guard = lock(&self.resources);
        let resources = &mut *guard;
        resources.unpin_all();
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel_all_locked(resources);
        }
    }

    pub(crate) fn resources(&self) -> &SharedResources {
        &self.resources
    }
}

impl<F: MediaFetcher> Drop for PrefetchController<F> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Brings the pinned set and the download tasks in line with `window`.
fn reconcile<F: MediaFetcher>(
    scheduler: &DownloadScheduler<F>,
    resources: &mut Resources,
    window: &PrefetchWindow,
    leftovers: &mut Leftovers,
) {
    // A retained asset is only kept if it is resident or in flight already.
    let retained = window.retained().filter(|asset| {
        resources.store.has(&asset.key) || resources.tasks.contains(&asset.key)
    });
    let wanted: HashSet<&CacheKey> = window
        .slots()
        .iter()
        .map(|slot| &slot.asset.key)
        .chain(retained.map(|asset| &asset.key))
        .collect();

    let leaving: HashSet<CacheKey> = resources
        .pinned
        .iter()
        .chain(resources.tasks.keys())
        .filter(|key| !wanted.contains(key))
        .cloned()
        .collect();
    for key in &leaving {
        resources.unpin(key);
        scheduler.cancel_locked(resources, key);
    }

    // Request most urgent first. Workers only start once the whole window is queued.
    for slot in window.slots() {
        let key = &slot.asset.key;
        if !resources.store.has(key) {
            scheduler.request_locked(resources, key, &slot.asset.url, slot.priority);
        }
        resources.pin(key);
    }

    // Touch least urgent first, so that the most urgent asset is the most recently used one.
    for slot in window.slots().iter().rev() {
        resources.store.touch(&slot.asset.key);
    }
    if let Some(asset) = retained {
        resources.pin(&asset.key);
        resources.store.touch(&asset.key);
    }

    let evicted = resources.store.evict_if_over_budget();
    if !evicted.is_empty() {
        tracing::debug!(count = evicted.len(), "evicted cached media");
    }
    leftovers.entries.extend(evicted);
    scheduler.pump_locked(resources);

    tracing::trace!(
        window = window.len(),
        pinned = resources.pinned.len(),
        tasks = resources.tasks.len(),
        ready_bytes = resources.store.ready_bytes(),
        "reconciled prefetch window"
    );
}
