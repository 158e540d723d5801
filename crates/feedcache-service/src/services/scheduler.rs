//! Bounded, prioritized and cancellable media downloads.
//!
//! The scheduler owns the task table, at most one [`DownloadTask`] per [`CacheKey`]. A fixed
//! number of workers is spawned onto the runtime. Whenever a worker slot frees up, the queued
//! task with the highest priority is started, ties going to the task submitted first. Running
//! tasks are never preempted.
//!
//! Cancellation is cooperative. A queued task is dropped right away, a running task has its
//! [`CancellationToken`] triggered and unwinds at its next chunk. Its partial download lives in
//! a temporary file and is deleted on the way out.
//!
//! Failed downloads are never retried here. The next reconciliation pass that still wants the
//! asset requests it again.
//!
//! A finished download is moved into the data directory before the shared lock is taken, and
//! files of evicted entries are deleted after it was released. Under the lock, only the
//! bookkeeping changes, so playback lookups never wait for the file system.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::caching::{CacheDir, CacheEntry, CacheError, CacheFiles, CacheKey, StagedFile};
use crate::config::Config;
use crate::download::{FetchOutcome, MeasureDownloadGuard, MediaFetcher};
use crate::types::Priority;
use crate::utils::http::DownloadTimeouts;

use super::{Resources, SharedResources, lock};

/// The lifecycle state of a [`DownloadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a free worker.
    Queued,
    /// A worker is transferring the media.
    Running,
    /// The transfer finished and was stored.
    Done,
    /// The transfer was cancelled. A running task stays in this state until it has unwound.
    Cancelled,
    /// The transfer or storing it failed.
    Failed,
}

impl AsRef<str> for TaskState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// A single scheduled download.
#[derive(Debug)]
pub struct DownloadTask {
    pub key: CacheKey,
    pub url: Url,
    pub priority: Priority,
    pub state: TaskState,
    cancel: CancellationToken,
    /// Submission order, used to break priority ties and to version the downloaded file.
    seq: u64,
    /// Requested again while its cancellation was still unwinding.
    resubmit: bool,
}

/// All live download tasks, keyed by the asset they download.
///
/// Tasks are removed once they reached a terminal state.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<CacheKey, DownloadTask>,
    next_seq: u64,
}

impl TaskTable {
    pub fn get(&self, key: &CacheKey) -> Option<&DownloadTask> {
        self.tasks.get(key)
    }

    pub fn state(&self, key: &CacheKey) -> Option<TaskState> {
        self.tasks.get(key).map(|task| task.state)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.tasks.keys()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn queued_count(&self) -> usize {
        self.count_state(TaskState::Queued)
    }

    /// The number of tasks occupying a worker, including cancelled ones that are still unwinding.
    pub fn running_count(&self) -> usize {
        self.count_state(TaskState::Running) + self.count_state(TaskState::Cancelled)
    }

    fn count_state(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|task| task.state == state).count()
    }

    fn insert(&mut self, key: CacheKey, url: Url, priority: Priority) {
        self.next_seq += 1;
        let task = DownloadTask {
            key: key.clone(),
            url,
            priority,
            state: TaskState::Queued,
            cancel: CancellationToken::new(),
            seq: self.next_seq,
            resubmit: false,
        };
        self.tasks.insert(key, task);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<DownloadTask> {
        self.tasks.remove(key)
    }

    /// Marks the most urgent queued task as running and returns what its worker needs.
    fn start_next(&mut self) -> Option<Job> {
        let task = self
            .tasks
            .values_mut()
            .filter(|task| task.state == TaskState::Queued)
            .max_by_key(|task| (task.priority, Reverse(task.seq)))?;
        task.state = TaskState::Running;
        Some(Job {
            key: task.key.clone(),
            url: task.url.clone(),
            cancel: task.cancel.clone(),
            version: task.seq,
        })
    }
}

/// What a worker needs to run a [`DownloadTask`].
struct Job {
    key: CacheKey,
    url: Url,
    cancel: CancellationToken,
    version: u64,
}

/// Tuning of the [`DownloadScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// The fixed number of workers. At least one worker always exists.
    pub max_concurrent_downloads: usize,
    /// Deadline for a complete download.
    pub download_timeout: Duration,
    /// Consecutive storage failures after which prefetching is disabled. `0` never disables.
    pub max_storage_failures: usize,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_downloads: config.prefetch.max_concurrent_downloads.max(1),
            download_timeout: DownloadTimeouts::from_config(config).max_download,
            max_storage_failures: config.prefetch.max_storage_failures,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct SchedulerInner<F> {
    fetcher: F,
    resources: SharedResources,
    files: CacheFiles,
    dir: CacheDir,
    options: SchedulerOptions,
    runtime: tokio::runtime::Handle,
}

/// Schedules and runs media downloads into the cache.
///
/// The `*_locked` methods operate on already locked [`Resources`], so that a caller can combine
/// several operations into one atomic step. Newly requested tasks only start on
/// [`pump_locked`](Self::pump_locked), which lets callers enqueue a batch before workers pick
/// the most urgent one.
pub struct DownloadScheduler<F> {
    inner: Arc<SchedulerInner<F>>,
}

impl<F> Clone for DownloadScheduler<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F> std::fmt::Debug for DownloadScheduler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadScheduler")
            .field("dir", &self.inner.dir)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl<F: MediaFetcher> DownloadScheduler<F> {
    pub fn new(
        fetcher: F,
        resources: SharedResources,
        dir: CacheDir,
        options: SchedulerOptions,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let files = lock(&resources).store.files().clone();
        Self {
            inner: Arc::new(SchedulerInner {
                fetcher,
                resources,
                files,
                dir,
                options,
                runtime,
            }),
        }
    }

    pub fn resources(&self) -> &SharedResources {
        &self.inner.resources
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Requests a download of `key` from `url`, see [`request_locked`](Self::request_locked).
    pub fn request(&self, key: &CacheKey, url: &Url, priority: Priority) {
        let mut resources = lock(&self.inner.resources);
        self.request_locked(&mut resources, key, url, priority);
        self.pump_locked(&mut resources);
    }

    /// Cancels the download of `key`, see [`cancel_locked`](Self::cancel_locked).
    pub fn cancel(&self, key: &CacheKey) {
        let mut resources = lock(&self.inner.resources);
        self.cancel_locked(&mut resources, key);
    }

    /// Cancels all downloads.
    pub fn cancel_all(&self) {
        let mut resources = lock(&self.inner.resources);
        self.cancel_all_locked(&mut resources);
    }

    /// Requests a download of `key` from `url` at `priority`.
    ///
    /// This never creates a second task for a key. An existing task only has its priority raised
    /// to `priority` if that is higher. A task that is still unwinding from a cancellation is
    /// resubmitted once it is done. Ready keys are not downloaded again.
    ///
    /// Returns whether a new task was created.
    pub fn request_locked(
        &self,
        resources: &mut Resources,
        key: &CacheKey,
        url: &Url,
        priority: Priority,
    ) -> bool {
        if !resources.enabled || resources.store.has(key) {
            return false;
        }

        if let Some(task) = resources.tasks.tasks.get_mut(key) {
            task.priority = task.priority.max(priority);
            if task.state == TaskState::Cancelled && !task.resubmit {
                tracing::trace!(%key, "download requested again while cancelling");
                task.resubmit = true;
                resources.store.mark_pending(key);
            }
            return false;
        }

        resources.store.mark_pending(key);
        resources.tasks.insert(key.clone(), url.clone(), priority);
        metric!(counter("downloads.requested") += 1);
        true
    }

    /// Cancels the download of `key`.
    ///
    /// A queued task is dropped immediately. A running task is signalled and keeps its worker
    /// until it has unwound. Either way, the pending store entry is dropped right away.
    /// Cancelling a key without a task is a no-op.
    pub fn cancel_locked(&self, resources: &mut Resources, key: &CacheKey) {
        let Some(task) = resources.tasks.tasks.get_mut(key) else {
            return;
        };

        match task.state {
            TaskState::Queued => {
                tracing::trace!(%key, "dropping queued download");
                resources.tasks.remove(key);
                metric!(counter("downloads.cancelled") += 1, "state" => "queued");
            }
            TaskState::Running => {
                tracing::trace!(%key, "cancelling running download");
                task.cancel.cancel();
                task.state = TaskState::Cancelled;
                metric!(counter("downloads.cancelled") += 1, "state" => "running");
            }
            TaskState::Cancelled => task.resubmit = false,
            TaskState::Done | TaskState::Failed => return,
        }

        if resources.store.is_pending(key) {
            resources.store.remove(key);
        }
    }

    /// Cancels every task in the table.
    pub fn cancel_all_locked(&self, resources: &mut Resources) {
        let keys: Vec<_> = resources.tasks.keys().cloned().collect();
        for key in keys {
            self.cancel_locked(resources, &key);
        }
    }

    /// Starts queued tasks while there are free workers.
    pub fn pump_locked(&self, resources: &mut Resources) {
        while resources.tasks.running_count() < self.inner.options.max_concurrent_downloads {
            let Some(job) = resources.tasks.start_next() else {
                break;
            };
            metric!(counter("downloads.started") += 1);
            self.spawn(job);
        }
    }

    /// Turns prefetching off for good, releasing all references and cancelling all tasks.
    pub(crate) fn disable_locked(&self, resources: &mut Resources) {
        resources.enabled = false;
        resources.unpin_all();
        self.cancel_all_locked(resources);
        metric!(counter("prefetch.disabled") += 1);
    }

    fn spawn(&self, job: Job) {
        let scheduler = self.clone();
        let span = tracing::debug_span!("download", key = %job.key, url = %job.url);
        let worker = async move {
            let result = scheduler.download(&job.url, &job.cancel).await;
            let staged = result.and_then(|(temp_file, outcome)| {
                let files = &scheduler.inner.files;
                files.stage(&job.key, job.version, temp_file, outcome.expected_len)
            });
            scheduler.complete(job.key, staged);
        };
        self.inner.runtime.spawn(worker.instrument(span));
    }

    /// Downloads `url` into a temporary file.
    ///
    /// The file is deleted on any error, including cancellation.
    async fn download(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<(NamedTempFile, FetchOutcome), CacheError> {
        let temp_file = self.inner.dir.tempfile()?;
        let mut destination = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);

        let timeout = self.inner.options.download_timeout;
        let measure = MeasureDownloadGuard::new();
        let fetch = self.inner.fetcher.fetch(url, &mut destination, cancel);
        let result = match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        measure.done(&result);

        let outcome = result?;
        destination.flush().await?;

        if let Some(expected) = outcome.expected_len {
            if expected != outcome.bytes_written {
                return Err(CacheError::SizeMismatch {
                    expected,
                    actual: outcome.bytes_written,
                });
            }
        }

        Ok((temp_file, outcome))
    }

    /// Records the result of a worker and hands its slot to the next task.
    ///
    /// Files that are no longer referenced afterwards are deleted once the lock is released.
    fn complete(&self, key: CacheKey, result: Result<StagedFile, CacheError>) {
        let mut leftovers = Leftovers::default();
        self.complete_locked(&mut lock(&self.inner.resources), key, result, &mut leftovers);
        leftovers.delete();
    }

    fn complete_locked(
        &self,
        resources: &mut Resources,
        key: CacheKey,
        result: Result<StagedFile, CacheError>,
        leftovers: &mut Leftovers,
    ) {
        let Some(task) = resources.tasks.remove(&key) else {
            tracing::error!(%key, "finished a download without a task");
            if let Ok(staged) = result {
                leftovers.staged.push(staged);
            }
            return;
        };
        let cancelled = task.state == TaskState::Cancelled;

        let state = match result {
            // the key left the window while the last bytes arrived
            Ok(staged) if cancelled && !task.resubmit => {
                leftovers.staged.push(staged);
                TaskState::Cancelled
            }
            Ok(staged) => {
                tracing::debug!(
                    size = staged.size(),
                    path = %staged.path().display(),
                    "download complete"
                );
                leftovers.entries.extend(resources.store.commit(staged));
                resources.storage_failures = 0;
                TaskState::Done
            }
            Err(CacheError::Cancelled) => {
                tracing::debug!("download cancelled");
                TaskState::Cancelled
            }
            Err(error) => {
                self.fail_locked(resources, &key, error);
                TaskState::Failed
            }
        };
        metric!(counter("downloads.finished") += 1, "state" => state.as_ref());

        if state == TaskState::Cancelled {
            if task.resubmit && resources.enabled {
                resources.store.mark_pending(&key);
                resources.tasks.insert(key, task.url, task.priority);
            } else if resources.store.is_pending(&key) {
                resources.store.remove(&key);
            }
        }

        leftovers.entries.extend(resources.store.evict_if_over_budget());
        self.pump_locked(resources);
    }

    fn fail_locked(&self, resources: &mut Resources, key: &CacheKey, error: CacheError) {
        if error.is_storage() {
            resources.storage_failures += 1;
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                failures = resources.storage_failures,
                "failed to store download"
            );
        } else if error.is_network() {
            tracing::debug!(error = &error as &dyn std::error::Error, "download failed");
        } else {
            tracing::info!(error = &error as &dyn std::error::Error, "discarding download");
        }
        metric!(counter("downloads.failure") += 1, "reason" => error.as_tag());

        resources.store.fail(key, error);

        let max_failures = self.inner.options.max_storage_failures;
        if resources.enabled && max_failures > 0 && resources.storage_failures >= max_failures {
            tracing::error!(
                failures = resources.storage_failures,
                cache_dir = %self.inner.dir.root().display(),
                "disabling prefetching, the cache directory keeps failing"
            );
            self.disable_locked(resources);
        }
    }
}

/// Files collected under the lock, to be deleted once it is released.
#[derive(Debug, Default)]
pub(crate) struct Leftovers {
    pub entries: Vec<CacheEntry>,
    pub staged: Vec<StagedFile>,
}

impl Leftovers {
    pub fn delete(self) {
        for entry in &self.entries {
            entry.delete_file();
        }
        for staged in self.staged {
            staged.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use super::*;
    use crate::caching::{CacheStore, EntryState};
    use crate::download::HttpFetcher;
    use crate::services::testutils::{
        Script, ScriptedFetcher, break_dir, data_files, media_url, tmp_is_empty, wait_until,
    };

    struct Harness<F> {
        _root: tempfile::TempDir,
        dir: CacheDir,
        resources: SharedResources,
        scheduler: DownloadScheduler<F>,
    }

    impl<F: MediaFetcher> Harness<F> {
        fn new(fetcher: F, options: SchedulerOptions, budget: u64) -> Self {
            feedcache_test::setup();
            let root = feedcache_test::tempdir();
            let dir = CacheDir::prepare(root.path(), true).unwrap();
            let store = CacheStore::new(dir.data_dir(), budget);
            let resources = Arc::new(Mutex::new(Resources::new(store, true)));
            let scheduler = DownloadScheduler::new(
                fetcher,
                resources.clone(),
                dir.clone(),
                options,
                tokio::runtime::Handle::current(),
            );
            Self {
                _root: root,
                dir,
                resources,
                scheduler,
            }
        }

        fn resources(&self) -> std::sync::MutexGuard<'_, Resources> {
            lock(&self.resources)
        }

        /// Requests `key` and holds a reference on it, like the controller does.
        fn request_pinned(&self, key: &CacheKey, url: &Url, priority: Priority) {
            let mut resources = self.resources();
            self.scheduler
                .request_locked(&mut resources, key, url, priority);
            resources.pin(key);
            self.scheduler.pump_locked(&mut resources);
        }

        fn is_idle(&self) -> bool {
            self.resources().tasks.is_empty()
        }
    }

    fn options(workers: usize) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrent_downloads: workers,
            download_timeout: Duration::from_secs(5),
            max_storage_failures: 3,
        }
    }

    fn key_for(url: &Url) -> CacheKey {
        CacheKey::for_media(url, crate::types::MediaKind::Video, None)
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            max_download_timeout: Duration::from_secs(7),
            prefetch: crate::config::PrefetchConfig {
                max_concurrent_downloads: 0,
                ..Default::default()
            },
            ..Config::default()
        };

        let options = SchedulerOptions::from_config(&config);
        assert_eq!(
            options.download_timeout,
            DownloadTimeouts::from_config(&config).max_download
        );
        assert_eq!(options.download_timeout, Duration::from_secs(7));
        assert_eq!(options.max_concurrent_downloads, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_dedup() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let gate = Arc::new(Notify::new());
        let url = media_url("a");
        fetcher.script(&url, Script::Gated(gate.clone(), 64));
        let harness = Harness::new(fetcher.clone(), options(3), 1 << 20);
        let key = key_for(&url);

        let requests: Vec<_> = (0..10)
            .map(|_| {
                let scheduler = harness.scheduler.clone();
                let (key, url) = (key.clone(), url.clone());
                tokio::spawn(async move { scheduler.request(&key, &url, Priority(1)) })
            })
            .collect();
        for request in requests {
            request.await.unwrap();
        }

        assert_eq!(harness.resources().tasks.len(), 1);
        assert!(harness.resources().store.is_pending(&key));

        gate.notify_one();
        wait_until(|| harness.resources().store.has(&key)).await;

        assert_eq!(fetcher.calls(&url), 1);
        assert!(harness.is_idle());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let gate = Arc::new(Notify::new());
        let first = media_url("first");
        fetcher.script(&first, Script::Gated(gate.clone(), 16));
        let harness = Harness::new(fetcher.clone(), options(1), 1 << 20);

        harness
            .scheduler
            .request(&key_for(&first), &first, Priority(1));
        wait_until(|| fetcher.started().len() == 1).await;

        let (low, high, mid, also_mid) = (
            media_url("low"),
            media_url("high"),
            media_url("mid"),
            media_url("also-mid"),
        );
        for (url, priority) in [(&low, 1), (&high, 5), (&mid, 3), (&also_mid, 3)] {
            harness
                .scheduler
                .request(&key_for(url), url, Priority(priority));
        }
        assert_eq!(harness.resources().tasks.queued_count(), 4);

        // raising a queued task's priority reorders it
        harness
            .scheduler
            .request(&key_for(&low), &low, Priority(4));

        gate.notify_one();
        wait_until(|| harness.is_idle()).await;

        let started = fetcher.started();
        assert_eq!(
            started,
            vec![
                first.to_string(),
                high.to_string(),
                low.to_string(),
                mid.to_string(),
                also_mid.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_queued() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let gate = Arc::new(Notify::new());
        let (running, queued) = (media_url("running"), media_url("queued"));
        fetcher.script(&running, Script::Gated(gate.clone(), 16));
        let harness = Harness::new(fetcher.clone(), options(1), 1 << 20);

        harness
            .scheduler
            .request(&key_for(&running), &running, Priority(2));
        harness
            .scheduler
            .request(&key_for(&queued), &queued, Priority(1));
        assert_eq!(
            harness.resources().tasks.state(&key_for(&queued)),
            Some(TaskState::Queued)
        );

        harness.scheduler.cancel(&key_for(&queued));
        {
            let resources = harness.resources();
            assert!(!resources.tasks.contains(&key_for(&queued)));
            assert_eq!(resources.store.state(&key_for(&queued)), None);
        }

        gate.notify_one();
        wait_until(|| harness.is_idle()).await;

        assert_eq!(fetcher.started(), vec![running.to_string()]);
        assert!(!harness.resources().store.has(&key_for(&queued)));
    }

    #[tokio::test]
    async fn test_cancel_running() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let url = media_url("hang");
        fetcher.script(&url, Script::Hang(32));
        let harness = Harness::new(fetcher.clone(), options(2), 1 << 20);
        let key = key_for(&url);

        harness.scheduler.request(&key, &url, Priority(1));
        wait_until(|| fetcher.started().len() == 1).await;
        assert_eq!(
            harness.resources().tasks.state(&key),
            Some(TaskState::Running)
        );

        harness.scheduler.cancel(&key);
        assert_eq!(
            harness.resources().tasks.state(&key),
            Some(TaskState::Cancelled)
        );

        wait_until(|| harness.is_idle()).await;
        let resources = harness.resources();
        assert!(!resources.store.has(&key));
        assert_eq!(resources.store.state(&key), None);
        assert_eq!(resources.store.ready_count(), 0);
        assert!(tmp_is_empty(&harness.dir));
    }

    #[tokio::test]
    async fn test_resubmit_after_cancel() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let url = media_url("flapping");
        fetcher.script(&url, Script::Hang(32));
        let harness = Harness::new(fetcher.clone(), options(1), 1 << 20);
        let key = key_for(&url);

        harness.scheduler.request(&key, &url, Priority(1));
        wait_until(|| fetcher.started().len() == 1).await;

        fetcher.script(&url, Script::Serve(32));
        harness.scheduler.cancel(&key);
        harness.scheduler.request(&key, &url, Priority(2));

        // still a single task, waiting for the cancelled transfer to unwind
        assert_eq!(harness.resources().tasks.len(), 1);
        assert!(harness.resources().store.is_pending(&key));

        wait_until(|| harness.resources().store.has(&key)).await;
        assert_eq!(fetcher.calls(&url), 2);
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let url = media_url("short");
        fetcher.script(
            &url,
            Script::Short {
                announced: 100,
                actual: 10,
            },
        );
        let harness = Harness::new(fetcher, options(1), 1 << 20);
        let key = key_for(&url);

        harness.request_pinned(&key, &url, Priority(1));
        wait_until(|| harness.is_idle()).await;

        assert_eq!(
            harness.resources().store.state(&key),
            Some(&EntryState::Failed(CacheError::SizeMismatch {
                expected: 100,
                actual: 10
            }))
        );
        assert!(tmp_is_empty(&harness.dir));
    }

    #[tokio::test]
    async fn test_download_timeout() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let url = media_url("slow");
        fetcher.script(&url, Script::Hang(32));
        let options = SchedulerOptions {
            download_timeout: Duration::from_millis(100),
            ..options(1)
        };
        let harness = Harness::new(fetcher, options, 1 << 20);
        let key = key_for(&url);

        harness.request_pinned(&key, &url, Priority(1));
        wait_until(|| harness.is_idle()).await;

        assert_eq!(
            harness.resources().store.state(&key),
            Some(&EntryState::Failed(CacheError::Timeout(
                Duration::from_millis(100)
            )))
        );
    }

    #[tokio::test]
    async fn test_http_download() {
        let server = feedcache_test::MediaServer::new();
        let fetcher = HttpFetcher::new(
            crate::utils::http::create_client(&Default::default()).unwrap(),
            Default::default(),
        );
        let harness = Harness::new(fetcher, options(2), 1 << 20);

        let found = server.url("/media/1000/clip.mp4");
        let missing = server.url("/status/404");
        harness.request_pinned(&key_for(&found), &found, Priority(2));
        harness.request_pinned(&key_for(&missing), &missing, Priority(1));
        wait_until(|| harness.is_idle()).await;

        let resources = harness.resources();
        let path = resources.store.get(&key_for(&found)).unwrap();
        assert_eq!(
            std::fs::read(path).unwrap(),
            feedcache_test::media_bytes(1000)
        );
        assert_eq!(
            resources.store.state(&key_for(&missing)),
            Some(&EntryState::Failed(CacheError::NotFound))
        );
        assert_eq!(server.hits("/media/1000/clip.mp4"), 1);
    }

    #[tokio::test]
    async fn test_ready_keys_not_downloaded_again() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let url = media_url("once");
        let harness = Harness::new(fetcher.clone(), options(1), 1 << 20);
        let key = key_for(&url);

        harness.scheduler.request(&key, &url, Priority(1));
        wait_until(|| harness.resources().store.has(&key)).await;

        harness.scheduler.request(&key, &url, Priority(9));
        assert!(harness.is_idle());
        assert_eq!(fetcher.calls(&url), 1);
    }

    #[tokio::test]
    async fn test_storage_failures_disable() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let options = SchedulerOptions {
            max_storage_failures: 2,
            ..options(1)
        };
        let harness = Harness::new(fetcher.clone(), options, 1 << 20);
        break_dir(harness.dir.tmp_dir());

        for (failures, name) in [(1, "a"), (2, "b")] {
            let url = media_url(name);
            harness.scheduler.request(&key_for(&url), &url, Priority(1));
            wait_until(|| harness.is_idle()).await;
            let resources = harness.resources();
            assert_eq!(resources.storage_failures, failures);
            assert_eq!(resources.enabled, failures < 2);
        }
        // no temporary file, so nothing was fetched
        assert!(fetcher.started().is_empty());

        let url = media_url("c");
        harness.scheduler.request(&key_for(&url), &url, Priority(1));
        assert!(harness.is_idle());
        assert_eq!(fetcher.calls(&url), 0);
    }

    #[tokio::test]
    async fn test_oversized_media_not_a_storage_failure() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let options = SchedulerOptions {
            max_storage_failures: 1,
            ..options(1)
        };
        let harness = Harness::new(fetcher.clone(), options, 32);
        let (big, small) = (media_url("big"), media_url("small"));
        fetcher.script(&big, Script::Serve(64));

        harness.request_pinned(&key_for(&big), &big, Priority(1));
        wait_until(|| harness.is_idle()).await;
        {
            let resources = harness.resources();
            assert!(resources.enabled);
            assert_eq!(resources.storage_failures, 0);
            assert_eq!(
                resources.store.state(&key_for(&big)),
                Some(&EntryState::Failed(CacheError::TooLarge {
                    size: 64,
                    budget: 32
                }))
            );
        }
        assert!(tmp_is_empty(&harness.dir));
        assert!(data_files(&harness.dir).is_empty());

        harness
            .scheduler
            .request(&key_for(&small), &small, Priority(1));
        wait_until(|| harness.resources().store.has(&key_for(&small))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_files_handled_outside_lock() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let gate = Arc::new(Notify::new());
        let (old, new) = (media_url("old"), media_url("new"));
        fetcher.script(&new, Script::Gated(gate.clone(), 16));
        // room for a single file
        let harness = Harness::new(fetcher.clone(), options(1), 16);

        harness.scheduler.request(&key_for(&old), &old, Priority(1));
        wait_until(|| harness.resources().store.has(&key_for(&old))).await;
        let old_path = harness
            .resources()
            .store
            .get(&key_for(&old))
            .unwrap()
            .to_owned();

        harness.scheduler.request(&key_for(&new), &new, Priority(1));
        wait_until(|| fetcher.calls(&new) == 1).await;

        {
            let resources = harness.resources();
            gate.notify_one();

            // the download lands in the data directory while the lock is held here
            for _ in 0..500 {
                if data_files(&harness.dir).len() == 2 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(data_files(&harness.dir).len(), 2);
            assert!(resources.store.is_pending(&key_for(&new)));
            assert!(resources.store.has(&key_for(&old)));
        }

        wait_until(|| harness.resources().store.has(&key_for(&new))).await;
        assert!(!harness.resources().store.has(&key_for(&old)));
        wait_until(|| !old_path.exists()).await;
        assert_eq!(data_files(&harness.dir).len(), 1);
    }
}
