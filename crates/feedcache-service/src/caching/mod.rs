//! # Feedcache caching infrastructure
//!
//! Media for the posts around the active feed position is fetched ahead of time and kept in a
//! session-scoped file-system cache. This module contains the pieces of that cache which do not
//! depend on the network: the stable [`CacheKey`], our central [`CacheError`] type, the on-disk
//! [`CacheDir`] layout and the [`CacheStore`] bookkeeping.
//!
//! ## Layout
//!
//! A cache directory contains two sub-directories:
//!
//! - `data/` holds completed, size-verified media files, addressed by
//!   [`CacheKey::relative_path`].
//! - `tmp/` holds in-flight downloads. Files there are written through a
//!   [`NamedTempFile`](tempfile::NamedTempFile) and atomically moved into `data/` once complete,
//!   so a file under `data/` is never partial.
//!
//! Moving and deleting files is done by [`CacheFiles`] and [`CacheEntry::delete_file`], without
//! holding the lock that guards the [`CacheStore`]. The store only records the outcome.
//!
//! No manifest is written. The whole directory is wiped when a controller starts, unless this is
//! disabled with `clear_on_start`.
//!
//! ## Entry lifecycle
//!
//! An entry is created [`Pending`](EntryState::Pending) when a download is requested. It becomes
//! [`Ready`](EntryState::Ready) once the downloaded file was verified and persisted, or
//! [`Failed`](EntryState::Failed) when the download did not succeed. Cancelled downloads simply
//! drop their entry.
//!
//! Entries inside the active prefetch window carry a non-zero reference count and are never
//! evicted. All other ready entries are evicted in least-recently-used order once the configured
//! budget is exceeded.
//!
//! ### Metrics
//!
//! - `cache.evictions`: The number of ready entries deleted to get back under budget.
//! - `cache.overflow`: Budget checks which could not free enough space because everything was
//!   pinned.
//! - `cache.ready_bytes`: A gauge of the bytes held by ready entries, sent after every change.
//! - `cache.file.size`: A histogram of the sizes of newly persisted files.

mod cache_error;
mod cache_key;
mod dir;
mod store;

pub use cache_error::CacheError;
pub use cache_key::{CacheKey, CacheKeyBuilder, normalize_url};
pub use dir::CacheDir;
pub use store::{CacheEntry, CacheFiles, CacheStore, EntryState, StagedFile};
