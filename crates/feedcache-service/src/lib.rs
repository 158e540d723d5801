//! Media prefetching for a vertically scrolling short-form video feed.
//!
//! The crate decides which media assets around the active feed position are fetched ahead of
//! time, stores them in a session-scoped file-system cache and answers the playback surface's
//! question "where are the bytes for this post?".
//!
//! The main entry point is [`PrefetchController`](services::PrefetchController), created through
//! [`services::create_controller`].

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
