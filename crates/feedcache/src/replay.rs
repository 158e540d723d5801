//! Replays a scripted scroll session against the prefetch controller.
//!
//! A script lists the feed and the positions visited:
//!
//! ```yaml
//! items:
//!   - post_id: intro
//!     media_url: https://cdn.example.com/v/intro.mp4
//!     media_kind: video
//! steps:
//!   - active: 0
//!     direction: forward
//!     wait: 300ms
//! ```
//!
//! After every step, and once more after the settle time, one JSON line with the controller's
//! stats and the playback source of every post is written to the output.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use feedcache_service::config::Config;
use feedcache_service::services::{self, PlaybackSource, PrefetchController, PrefetchStats};
use feedcache_service::types::{FeedItem, PostId, ScrollDirection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct Script {
    pub items: Vec<FeedItem>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct Step {
    /// The active item, or none to leave the feed.
    pub active: Option<usize>,
    #[serde(default)]
    pub direction: ScrollDirection,
    /// Time spent on this position before the next step.
    #[serde(default, with = "humantime_serde")]
    pub wait: Duration,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&script)
    }

    fn parse(script: &str) -> Result<Self> {
        serde_yaml::from_str(script).context("failed to parse replay script")
    }
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    /// The step after which this report was taken, `None` after settling.
    step: Option<usize>,
    active: Option<usize>,
    stats: PrefetchStats,
    sources: Vec<Source<'a>>,
}

#[derive(Debug, Serialize)]
struct Source<'a> {
    post_id: &'a PostId,
    local: bool,
    location: String,
}

/// Runs `script` and writes one report per step to `output`.
pub async fn run(
    config: &Config,
    script: Script,
    settle: Duration,
    mut output: impl Write,
) -> Result<()> {
    let controller = services::create_controller(config, tokio::runtime::Handle::current())?;
    if !controller.is_enabled() {
        tracing::warn!("prefetching is disabled, all posts will resolve remotely");
    }

    let mut active = None;
    for (index, step) in script.steps.iter().enumerate() {
        tracing::info!(step = index, active = ?step.active, "moving feed position");
        active = step.active;
        controller.update_position(active, &script.items, step.direction);
        tokio::time::sleep(step.wait).await;
        report(&mut output, Some(index), active, &controller, &script.items)?;
    }

    tokio::time::sleep(settle).await;
    report(&mut output, None, active, &controller, &script.items)?;

    Ok(())
}

fn report(
    output: &mut impl Write,
    step: Option<usize>,
    active: Option<usize>,
    controller: &PrefetchController,
    items: &[FeedItem],
) -> Result<()> {
    let sources = items
        .iter()
        .map(|item| {
            let (local, location) = match controller.resolve_item(item) {
                PlaybackSource::Local(path) => (true, path.display().to_string()),
                PlaybackSource::Remote(url) => (false, url),
            };
            Source {
                post_id: &item.post_id,
                local,
                location,
            }
        })
        .collect();

    let report = Report {
        step,
        active,
        stats: controller.stats(),
        sources,
    };
    serde_json::to_writer(&mut *output, &report).context("failed to write report")?;
    writeln!(output)?;
    Ok(())
}
