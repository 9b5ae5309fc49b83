//! Per-channel output tree and the age-based sweeper that keeps it bounded.
//!
//! The sweeper only looks at modification times. A file the transcoder is
//! still writing is protected solely by the retention threshold exceeding the
//! live window, which [`crate::TvhlsConfig::validate`] enforces.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const SEGMENT_PATTERN: &str = "index%d.ts";

#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.root.join(channel_id)
    }

    pub fn playlist_path(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(PLAYLIST_NAME)
    }

    pub fn segment_pattern(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(SEGMENT_PATTERN)
    }

    pub async fn prepare_channel(&self, channel_id: &str) -> io::Result<PathBuf> {
        let dir = self.channel_dir(channel_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Drops a manifest left behind by an earlier process for this channel.
    pub async fn remove_playlist(&self, channel_id: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(self.playlist_path(channel_id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub fn sweep(&self, retention: Duration) -> SweepReport {
        self.sweep_at(SystemTime::now(), retention)
    }

    /// Removes every `<root>/<channel>/<file>` older than `retention` as of
    /// `now`. Each file is handled on its own; one failure never stops the pass.
    pub fn sweep_at(&self, now: SystemTime, retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.root.exists() {
            return report;
        }

        let walker = WalkDir::new(&self.root).min_depth(2).max_depth(2);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    debug!(%error, "sweeper could not read entry");
                    report.failures += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.scanned += 1;

            let path = entry.path();
            let modified = match entry
                .metadata()
                .map_err(io::Error::from)
                .and_then(|meta| meta.modified())
            {
                Ok(modified) => modified,
                Err(error) => {
                    debug!(path = %path.display(), %error, "sweeper could not stat file");
                    report.failures += 1;
                    continue;
                }
            };
            // Future timestamps yield an error here and are kept.
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age <= retention {
                continue;
            }

            match std::fs::remove_file(path) {
                Ok(()) => {
                    report.removed.push(path.to_path_buf());
                }
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "file rotated away before sweep");
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to remove stale segment");
                    report.failures += 1;
                }
            }
        }

        report
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
    pub failures: usize,
}

/// Periodic driver for [`SegmentStore::sweep`].
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: SegmentStore,
    interval: Duration,
    retention: Duration,
}

impl Sweeper {
    pub fn new(store: SegmentStore, interval: Duration, retention: Duration) -> Self {
        Self {
            store,
            interval,
            retention,
        }
    }

    pub async fn run_once(&self) -> SweepReport {
        let store = self.store.clone();
        let retention = self.retention;
        match tokio::task::spawn_blocking(move || store.sweep(retention)).await {
            Ok(report) => report,
            Err(error) => {
                warn!(%error, "sweep task panicked");
                SweepReport::default()
            }
        }
    }

    /// Sweeps every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the first sweep waits a full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    if !report.removed.is_empty() || report.failures > 0 {
                        info!(
                            scanned = report.scanned,
                            removed = report.removed.len(),
                            failures = report.failures,
                            "segment sweep completed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("segment sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}
