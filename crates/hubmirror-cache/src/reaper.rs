//! Periodic disk-usage reaper.
//!
//! Walks the cache root, and when the total size exceeds the configured
//! limit evicts block containers (never envelopes) until back under it.
//! Containers held open by a live request are skipped, as are files
//! whose last access is inside the grace window; a file that vanishes
//! mid-sweep is fine.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::registry::ContainerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanStrategy {
    /// Evict least-recently-accessed first.
    Lru,
    /// Evict oldest-modified first.
    Fifo,
    /// Evict largest first.
    LargeFirst,
}

impl FromStr for CleanStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(CleanStrategy::Lru),
            "FIFO" => Ok(CleanStrategy::Fifo),
            "LARGE_FIRST" => Ok(CleanStrategy::LargeFirst),
            other => Err(format!("unknown cache clean strategy: {other}")),
        }
    }
}

impl std::fmt::Display for CleanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CleanStrategy::Lru => "LRU",
            CleanStrategy::Fifo => "FIFO",
            CleanStrategy::LargeFirst => "LARGE_FIRST",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Total cache size cap in bytes; `None` disables the reaper.
    pub limit: Option<u64>,
    pub strategy: CleanStrategy,
    pub interval: Duration,
    /// Files accessed more recently than this are never evicted.
    pub grace: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            limit: None,
            strategy: CleanStrategy::Lru,
            interval: Duration::from_secs(60 * 60),
            grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub total_bytes: u64,
    pub removed_files: u64,
    pub removed_bytes: u64,
}

#[derive(Clone)]
pub struct DiskReaper {
    root: PathBuf,
    config: ReaperConfig,
    registry: ContainerRegistry,
}

struct Candidate {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
    modified: SystemTime,
}

impl DiskReaper {
    pub fn new(root: impl Into<PathBuf>, config: ReaperConfig, registry: ContainerRegistry) -> Self {
        Self {
            root: root.into(),
            config,
            registry,
        }
    }

    /// Runs the sweep loop on its own task until the handle is dropped
    /// by process shutdown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaper = self.clone();
                match tokio::task::spawn_blocking(move || reaper.run_once_blocking()).await {
                    Ok(Ok(stats)) if stats.removed_files > 0 => {
                        debug!(
                            removed_files = stats.removed_files,
                            removed_bytes = stats.removed_bytes,
                            total_bytes = stats.total_bytes,
                            "cache sweep evicted files"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "cache sweep failed"),
                    Err(err) => warn!(error = %err, "cache sweep task failed"),
                }
            }
        })
    }

    /// One sweep: no-op without a limit, otherwise evict per strategy
    /// until under it.
    pub fn run_once_blocking(&self) -> std::io::Result<ReapStats> {
        let mut stats = ReapStats::default();
        let Some(limit) = self.config.limit else {
            return Ok(stats);
        };

        let mut total = folder_total_size(&self.root);
        stats.total_bytes = total;
        if total <= limit {
            return Ok(stats);
        }

        let mut candidates = Vec::new();
        for eligible in [self.root.join("files"), self.root.join("lfs").join("files")] {
            collect_files(&eligible, &mut candidates);
        }
        match self.config.strategy {
            CleanStrategy::Lru => candidates.sort_by_key(|c| c.accessed),
            CleanStrategy::Fifo => candidates.sort_by_key(|c| c.modified),
            CleanStrategy::LargeFirst => candidates.sort_by(|a, b| b.size.cmp(&a.size)),
        }

        let now = SystemTime::now();
        for candidate in candidates {
            if total <= limit {
                break;
            }
            if self.registry.is_live(&candidate.path) {
                continue;
            }
            let age = now
                .duration_since(candidate.accessed)
                .unwrap_or(Duration::ZERO);
            if age < self.config.grace {
                continue;
            }
            match std::fs::remove_file(&candidate.path) {
                Ok(()) => {
                    total = total.saturating_sub(candidate.size);
                    stats.removed_files += 1;
                    stats.removed_bytes += candidate.size;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %candidate.path.display(), error = %err, "failed to evict cache file");
                }
            }
        }
        stats.total_bytes = total;
        Ok(stats)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<Candidate>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect_files(&path, out);
        } else if meta.is_file() {
            out.push(Candidate {
                size: meta.len(),
                accessed: meta.accessed().or_else(|_| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }
    }
}

/// Total size in bytes of every regular file under `root`.
pub fn folder_total_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

/// Bumps a file's access time so LRU eviction sees the use. Missing
/// files are ignored.
pub fn touch_access_time(path: &Path) {
    let Ok(file) = std::fs::File::open(path) else {
        return;
    };
    let times = std::fs::FileTimes::new().set_accessed(SystemTime::now());
    if let Err(err) = file.set_times(times) {
        debug!(path = %path.display(), error = %err, "failed to touch access time");
    }
}

/// Parses a human size limit: plain bytes, or `K`/`M`/`G`/`T` suffixes
/// (an optional trailing `B` is accepted).
pub fn parse_size_limit(value: &str) -> Option<u64> {
    let s = value.trim().to_ascii_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);
    let (number, multiplier) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1024u64),
        'M' => (&s[..s.len() - 1], 1024u64.pow(2)),
        'G' => (&s[..s.len() - 1], 1024u64.pow(3)),
        'T' => (&s[..s.len() - 1], 1024u64.pow(4)),
        _ => (s, 1),
    };
    let number: u64 = number.trim().parse().ok()?;
    number.checked_mul(multiplier)
}
