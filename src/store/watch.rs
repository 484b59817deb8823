//! Polling change detection for the watched data paths.
//!
//! Each watched path is reduced to a fingerprint (names, sizes and mtimes for
//! directories; size, mtime and content hash for files). A poll compares the
//! current fingerprints with the last ones seen and reports which data kinds
//! changed.
//!
//! Writes issued by the strategy itself are bracketed with
//! [`ChangeWatcher::begin_self_write`] / [`ChangeWatcher::finish_self_write`].
//! The write generation is bumped before the bytes hit the disk and the
//! resulting fingerprint is recorded against that generation, so a poll that
//! sees exactly that fingerprint treats the change as self-inflicted. A path
//! that already differs from its last fingerprint when a write begins was
//! changed by someone else first; that change is latched and reported by the
//! next poll even though the write then overwrites the fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;
use walkdir::WalkDir;

use crate::state::events::DataKinds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint(u64);

#[derive(Debug, Clone)]
struct WatchTarget {
    kind: DataKinds,
    path: PathBuf,
    recursive: bool,
    last: Option<Fingerprint>,
}

#[derive(Debug, Default)]
pub struct ChangeWatcher {
    targets: Vec<WatchTarget>,
    /// Bumped before every self-inflicted write
    write_generation: u64,
    /// Highest generation whose write has been absorbed by a poll
    acknowledged_generation: u64,
    /// Fingerprint left behind by the latest self-inflicted write
    self_written: Option<(u64, PathBuf, Fingerprint)>,
    /// External changes found while a self-inflicted write began
    pending: DataKinds,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch a path for one data kind; a kind may have several paths
    pub fn watch(&mut self, kind: DataKinds, path: &Path, recursive: bool) {
        self.targets.retain(|t| t.kind != kind || t.path != path);
        let last = fingerprint(path, recursive);
        self.targets.push(WatchTarget {
            kind,
            path: path.to_path_buf(),
            recursive,
            last,
        });
    }

    pub fn unwatch(&mut self, kind: DataKinds) {
        self.targets.retain(|t| t.kind != kind);
    }

    #[cfg(test)]
    pub(crate) fn watched_path(&self, kind: DataKinds) -> Option<&Path> {
        self.targets
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.path.as_path())
    }

    pub fn write_generation(&self) -> u64 {
        self.write_generation
    }

    /// Announce a write the strategy is about to issue to `path`
    pub fn begin_self_write(&mut self, path: &Path) -> u64 {
        for target in self.targets.iter().filter(|t| t.path == path) {
            if fingerprint(&target.path, target.recursive) != target.last {
                debug!(path = %target.path.display(), kind = %target.kind, "external change ahead of self write");
                self.pending |= target.kind;
            }
        }
        self.write_generation += 1;
        self.write_generation
    }

    /// Record what the write for `generation` left on disk
    pub fn finish_self_write(&mut self, generation: u64, path: &Path) {
        let recursive = self
            .targets
            .iter()
            .find(|t| t.path == path)
            .map(|t| t.recursive)
            .unwrap_or(false);
        if let Some(print) = fingerprint(path, recursive) {
            self.self_written = Some((generation, path.to_path_buf(), print));
        }
    }

    /// Compare every watched path with its last fingerprint
    pub fn poll(&mut self) -> DataKinds {
        let mut changed = std::mem::take(&mut self.pending);

        for target in &mut self.targets {
            let current = fingerprint(&target.path, target.recursive);
            if current == target.last {
                continue;
            }
            target.last = current;

            let self_inflicted = match (&self.self_written, current) {
                (Some((generation, path, print)), Some(now)) => {
                    *generation > self.acknowledged_generation
                        && *path == target.path
                        && *print == now
                }
                _ => false,
            };

            if self_inflicted {
                if let Some((generation, _, _)) = &self.self_written {
                    self.acknowledged_generation = *generation;
                }
                debug!(path = %target.path.display(), "ignoring self-inflicted change");
                continue;
            }

            debug!(path = %target.path.display(), kind = %target.kind, "external change detected");
            changed |= target.kind;
        }

        changed
    }
}

fn fingerprint(path: &Path, recursive: bool) -> Option<Fingerprint> {
    let metadata = fs::metadata(path).ok()?;
    let mut hasher = DefaultHasher::new();

    if metadata.is_dir() {
        let depth = if recursive { usize::MAX } else { 1 };
        let mut entries: Vec<(String, u64, u128)> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let relative = e.path().strip_prefix(path).ok()?.to_string_lossy().to_string();
                Some((relative, meta.len(), modified_nanos(&meta)))
            })
            .collect();
        entries.sort();
        entries.hash(&mut hasher);
    } else {
        metadata.len().hash(&mut hasher);
        modified_nanos(&metadata).hash(&mut hasher);
        fs::read(path).ok()?.hash(&mut hasher);
    }

    Some(Fingerprint(hasher.finish()))
}

fn modified_nanos(metadata: &fs::Metadata) -> u128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
