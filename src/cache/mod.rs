//! Durable cache of commit resolutions
//!
//! One JSON mapping of sha to its resolved file list, with `"*"` marking
//! commits that stayed unresolvable after fetching. The mapping is
//! loaded whole at process start and written back whole at the end of a
//! run; single writer, whole-file replace.
//!
//! # Error Handling
//!
//! Loading is best-effort: an unreadable cache file falls back to an
//! empty cache with a warning, never an aborted run. The data will be
//! regenerated, at the cost of re-running git. Flushing does surface
//! errors, since losing a run's resolutions is worth telling the user
//! about.

use crate::git_ops::CommitFileSet;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};

/// File the resolution mapping persists to, under the cache directory.
pub const CACHE_FILE: &str = "commit_files.json";

const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

/// Durable sha → file-list store consulted before any git resolution.
///
/// The unresolved marker and the concrete mappings live in the same map:
/// a sha whose entry is `CommitFileSet::Unresolved` is permanently
/// failed and is never resolved again in a later run.
pub struct ResolutionCache {
    path: PathBuf,
    entries: HashMap<String, CommitFileSet>,
}

impl ResolutionCache {
    /// Load the cache from `path`, falling back to an empty cache when
    /// the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let entries = match read_entries(path) {
            Ok(Some(entries)) => {
                report_age(path, entries.len());
                entries
            }
            Ok(None) => {
                eprintln!("  No resolution cache at {} yet", path.display());
                HashMap::new()
            }
            Err(err) => {
                preserve_corrupt_cache(path);
                eprintln!(
                    "  Warning: resolution cache at {} was unreadable ({}). Starting empty.",
                    path.display(),
                    err
                );
                HashMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// The resolved file set for `sha`, if one was ever recorded.
    pub fn lookup_files(&self, sha: &str) -> Option<&CommitFileSet> {
        self.entries.get(sha)
    }

    /// Record the outcome of resolving `sha`. Concrete entries are never
    /// overwritten by later unresolved outcomes.
    pub fn record_files(&mut self, sha: &str, files: CommitFileSet) {
        if files.is_unresolved() {
            if let Some(CommitFileSet::Files(_)) = self.entries.get(sha) {
                return;
            }
        }
        self.entries.insert(sha.to_string(), files);
    }

    /// Whether `sha` failed permanently in this or an earlier run.
    pub fn is_known_unresolved(&self, sha: &str) -> bool {
        matches!(self.entries.get(sha), Some(CommitFileSet::Unresolved))
    }

    /// Mark `sha` as permanently unresolvable.
    pub fn mark_unresolved(&mut self, sha: &str) {
        self.record_files(sha, CommitFileSet::Unresolved);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the full mapping back to durable storage.
    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = lock(&self.path, true)?;
        let content = serde_json::to_string(&self.entries)?;
        write_atomic(&self.path, &content)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<Option<HashMap<String, CommitFileSet>>> {
    if !path.exists() {
        return Ok(None);
    }
    let _lock = lock(path, false)?;
    let content = fs::read_to_string(path)?;
    let entries = serde_json::from_str(&content)?;
    Ok(Some(entries))
}

fn report_age(path: &Path, entry_count: usize) {
    let modified = fs::metadata(path).and_then(|meta| meta.modified());
    if let Ok(modified) = modified {
        let modified: DateTime<Utc> = modified.into();
        eprintln!(
            "  Loaded {} cached resolutions from {} ({} old)",
            entry_count,
            path.display(),
            pretty_age(Utc::now() - modified)
        );
    }
}

/// Keep a copy of an unreadable cache file next to the original so a
/// bad run doesn't destroy evidence of what went wrong.
fn preserve_corrupt_cache(path: &Path) {
    let corrupt_path = path.with_extension("json.corrupt");
    let _ = fs::rename(path, &corrupt_path);
}

/// Render a duration as "2 days, 3 hours" the way humans read cache
/// staleness. Sub-second ages come out as "0 seconds".
fn pretty_age(age: Duration) -> String {
    fn pluralize(number: i64, unit: &str) -> String {
        format!("{} {}{}", number, unit, if number != 1 { "s" } else { "" })
    }

    let total_seconds = age.num_seconds().max(0);
    let (minutes, seconds) = (total_seconds / 60, total_seconds % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    let (days, hours) = (hours / 24, hours % 24);

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(pluralize(days, "day"));
    }
    if hours > 0 {
        parts.push(pluralize(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(pluralize(minutes, "minute"));
    }
    if seconds > 0 {
        parts.push(pluralize(seconds, "second"));
    }

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(", ")
    }
}

struct CacheLock {
    file: fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Take the inter-process lock guarding the cache file, with bounded
/// retry. Shared for reads, exclusive for the whole-file replace.
fn lock(cache_path: &Path, exclusive: bool) -> Result<CacheLock> {
    let lock_path = cache_path.with_extension("lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false) // Lock file content doesn't matter, just the lock
        .open(&lock_path)?;

    let start = Instant::now();
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match result {
            Ok(()) => break,
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                if start.elapsed() >= StdDuration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                    return Err(anyhow::anyhow!(
                        "Timed out waiting for cache lock ({}s)",
                        CACHE_LOCK_TIMEOUT_SECS
                    ));
                }
                std::thread::sleep(StdDuration::from_millis(CACHE_LOCK_RETRY_MS));
            }
        }
    }

    Ok(CacheLock { file })
}

/// Write content to a temp file and rename it into place so readers
/// never observe a half-written cache.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
