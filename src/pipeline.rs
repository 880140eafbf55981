//! Correlation pipeline
//!
//! Walks the failure records once: extract traceback files, resolve the
//! commit's modified files through the cache, and compute the per-record
//! match verdict. Resolution failures are sentinels, not errors; a
//! record that cannot be processed warns and the loop moves on.

use crate::cache::ResolutionCache;
use crate::git_ops::{CommitFileSet, ResolveCommit};
use crate::record::{FailureRecord, RecordOutcome};
use crate::stack_match::modified_in_stack;
use crate::traceback::TracebackExtractor;
use anyhow::Result;

/// Progress is reported every this many records.
const PROGRESS_INTERVAL: usize = 100;

/// Correlate each failure record with the files its commit modified.
///
/// The cache is consulted before the resolver and updated after it; the
/// caller flushes the cache when the run is done.
pub fn correlate<R: ResolveCommit>(
    records: &[FailureRecord],
    extractor: &TracebackExtractor,
    resolver: &R,
    cache: &mut ResolutionCache,
    anchor: &str,
) -> Vec<RecordOutcome> {
    let total = records.len();
    let mut outcomes = Vec::with_capacity(total);

    for (i, record) in records.iter().enumerate() {
        if total > PROGRESS_INTERVAL && i % PROGRESS_INTERVAL == 0 {
            eprintln!("  Processing record {}/{}", i + 1, total);
        }

        let traceback_files = extractor.extract_opt(record.failure_text.as_deref());
        let modified = modified_files_for(record, resolver, cache, anchor);
        let matched = match &modified {
            Some(files) => modified_in_stack(&traceback_files, files),
            None => None,
        };

        outcomes.push(RecordOutcome {
            sha: record.sha.clone(),
            pr_number: record.pr_number,
            test_file: record.test_file.clone(),
            traceback_files,
            matched,
        });
    }

    outcomes
}

/// The modified-file list for a record's sha, through the cache.
///
/// A sha that failed even after fetching stays failed: it is skipped in
/// this and every later run without touching git again.
fn modified_files_for<R: ResolveCommit>(
    record: &FailureRecord,
    resolver: &R,
    cache: &mut ResolutionCache,
    anchor: &str,
) -> Option<Vec<String>> {
    if cache.is_known_unresolved(&record.sha) {
        return None;
    }
    if let Some(CommitFileSet::Files(files)) = cache.lookup_files(&record.sha) {
        return Some(files.clone());
    }

    let resolved = match resolve_with_retry(record, resolver, anchor) {
        Ok(resolved) => resolved,
        Err(err) => {
            // Leave the cache untouched so the next run can try again.
            eprintln!("  Warning: could not resolve {}: {:#}", record.sha, err);
            return None;
        }
    };

    match resolved {
        CommitFileSet::Files(files) => {
            cache.record_files(&record.sha, CommitFileSet::Files(files.clone()));
            Some(files)
        }
        CommitFileSet::Unresolved => {
            cache.record_files(&record.sha, CommitFileSet::Unresolved);
            cache.mark_unresolved(&record.sha);
            None
        }
    }
}

/// Resolve once; on `Unresolved`, fetch the commit and try exactly once
/// more. A failed fetch is reported but the retry still happens.
fn resolve_with_retry<R: ResolveCommit>(
    record: &FailureRecord,
    resolver: &R,
    anchor: &str,
) -> Result<CommitFileSet> {
    let first = resolver.resolve(&record.sha, record.pr_number, anchor)?;
    if !first.is_unresolved() {
        return Ok(first);
    }

    eprintln!("  Fetching commit {}", record.sha);
    if let Err(err) = resolver.fetch_commit(&record.sha) {
        eprintln!("  Warning: fetch of {} failed: {:#}", record.sha, err);
    }
    resolver.resolve(&record.sha, record.pr_number, anchor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CACHE_FILE;
    use crate::config::Config;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Scripted resolver: returns the queued outcomes in order and
    /// records every call.
    struct ScriptedResolver {
        outcomes: RefCell<Vec<CommitFileSet>>,
        resolve_calls: RefCell<Vec<String>>,
        fetch_calls: RefCell<Vec<String>>,
    }

    impl ScriptedResolver {
        fn new(outcomes: Vec<CommitFileSet>) -> Self {
            Self {
                outcomes: RefCell::new(outcomes),
                resolve_calls: RefCell::new(Vec::new()),
                fetch_calls: RefCell::new(Vec::new()),
            }
        }

        fn resolve_count(&self) -> usize {
            self.resolve_calls.borrow().len()
        }
    }

    impl ResolveCommit for ScriptedResolver {
        fn resolve(&self, sha: &str, _pr_number: i64, _anchor: &str) -> Result<CommitFileSet> {
            self.resolve_calls.borrow_mut().push(sha.to_string());
            let mut outcomes = self.outcomes.borrow_mut();
            assert!(!outcomes.is_empty(), "unexpected resolve call for {}", sha);
            Ok(outcomes.remove(0))
        }

        fn fetch_commit(&self, sha: &str) -> Result<()> {
            self.fetch_calls.borrow_mut().push(sha.to_string());
            Ok(())
        }
    }

    fn record(sha: &str, failure_text: Option<&str>) -> FailureRecord {
        FailureRecord {
            sha: sha.to_string(),
            pr_number: 7,
            failure_text: failure_text.map(str::to_string),
            test_file: String::new(),
            classname: String::new(),
            invoking_file: String::new(),
        }
    }

    fn empty_cache(tmp: &TempDir) -> ResolutionCache {
        ResolutionCache::load(&tmp.path().join(CACHE_FILE))
    }

    const TRACEBACK: &str =
        "Traceback (most recent call last):\n  File \"nn/linear.py\", line 5, in forward";

    #[test]
    fn cached_sha_never_reaches_the_resolver() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);
        cache.record_files(
            "abc123",
            CommitFileSet::Files(vec!["torch/nn/linear.py".to_string()]),
        );

        let resolver = ScriptedResolver::new(Vec::new());
        let extractor = TracebackExtractor::new(&Config::default());
        let outcomes = correlate(
            &[record("abc123", Some(TRACEBACK))],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(resolver.resolve_count(), 0);
        assert_eq!(
            outcomes[0].matched,
            Some(std::iter::once("nn/linear.py".to_string()).collect())
        );
    }

    #[test]
    fn known_unresolved_sha_is_never_retried() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);
        cache.mark_unresolved("abc123");

        let resolver = ScriptedResolver::new(Vec::new());
        let extractor = TracebackExtractor::new(&Config::default());
        let outcomes = correlate(
            &[record("abc123", Some(TRACEBACK))],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(resolver.resolve_count(), 0);
        assert!(resolver.fetch_calls.borrow().is_empty());
        assert_eq!(outcomes[0].matched, None);
    }

    #[test]
    fn unresolved_after_one_fetch_retry_is_recorded_permanently() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);

        let resolver = ScriptedResolver::new(vec![
            CommitFileSet::Unresolved,
            CommitFileSet::Unresolved,
        ]);
        let extractor = TracebackExtractor::new(&Config::default());
        correlate(
            &[record("abc123", None)],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(resolver.resolve_count(), 2);
        assert_eq!(
            resolver.fetch_calls.borrow().as_slice(),
            &["abc123".to_string()]
        );
        assert!(cache.is_known_unresolved("abc123"));
    }

    #[test]
    fn fetch_retry_success_caches_the_concrete_list() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);

        let resolver = ScriptedResolver::new(vec![
            CommitFileSet::Unresolved,
            CommitFileSet::Files(vec!["a.py".to_string(), "b.py".to_string()]),
        ]);
        let extractor = TracebackExtractor::new(&Config::default());
        correlate(
            &[record("abc123", None)],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(
            cache.lookup_files("abc123"),
            Some(&CommitFileSet::Files(vec![
                "a.py".to_string(),
                "b.py".to_string()
            ]))
        );
        assert!(!cache.is_known_unresolved("abc123"));
    }

    #[test]
    fn repeated_sha_resolves_once_within_a_run() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);

        let resolver =
            ScriptedResolver::new(vec![CommitFileSet::Files(vec!["a.py".to_string()])]);
        let extractor = TracebackExtractor::new(&Config::default());
        correlate(
            &[record("abc123", None), record("abc123", None)],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(resolver.resolve_count(), 1);
    }

    #[test]
    fn empty_modified_list_still_counts_as_resolved() {
        let tmp = TempDir::new().unwrap();
        let mut cache = empty_cache(&tmp);

        let resolver = ScriptedResolver::new(vec![CommitFileSet::Files(Vec::new())]);
        let extractor = TracebackExtractor::new(&Config::default());
        let outcomes = correlate(
            &[record("abc123", Some(TRACEBACK))],
            &extractor,
            &resolver,
            &mut cache,
            "main",
        );

        assert_eq!(resolver.resolve_count(), 1);
        assert!(!cache.is_known_unresolved("abc123"));
        // Nothing to compare against, so no verdict.
        assert_eq!(outcomes[0].matched, None);
    }
}
