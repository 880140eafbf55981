//! Git operations for commit-diff resolution
//!
//! Resolves the files a commit modified relative to its merge-base with
//! the anchor branch, using a pre-configured local clone. The resolution
//! commands are shelled out so unknown-commit failures surface as the
//! same text git prints; nothing here writes to the working copy beyond
//! object fetches.

use anyhow::{Context, Result};
use git2::Repository;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Marker git prints when a sha cannot be resolved to a commit. Seen for
/// commits from forked repositories and commits not yet fetched.
pub const INVALID_COMMIT_MARKER: &str = "Not a valid commit name";

/// On-disk marker for an unresolvable commit. Matches the cache format
/// of earlier runs, where `*` stood in for "no file list".
const UNRESOLVED_MARKER: &str = "*";

/// Branch merge-bases are computed against unless configured otherwise.
pub const DEFAULT_ANCHOR: &str = "main";

/// Files modified by a commit relative to its merge-base with the anchor
/// branch. `Unresolved` means no merge-base could be found, or the
/// commit is not present locally and fetching did not help. Distinct
/// from an empty list, which is a commit that modified nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitFileSet {
    Files(Vec<String>),
    Unresolved,
}

impl CommitFileSet {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, CommitFileSet::Unresolved)
    }
}

impl Serialize for CommitFileSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CommitFileSet::Files(files) => files.serialize(serializer),
            CommitFileSet::Unresolved => serializer.serialize_str(UNRESOLVED_MARKER),
        }
    }
}

impl<'de> Deserialize<'de> for CommitFileSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Marker(String),
            Files(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Files(files) => Ok(CommitFileSet::Files(files)),
            Repr::Marker(s) if s == UNRESOLVED_MARKER => Ok(CommitFileSet::Unresolved),
            // Earlier runs stored "" for "no modified files".
            Repr::Marker(s) if s.is_empty() => Ok(CommitFileSet::Files(Vec::new())),
            Repr::Marker(s) => Err(D::Error::custom(format!(
                "unexpected commit file-set marker `{}`",
                s
            ))),
        }
    }
}

/// Seam over the git-backed resolver so the pipeline's cache behavior
/// can be exercised without a working copy.
pub trait ResolveCommit {
    fn resolve(&self, sha: &str, pr_number: i64, anchor: &str) -> Result<CommitFileSet>;
    fn fetch_commit(&self, sha: &str) -> Result<()>;
}

/// Output of one git invocation: stdout on success, stderr otherwise.
struct GitOutput {
    ok: bool,
    text: String,
}

/// Resolves commit diffs against a local clone of the repository under
/// test.
pub struct CommitDiffResolver {
    repo_path: PathBuf,
}

impl CommitDiffResolver {
    /// Open the resolver against a local clone. An unopenable working
    /// copy is the one fatal condition: nothing can be resolved without
    /// it.
    pub fn open(repo_path: &Path) -> Result<Self> {
        Repository::open(repo_path)
            .with_context(|| format!("Not a git working copy: {}", repo_path.display()))?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Branch the working copy currently has checked out.
    pub fn current_branch(&self) -> Result<String> {
        let repo = Repository::open(&self.repo_path)?;
        let head = repo.head().context("Failed to get HEAD")?;
        Ok(head.shorthand().unwrap_or("detached").to_string())
    }

    fn git(&self, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

        let ok = output.status.success();
        let text = if ok {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            String::from_utf8_lossy(&output.stderr).to_string()
        };
        Ok(GitOutput { ok, text })
    }

    /// Resolve the files `sha` modified relative to its merge-base with
    /// `anchor`. Returns `Unresolved` when no merge-base exists or the
    /// commit is not known locally; the caller owns the fetch-and-retry
    /// policy.
    pub fn resolve(&self, sha: &str, pr_number: i64, anchor: &str) -> Result<CommitFileSet> {
        eprintln!("  Resolving {} (PR #{})", sha, pr_number);

        let merge_base = self.git(&["merge-base", sha, anchor])?;
        // A failed command is treated like an unknown commit rather than
        // risking a fabricated file list.
        if !merge_base.ok {
            return Ok(CommitFileSet::Unresolved);
        }
        let base = merge_base.text.trim();
        if base.is_empty() {
            // No common ancestor.
            return Ok(CommitFileSet::Unresolved);
        }
        if merge_base.text.contains(INVALID_COMMIT_MARKER) {
            // Commit from a fork, or not fetched yet.
            return Ok(CommitFileSet::Unresolved);
        }

        let diff = self.git(&["diff", "--name-only", base, sha])?;
        if !diff.ok || diff.text.contains(INVALID_COMMIT_MARKER) {
            return Ok(CommitFileSet::Unresolved);
        }
        if diff.text.is_empty() {
            // The commit modified no files.
            return Ok(CommitFileSet::Files(Vec::new()));
        }
        if diff.text.trim().is_empty() {
            return Ok(CommitFileSet::Unresolved);
        }

        let files = diff
            .text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(CommitFileSet::Files(files))
    }

    /// Fetch `sha` from origin so a follow-up resolve can see it.
    pub fn fetch_commit(&self, sha: &str) -> Result<()> {
        let fetched = self.git(&["fetch", "origin", sha])?;
        if !fetched.ok {
            anyhow::bail!("git fetch origin {} failed: {}", sha, fetched.text.trim());
        }
        Ok(())
    }
}

impl ResolveCommit for CommitDiffResolver {
    fn resolve(&self, sha: &str, pr_number: i64, anchor: &str) -> Result<CommitFileSet> {
        CommitDiffResolver::resolve(self, sha, pr_number, anchor)
    }

    fn fetch_commit(&self, sha: &str) -> Result<()> {
        CommitDiffResolver::fetch_commit(self, sha)
    }
}
