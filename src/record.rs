//! Input and output rows for a correlation run
//!
//! One `FailureRecord` per CI test run, as produced by the upstream query
//! layer. Upstream rows arrive flattened, so the traceback text lives
//! under the `failure.text` key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One CI test-run outcome. Read-only to the correlation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct FailureRecord {
    /// Commit the run was built from.
    pub sha: String,
    /// Pull request the commit came from.
    pub pr_number: i64,
    /// Raw traceback text when the run failed.
    #[serde(default, alias = "failure.text")]
    pub failure_text: Option<String>,
    #[serde(default)]
    pub test_file: String,
    #[serde(default)]
    pub classname: String,
    #[serde(default)]
    pub invoking_file: String,
}

/// The traceback files a commit also modified, or `None` when there was
/// nothing to compare or nothing matched.
pub type MatchVerdict = Option<BTreeSet<String>>;

/// One output row per input record, written as a JSON line for
/// downstream tabular analysis.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub sha: String,
    pub pr_number: i64,
    pub test_file: String,
    /// First-party files implicated by the failure's traceback.
    pub traceback_files: BTreeSet<String>,
    pub matched: MatchVerdict,
}
