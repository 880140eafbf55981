//! Modified-files-in-stack matching
//!
//! Decides whether a failure's traceback implicates a file the commit
//! actually touched. The two sides carry different relative roots
//! (package-qualified traceback paths vs. workspace-qualified diff
//! paths), so containment is tested by substring rather than exact
//! path equality.

use std::collections::BTreeSet;

/// Traceback entries containing this fragment are test files, not
/// candidate causes.
const TEST_FILE_MARKER: &str = "test_";

/// Return the traceback files that `modified_files` also touched, or
/// `None` when there is nothing to compare or nothing matched. Test
/// files never match; each traceback file matches at most once.
pub fn modified_in_stack(
    traceback_files: &BTreeSet<String>,
    modified_files: &[String],
) -> Option<BTreeSet<String>> {
    if modified_files.is_empty() {
        return None;
    }

    let mut matched = BTreeSet::new();
    for traceback_file in traceback_files {
        if traceback_file.contains(TEST_FILE_MARKER) {
            continue;
        }
        if modified_files
            .iter()
            .any(|modified| modified.contains(traceback_file.as_str()))
        {
            matched.insert(traceback_file.clone());
        }
    }

    if matched.is_empty() {
        None
    } else {
        Some(matched)
    }
}
