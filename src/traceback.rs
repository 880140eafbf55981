//! Traceback file extraction
//!
//! Pulls the set of first-party source files implicated by a Python
//! traceback, mapping installed-package paths back to their
//! repository-relative form and dropping third-party code.

use crate::config::Config;
use regex::Regex;
use std::collections::BTreeSet;

/// Text without this marker is not a traceback.
const TRACEBACK_MARKER: &str = "Traceback";

/// Extracts repository-relative source paths from traceback text.
pub struct TracebackExtractor {
    file_line: Regex,
    site_packages: Regex,
    third_party_prefixes: Vec<String>,
    workspace_prefixes: Vec<String>,
}

impl TracebackExtractor {
    pub fn new(config: &Config) -> Self {
        Self {
            file_line: Regex::new(r#"File "(.*\.py)", line"#).unwrap(),
            site_packages: Regex::new(r"python[^/]*/site-packages/(.*)").unwrap(),
            third_party_prefixes: config.third_party_prefixes.clone(),
            workspace_prefixes: config.workspace_prefixes.clone(),
        }
    }

    /// Extract implicated files from traceback text that may be absent.
    pub fn extract_opt(&self, text: Option<&str>) -> BTreeSet<String> {
        match text {
            Some(text) => self.extract(text),
            None => BTreeSet::new(),
        }
    }

    /// Extract the deduplicated set of first-party files named by
    /// `File "<path>.py", line` entries. Returns the empty set for
    /// non-traceback text; lines that don't match are skipped.
    pub fn extract(&self, text: &str) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if !text.contains(TRACEBACK_MARKER) {
            return files;
        }

        for line in text.lines() {
            let Some(caps) = self.file_line.captures(line) else {
                continue;
            };
            let mut file = caps[1].to_string();

            // Everything after site-packages is the repo-relative path
            // of the installed copy of the repository under test.
            if let Some(caps) = self.site_packages.captures(&file) {
                file = caps[1].to_string();
            }

            // Third-party interpreter environments are not our code.
            if self
                .third_party_prefixes
                .iter()
                .any(|prefix| file.starts_with(prefix.as_str()))
            {
                continue;
            }

            for prefix in &self.workspace_prefixes {
                if let Some(stripped) = file.strip_prefix(prefix.as_str()) {
                    file = stripped.to_string();
                    break;
                }
            }

            files.insert(file);
        }

        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> TracebackExtractor {
        TracebackExtractor::new(&Config::default())
    }

    #[test]
    fn text_without_marker_yields_no_files() {
        let text = "AssertionError: expected 1 == 2\n  File \"foo/bar.py\", line 3";
        assert!(extractor().extract(text).is_empty());
    }

    #[test]
    fn absent_text_yields_no_files() {
        assert!(extractor().extract_opt(None).is_empty());
    }

    #[test]
    fn site_packages_path_maps_to_repo_relative() {
        let text = "Traceback (most recent call last):\n  File \"pkg/python3.9/site-packages/foo/bar.py\", line 10, in f";
        let files = extractor().extract(text);
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec!["foo/bar.py"]);
    }

    #[test]
    fn third_party_environment_paths_are_dropped() {
        let text = "Traceback (most recent call last):\n  File \"/opt/conda/envs/py_3.9/bin/runner.py\", line 2, in run";
        assert!(extractor().extract(text).is_empty());
    }

    #[test]
    fn workspace_prefix_is_stripped() {
        let text = "Traceback (most recent call last):\n  File \"/var/lib/jenkins/workspace/test/run_test.py\", line 7, in main";
        let files = extractor().extract(text);
        assert!(files.contains("test/run_test.py"));
    }

    #[test]
    fn mixed_sources_keep_installed_repo_and_relative_paths() {
        // The conda-rooted path contains site-packages, so it is mapped
        // back to the installed repository's relative path rather than
        // dropped; the bare test file path is kept as-is.
        let text = "Traceback (most recent call last):\n  File \"/opt/conda/envs/py_3.9/lib/python3.9/site-packages/torch/nn/modules.py\", line 5, in f\n  File \"test_foo.py\", line 10, in g";
        let files = extractor().extract(text);
        assert!(files.contains("torch/nn/modules.py"));
        assert!(files.contains("test_foo.py"));
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn repeated_frames_deduplicate() {
        let text = "Traceback (most recent call last):\n  File \"foo/bar.py\", line 1, in f\n  File \"foo/bar.py\", line 9, in g";
        assert_eq!(extractor().extract(text).len(), 1);
    }

    #[test]
    fn non_python_frames_are_skipped() {
        let text = "Traceback (most recent call last):\n  File \"foo/bar.cpp\", line 1, in f\n  some unrelated line";
        assert!(extractor().extract(text).is_empty());
    }
}
