//! Configuration management for culprit
//!
//! Stores settings in ~/.config/culprit/config.json. Everything has a
//! default, so a missing config file is not an error.

use crate::git_ops::DEFAULT_ANCHOR;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Path prefix of third-party interpreter environments; traceback
/// entries under it are not first-party code.
const DEFAULT_THIRD_PARTY_PREFIX: &str = "/opt/conda/envs/py_";

/// CI workspace checkout prefix stripped from traceback paths.
const DEFAULT_WORKSPACE_PREFIX: &str = "/var/lib/jenkins/workspace/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local clone the resolver runs git commands in.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Branch merge-bases are computed against.
    #[serde(default = "default_anchor_branch")]
    pub anchor_branch: String,
    /// Directory the resolution cache lives in; defaults to the config
    /// directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Traceback paths starting with any of these are dropped as
    /// third-party code.
    #[serde(default = "default_third_party_prefixes")]
    pub third_party_prefixes: Vec<String>,
    /// Prefixes stripped from traceback paths when present.
    #[serde(default = "default_workspace_prefixes")]
    pub workspace_prefixes: Vec<String>,
}

fn default_anchor_branch() -> String {
    DEFAULT_ANCHOR.to_string()
}

fn default_third_party_prefixes() -> Vec<String> {
    vec![DEFAULT_THIRD_PARTY_PREFIX.to_string()]
}

fn default_workspace_prefixes() -> Vec<String> {
    vec![DEFAULT_WORKSPACE_PREFIX.to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_path: None,
            anchor_branch: default_anchor_branch(),
            cache_dir: None,
            third_party_prefixes: default_third_party_prefixes(),
            workspace_prefixes: default_workspace_prefixes(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("culprit"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        fs::create_dir_all(&dir)?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Where the resolution cache is stored.
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(Self::config_dir)
            .unwrap_or_else(|| PathBuf::from(".culprit"))
            .join(crate::cache::CACHE_FILE)
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
