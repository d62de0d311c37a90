//! Configuration file loading and parsing
//!
//! Loads builder configuration from RON files, searching a few standard
//! locations before falling back to defaults. The resolved path is handed
//! on to git subprocesses so the pre-receive hook sees the same file.

use super::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Standard config file locations to search for
const CONFIG_FILENAMES: &[&str] = &["builder.ron", "/etc/builder/config.ron"];

/// Load configuration from a specific file path
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_ron(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Names the config file the gateway resolved; exported to every git
/// subprocess so hooks read the same file as the server.
pub const CONFIG_PATH_ENV: &str = "BUILDER_CONFIG_PATH";

/// A resolved configuration and the file it came from, if any.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub path: Option<PathBuf>,
}

impl Loaded {
    /// Environment a child process needs to resolve this same configuration.
    pub fn subprocess_env(&self) -> Vec<(String, String)> {
        self.path
            .iter()
            .map(|path| (CONFIG_PATH_ENV.to_string(), path.display().to_string()))
            .collect()
    }
}

/// Find a config file:
/// 1. Path named by BUILDER_CONFIG_PATH
/// 2. builder.ron in current directory
/// 3. /etc/builder/config.ron
fn discover(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(env_path) = lookup(CONFIG_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(
            "{CONFIG_PATH_ENV} specified but file not found: {}",
            path.display()
        );
    }

    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Resolve the effective configuration: explicit path or discovery, then
/// environment overrides, then validation. Defaults apply when no file is
/// found.
pub fn load_with(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Loaded> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => discover(&lookup),
    };
    let (mut config, path) = match path {
        Some(path) => {
            // Hooks run with the repository as cwd, so export an absolute path.
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            tracing::info!("Loading config from: {}", path.display());
            (load_from_file(&path)?, Some(path))
        }
        None => {
            tracing::info!("No config file found, using defaults");
            (Config::default(), None)
        }
    };
    config.apply_env_overrides(&lookup);
    config
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {reason}"))?;
    Ok(Loaded { config, path })
}

/// [`load_with`] against the process environment.
pub fn load(explicit: Option<&Path>) -> Result<Loaded> {
    load_with(explicit, |name| std::env::var(name).ok())
}

fn parse_ron(content: &str) -> Result<Config> {
    ron::from_str(content).context("Failed to parse RON configuration")
}
