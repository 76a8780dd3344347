//! Ambient configuration layer: an optional `.buildrc.toml`, discovered
//! by walking from the cwd upward, supplying defaults for flags that
//! would otherwise be required or hard-coded. CLI flags always win.
//!
//! Read once per invocation, ahead of any cache-directory operation;
//! never hot-reloaded.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".buildrc.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub default_parallel: Option<usize>,
    pub default_stages: Option<Vec<String>>,
    #[serde(default)]
    pub default_pools: crate::schema::Pools,
}

/// Walk `cwd` and its ancestors looking for `.buildrc.toml`. Returns the
/// parsed config, or the all-`None` default if no file is found.
pub fn load(cwd: &Path) -> Result<Config> {
    match find(cwd)? {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn find(cwd: &Path) -> Result<Option<PathBuf>> {
    let start = cwd
        .canonicalize()
        .with_context(|| format!("resolve cwd {}", cwd.display()))?;
    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        current = dir.parent();
    }
    Ok(None)
}

impl Config {
    /// Resolve a `--parallel` flag: `None` from the CLI (flag omitted)
    /// falls back to the file's `default_parallel`, then to the logical
    /// CPU count. An explicit `0`, from either the CLI or the file, means
    /// unbounded and is never overridden.
    pub fn resolve_parallel(&self, cli_value: Option<usize>) -> usize {
        cli_value.or(self.default_parallel).unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }

    pub fn resolve_stages(&self, cli_value: Option<Vec<String>>) -> Vec<String> {
        cli_value
            .or_else(|| self.default_stages.clone())
            .unwrap_or_else(|| {
                crate::cachedir::DEFAULT_STAGES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            })
    }

    pub fn resolve_pools(&self, cli_value: crate::schema::Pools) -> crate::schema::Pools {
        if cli_value.is_empty() {
            self.default_pools.clone()
        } else {
            cli_value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.default_parallel, None);
    }

    #[test]
    fn file_in_ancestor_is_found_and_parsed() {
        let root = tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "default_parallel = 4\ndefault_stages = [\"build\", \"test\"]\n",
        )
        .unwrap();
        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let cfg = load(&nested).unwrap();
        assert_eq!(cfg.default_parallel, Some(4));
        assert_eq!(cfg.default_stages, Some(vec!["build".into(), "test".into()]));
    }

    #[test]
    fn cli_flag_overrides_file_default() {
        let cfg = Config {
            default_parallel: Some(4),
            default_stages: None,
            default_pools: Default::default(),
        };
        assert_eq!(cfg.resolve_parallel(Some(8)), 8);
        assert_eq!(cfg.resolve_parallel(None), 4);
    }
}
