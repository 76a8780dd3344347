//! Cache directory: the on-disk root of one run.
//!
//! Resolution order for finding an existing cache directory from a given
//! working directory:
//!   1. `BUILDORC_CACHE_DIR` environment variable (explicit override)
//!   2. ancestor walk: `cwd` then every parent directory, looking for a
//!      `.buildorc_cache_dir` pointer file
//!
//! The subtree-walk fallback that appears in one retrieved snapshot of the
//! source's own pointer-discovery routine is intentionally not replicated
//! (see DESIGN.md, Open Question 2).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::schema::Cache;

pub const CACHE_FILE: &str = "cache.json";
pub const CACHE_POINTER: &str = ".buildorc_cache_dir";
pub const RUN_PID_FILE: &str = "run-pid";
pub const DUMPED_RUN_FILE: &str = "dumped-run.json";
pub const RUN_DOCUMENT_FILE: &str = "run.json";
pub const DEFAULT_STAGES: &[&str] = &["build", "test", "report"];

/// Marker error: no cache directory could be found from the given cwd.
#[derive(Debug)]
pub struct CacheNotFound;

impl std::fmt::Display for CacheNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "could not find a pointer to a cache directory; did you forget to run `init`?"
        )
    }
}
impl std::error::Error for CacheNotFound {}

/// Marker error: `init` was asked to create a cache dir that already exists.
#[derive(Debug)]
pub struct CacheAlreadyExists(pub PathBuf);

impl std::fmt::Display for CacheAlreadyExists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache directory already exists: {}", self.0.display())
    }
}
impl std::error::Error for CacheAlreadyExists {}

/// Atomically write `contents` to `path`: create a sibling temp file
/// (`<path>~<uuid>`), write, fsync-on-close via `File::sync_all`, then
/// `rename` over `path`. Readers that `open(path)` directly never observe
/// a partial write because `rename` is atomic within one filesystem.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir {}", parent.display()))?;

    let tmp_name = format!(
        "{}~{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tmp"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = parent.join(tmp_name);

    let write_result = (|| -> Result<()> {
        let mut f = std::fs::File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        use std::io::Write;
        f.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        f.sync_all()
            .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Atomically write pretty-printed JSON to `path`.
pub fn atomic_write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let contents = serde_json::to_string_pretty(value).context("serialize JSON")?;
    atomic_write(path, contents.as_bytes())
}

/// Atomically refresh a symlink at `link_path` to point at `target`:
/// create a uniquely-named temp symlink next to it, then rename over it.
#[cfg(unix)]
pub fn atomic_symlink(target: &Path, link_path: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    let parent = link_path
        .parent()
        .with_context(|| format!("path has no parent: {}", link_path.display()))?;
    std::fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        "{}~{}",
        link_path.file_name().and_then(|n| n.to_str()).unwrap_or("link"),
        uuid::Uuid::new_v4()
    ));
    symlink(target, &tmp_path)
        .with_context(|| format!("create symlink {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, link_path)
        .with_context(|| format!("rename symlink {} -> {}", tmp_path.display(), link_path.display()))?;
    Ok(())
}

/// Walk `cwd` and every ancestor directory looking for `CACHE_POINTER`.
/// Returns the resolved cache directory path if found and it still exists.
pub fn find_cache_dir(cwd: &Path) -> Result<PathBuf> {
    if let Ok(over) = std::env::var("BUILDORC_CACHE_DIR") {
        if !over.is_empty() {
            let p = PathBuf::from(over);
            if p.exists() {
                return Ok(p);
            }
        }
    }

    let start = cwd
        .canonicalize()
        .with_context(|| format!("resolve cwd {}", cwd.display()))?;

    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        let pointer = dir.join(CACHE_POINTER);
        if let Ok(pointed) = std::fs::read_to_string(&pointer) {
            let cache_dir = PathBuf::from(pointed.trim());
            if cache_dir.exists() {
                return Ok(cache_dir);
            }
            tracing::warn!(
                pointer = %pointer.display(),
                target = %cache_dir.display(),
                "pointer file exists but target directory is missing; continuing search"
            );
        }
        current = dir.parent();
    }

    anyhow::bail!(CacheNotFound)
}

/// Create a new cache directory at `dir`, write `cache.json`, write the
/// pointer file in the current directory, and optionally refresh a
/// "latest" symlink. Fails if `dir` already exists.
pub fn init(
    dir: &Path,
    project: &str,
    stages: Vec<String>,
    pools: crate::schema::Pools,
    output_symlink: Option<&Path>,
) -> Result<Cache> {
    if dir.exists() {
        anyhow::bail!(CacheAlreadyExists(dir.to_path_buf()));
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create cache dir {}", dir.display()))?;
    for sub in ["jobs", "status", "artifacts", "html", "report_data"] {
        std::fs::create_dir_all(dir.join(sub))?;
    }

    let run_id = std::env::var("BUILDORC_RUN_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cache = Cache {
        project: project.to_string(),
        run_id,
        version: crate::schema::SCHEMA_VERSION,
        pools,
        stages,
        start_time: crate::timefmt::now_rfc3339(),
        end_time: None,
        status: None,
        latest_symlink: output_symlink.map(|p| p.display().to_string()),
        jobs: Vec::new(),
        parallelism: None,
    };

    atomic_write_json(&dir.join(CACHE_FILE), &cache)?;

    let cwd = std::env::current_dir().context("get current directory")?;
    let dir_abs = dir
        .canonicalize()
        .with_context(|| format!("canonicalize {}", dir.display()))?;
    atomic_write(
        &cwd.join(CACHE_POINTER),
        dir_abs.display().to_string().as_bytes(),
    )?;

    if let Some(link) = output_symlink {
        #[cfg(unix)]
        atomic_symlink(&dir_abs, link)?;
        #[cfg(not(unix))]
        {
            let _ = link;
        }
    }

    Ok(cache)
}

pub fn read_cache(cache_dir: &Path) -> Result<Cache> {
    let raw = std::fs::read_to_string(cache_dir.join(CACHE_FILE))
        .with_context(|| format!("read {}", cache_dir.join(CACHE_FILE).display()))?;
    serde_json::from_str(&raw).context("parse cache.json")
}

pub fn write_cache(cache_dir: &Path, cache: &Cache) -> Result<()> {
    atomic_write_json(&cache_dir.join(CACHE_FILE), cache)
}

pub fn jobs_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("jobs")
}
pub fn status_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("status")
}
pub fn artifacts_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("artifacts")
}
pub fn report_data_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("report_data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_creates_file_with_exact_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.json");
        atomic_write(&path, b"hello").unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn init_fails_if_dir_exists() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        let err = init(
            &cache_dir,
            "proj",
            vec!["build".into()],
            Default::default(),
            None,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<CacheAlreadyExists>().is_some());
    }
}
