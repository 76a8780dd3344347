//! Expiry and cooperative locking for past-run directories under
//! `report_data/`.
//!
//! Each retained run directory carries two marker files: a lock marker
//! (present = unlocked, absent = locked) acquired by unlinking it, and a
//! separate expiry marker written whenever a directory is flagged for
//! removal. Locking here is advisory between cooperating `gc` runs, not
//! an OS-level flock — mirrors the marker-file scheme in
//! `lib/litani_report.py`'s directory expiry helpers.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_MARKER: &str = ".litani-lock";
const EXPIRED_MARKER: &str = ".litani-expired";

/// Try to acquire `dir`'s lock by unlinking its lock marker. Returns
/// `true` if the marker was present (now removed, lock held), `false` if
/// it was already absent (someone else holds it).
pub fn acquire(dir: &Path) -> Result<bool> {
    let marker = dir.join(LOCK_MARKER);
    match std::fs::remove_file(&marker) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("acquire lock {}", marker.display())),
    }
}

/// Release `dir`'s lock by recreating its marker.
pub fn release(dir: &Path) -> Result<()> {
    let marker = dir.join(LOCK_MARKER);
    std::fs::File::create(&marker).with_context(|| format!("release lock {}", marker.display()))?;
    Ok(())
}

/// Poll for the lock once per second, up to `timeout`. Returns `false` if
/// the timeout elapses without acquiring it.
pub fn acquire_blocking(dir: &Path, timeout: Duration) -> Result<bool> {
    let start = Instant::now();
    loop {
        if acquire(dir)? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Mark `dir` as expired. Does not remove anything; the GC sweep
/// consults this marker.
pub fn mark_expired(dir: &Path) -> Result<()> {
    let marker = dir.join(EXPIRED_MARKER);
    std::fs::File::create(&marker).with_context(|| format!("write expiry marker {}", marker.display()))?;
    Ok(())
}

pub fn is_expired(dir: &Path) -> bool {
    dir.join(EXPIRED_MARKER).exists()
}

/// List run directories under `report_data_dir` that are currently
/// marked expired, without acquiring or removing anything.
pub fn print_expiry_candidates(report_data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !report_data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(report_data_dir)
        .with_context(|| format!("read dir {}", report_data_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() && is_expired(&entry.path()) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// One GC pass: for every run directory under `report_data_dir`, try to
/// acquire its lock; on success, remove it if expired, otherwise release
/// the lock again. Directories that could not be acquired (another `gc`
/// holds them) are left untouched. Returns the directories actually
/// removed.
pub fn gc(report_data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !report_data_dir.exists() {
        return Ok(removed);
    }
    for entry in std::fs::read_dir(report_data_dir)
        .with_context(|| format!("read dir {}", report_data_dir.display()))?
    {
        let entry = entry?;
        let dir = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if !acquire(&dir)? {
            continue;
        }
        if is_expired(&dir) {
            std::fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            removed.push(dir);
        } else {
            release(&dir)?;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_dir_with_marker() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::File::create(dir.path().join(LOCK_MARKER)).unwrap();
        dir
    }

    #[test]
    fn acquire_unlinks_marker_and_release_recreates_it() {
        let dir = run_dir_with_marker();
        assert!(acquire(dir.path()).unwrap());
        assert!(!dir.path().join(LOCK_MARKER).exists());
        assert!(!acquire(dir.path()).unwrap());
        release(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_MARKER).exists());
    }

    #[test]
    fn gc_removes_only_expired_directories() {
        let report_data = tempdir().unwrap();
        let keep = report_data.path().join("run-a");
        let drop = report_data.path().join("run-b");
        std::fs::create_dir_all(&keep).unwrap();
        std::fs::create_dir_all(&drop).unwrap();
        std::fs::File::create(keep.join(LOCK_MARKER)).unwrap();
        std::fs::File::create(drop.join(LOCK_MARKER)).unwrap();
        mark_expired(&drop).unwrap();

        let removed = gc(report_data.path()).unwrap();
        assert_eq!(removed, vec![drop.clone()]);
        assert!(keep.exists());
        assert!(!drop.exists());
        // The kept directory's lock was released again.
        assert!(keep.join(LOCK_MARKER).exists());
    }

    #[test]
    fn print_expiry_candidates_lists_only_marked_dirs() {
        let report_data = tempdir().unwrap();
        let a = report_data.path().join("a");
        let b = report_data.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        mark_expired(&b).unwrap();

        let candidates = print_expiry_candidates(report_data.path()).unwrap();
        assert_eq!(candidates, vec![b]);
    }
}
