//! Signal router: cascades termination to the orchestrator's process
//! group, and serves an on-demand run dump on `SIGUSR1`.
//!
//! Signal handlers may only perform async-signal-safe work, so the
//! `SIGUSR1` handler here does nothing but flip an `AtomicBool`; a
//! dedicated poller thread (started alongside the reporter) observes the
//! flag and does the actual snapshot-and-atomic-write, mirroring the
//! watcher-thread-plus-flag idiom this crate already uses in
//! `supervisor::run`'s timeout watcher.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cachedir;

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_dump(_sig: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Become the leader of a new process group and write our PID to
/// `run-pid`. Must be called once, early, by `run-build`.
#[cfg(unix)]
pub fn become_group_leader(cache_dir: &Path) -> Result<()> {
    let rc = unsafe { libc::setpgid(0, 0) };
    if rc != 0 {
        anyhow::bail!("failed to create a new process group (errno {})", unsafe {
            *libc::__errno_location()
        });
    }
    let pid = std::process::id();
    cachedir::atomic_write(&cache_dir.join(cachedir::RUN_PID_FILE), pid.to_string().as_bytes())
        .context("write run-pid")
}

/// Install handlers for SIGTERM/SIGINT/SIGHUP (cascade) and SIGUSR1 (dump
/// request). Must be called after `become_group_leader`.
#[cfg(unix)]
pub fn install_handlers() -> Result<()> {
    for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP] {
        unsafe {
            if libc::signal(sig, on_terminate as libc::sighandler_t) == libc::SIG_ERR {
                anyhow::bail!("failed to install handler for signal {sig}");
            }
        }
    }
    unsafe {
        if libc::signal(libc::SIGUSR1, on_dump as libc::sighandler_t) == libc::SIG_ERR {
            anyhow::bail!("failed to install SIGUSR1 handler");
        }
    }
    Ok(())
}

/// True once a termination signal has been received; checked by the
/// reporter's main loop, which then cascades the same signal to our own
/// process group (which includes every spawned job) before exiting.
pub fn termination_requested() -> bool {
    TERMINATE_REQUESTED.load(Ordering::SeqCst)
}

/// Forward `SIGTERM` to every currently-running job's own process group
/// (each job is its own group leader, see `supervisor::run`), then let the
/// caller exit 0 (a signalled shutdown is treated as user-initiated, not a
/// bug). Also signals our own group, in case a job is between `spawn` and
/// registering its pgid.
#[cfg(unix)]
pub fn cascade_to_process_group() {
    for pgid in crate::supervisor::running_pgids() {
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
    }
    let pgid = unsafe { libc::getpgrp() };
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
}

/// Poller thread body: wakes periodically, and whenever `DUMP_REQUESTED`
/// is set, clears it and invokes `on_dump` with a freshly computed run
/// document, writing `dumped-run.json` atomically.
pub fn spawn_dump_poller(
    cache_dir: &Path,
    killer: Arc<AtomicBool>,
    on_dump: impl Fn() -> Result<serde_json::Value> + Send + 'static,
) -> std::thread::JoinHandle<()> {
    let cache_dir = cache_dir.to_path_buf();
    std::thread::spawn(move || {
        while !killer.load(Ordering::Relaxed) {
            if DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
                match on_dump() {
                    Ok(doc) => {
                        if let Err(e) =
                            cachedir::atomic_write_json(&cache_dir.join(cachedir::DUMPED_RUN_FILE), &doc)
                        {
                            tracing::error!(error = %e, "failed to write dumped-run.json");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to compute run document for dump"),
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    })
}

/// Client-side exponential backoff with jitter, exactly matching the
/// source's `BackoffSleeper`: `duration` starts at 0.2s; each iteration
/// sleeps `duration`, then `duration = (duration + jitter) * 2`,
/// `jitter = jitter * 2`.
pub struct BackoffSleeper {
    duration: f64,
    jitter: f64,
}

impl BackoffSleeper {
    pub fn new(jitter_seed: f64) -> Self {
        BackoffSleeper {
            duration: 0.2,
            jitter: jitter_seed,
        }
    }

    pub fn sleep_once(&mut self) {
        std::thread::sleep(Duration::from_secs_f64(self.duration.max(0.0)));
        self.duration = (self.duration + self.jitter) * 2.0;
        self.jitter *= 2.0;
    }
}

/// `dump-run`: send SIGUSR1 to the PID in `run-pid`, then poll for
/// `dumped-run.json` with backoff+jitter, up to `retries` attempts
/// (`None` = retry forever).
#[cfg(unix)]
pub fn request_dump(cache_dir: &Path, retries: Option<u32>, jitter_seed: f64) -> Result<serde_json::Value> {
    let pid_raw = std::fs::read_to_string(cache_dir.join(cachedir::RUN_PID_FILE))
        .context("read run-pid; is a build currently running?")?;
    let pid: i32 = pid_raw.trim().parse().context("parse run-pid")?;

    unsafe {
        if libc::kill(pid, libc::SIGUSR1) != 0 {
            anyhow::bail!("failed to signal pid {pid} (process may have exited)");
        }
    }

    let dump_path = cache_dir.join(cachedir::DUMPED_RUN_FILE);
    let mut sleeper = BackoffSleeper::new(jitter_seed);
    let mut attempt = 0u32;
    loop {
        sleeper.sleep_once();
        if let Ok(raw) = std::fs::read_to_string(&dump_path) {
            if let Ok(value) = serde_json::from_str(&raw) {
                return Ok(value);
            }
        }
        attempt += 1;
        if let Some(max) = retries {
            if attempt >= max {
                anyhow::bail!("gave up waiting for dumped-run.json after {max} attempts");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_durations_grow_geometrically() {
        let mut s = BackoffSleeper { duration: 0.2, jitter: 0.5 };
        assert_eq!(s.duration, 0.2);
        s.duration = (s.duration + s.jitter) * 2.0;
        s.jitter *= 2.0;
        assert!((s.duration - 1.4).abs() < 1e-9);
        assert!((s.jitter - 1.0).abs() < 1e-9);
    }
}
