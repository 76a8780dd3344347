//! Process supervisor: spawn one job's command through the shell, enforce
//! its timeout, and collect its streams.
//!
//! The child is made the leader of a new process group so that timeout
//! escalation (and the signal router's cascade, see `signals.rs`) can
//! reach its whole descendant tree, not just the immediate child.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process groups of currently-running jobs, keyed by the child's own pid
/// (its pgid, since each child calls `setpgid(0, 0)` on itself). The
/// signal router iterates this to cascade termination to every job still
/// running, not just the orchestrator's own group.
static RUNNING_PGIDS: Mutex<Vec<i32>> = Mutex::new(Vec::new());

/// Snapshot of every job's process group currently registered as running.
pub fn running_pgids() -> Vec<i32> {
    RUNNING_PGIDS.lock().unwrap().clone()
}

fn register_pgid(pgid: i32) {
    RUNNING_PGIDS.lock().unwrap().push(pgid);
}

fn unregister_pgid(pgid: i32) {
    let mut pgids = RUNNING_PGIDS.lock().unwrap();
    if let Some(pos) = pgids.iter().position(|p| *p == pgid) {
        pgids.swap_remove(pos);
    }
}

/// RAII guard ensuring a registered pgid is removed on every exit path,
/// including an early `?` return from `run`.
struct PgidGuard(i32);

impl Drop for PgidGuard {
    fn drop(&mut self) {
        unregister_pgid(self.0);
    }
}

pub struct SupervisorOpts<'a> {
    pub command: &'a str,
    pub cwd: Option<&'a std::path::Path>,
    /// 0 means no timeout.
    pub timeout_secs: u64,
    pub interleave_stdout_stderr: bool,
    pub stdout_file: Option<&'a std::path::Path>,
    pub stderr_file: Option<&'a std::path::Path>,
    /// Extra environment variables set for the child (e.g. `BUILDORC_JOB_ID`).
    pub extra_env: &'a [(String, String)],
}

pub struct SupervisorResult {
    pub rc: i32,
    pub timeout_reached: bool,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub duration_secs: f64,
}

/// Run `opts.command` under `sh -c`, waiting up to `opts.timeout_secs`
/// (0 = unbounded). On timeout: SIGTERM to the process group, sleep 1s,
/// SIGKILL, then reap. Returns the raw result; classification into an
/// `Outcome` is `outcome::classify`'s job.
pub fn run(opts: &SupervisorOpts) -> Result<SupervisorResult> {
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c").arg(opts.command);
    if let Some(cwd) = opts.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in opts.extra_env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    if opts.interleave_stdout_stderr {
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stderr(Stdio::piped());
    }

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().context("supervisor: spawn child")?;
    let pid = child.id();
    let start = std::time::Instant::now();

    #[cfg(unix)]
    register_pgid(pid as i32);
    #[cfg(unix)]
    let _pgid_guard = PgidGuard(pid as i32);

    let child_stdout = child.stdout.take().expect("stdout piped");
    let child_stderr = child.stderr.take().expect("stderr piped");

    let stdout_mirror = opts.stdout_file.map(Arc::new);
    let stderr_mirror = opts.stderr_file.map(Arc::new);

    let t_stdout = {
        let mirror = stdout_mirror.clone();
        std::thread::spawn(move || collect_stream(child_stdout, mirror.as_deref()))
    };
    let t_stderr = {
        let mirror = stderr_mirror.clone();
        std::thread::spawn(move || collect_stream(child_stderr, mirror.as_deref()))
    };

    let child_done = Arc::new(AtomicBool::new(false));
    let watcher = if opts.timeout_secs > 0 {
        let child_done = Arc::clone(&child_done);
        let timeout = std::time::Duration::from_secs(opts.timeout_secs);
        Some(std::thread::spawn(move || {
            let mut timed_out = false;
            let poll = std::time::Duration::from_millis(100);
            let begin = std::time::Instant::now();
            loop {
                std::thread::sleep(poll);
                if child_done.load(Ordering::Relaxed) {
                    break;
                }
                if begin.elapsed() >= timeout {
                    timed_out = true;
                    #[cfg(unix)]
                    {
                        unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
                    }
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    if !child_done.load(Ordering::Relaxed) {
                        #[cfg(unix)]
                        {
                            unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
                        }
                    }
                    break;
                }
            }
            timed_out
        }))
    } else {
        None
    };

    let status = child.wait().context("supervisor: wait for child")?;
    child_done.store(true, Ordering::Relaxed);

    let timeout_reached = watcher.map(|w| w.join().unwrap_or(false)).unwrap_or(false);

    let stdout_lines = t_stdout.join().unwrap_or_default();
    let stderr_lines = t_stderr.join().unwrap_or_default();

    let duration_secs = start.elapsed().as_secs_f64();

    #[cfg(unix)]
    let rc = {
        use std::os::unix::process::ExitStatusExt;
        status.code().unwrap_or_else(|| -status.signal().unwrap_or(0))
    };
    #[cfg(not(unix))]
    let rc = status.code().unwrap_or(-1);

    Ok(SupervisorResult {
        rc,
        timeout_reached,
        stdout_lines,
        stderr_lines,
        duration_secs,
    })
}

/// Read a stream line-by-line into an in-memory `Vec<String>`, mirroring
/// each raw chunk verbatim to `mirror_path` if set.
fn collect_stream(stream: impl Read, mirror_path: Option<&std::path::Path>) -> Vec<String> {
    let mut mirror = mirror_path.and_then(|p| std::fs::File::create(p).ok());
    let reader = BufReader::new(stream);
    let mut lines = Vec::new();
    for line in reader.lines() {
        match line {
            Ok(l) => {
                if let Some(f) = mirror.as_mut() {
                    let _ = writeln!(f, "{l}");
                }
                lines.push(l);
            }
            Err(_) => break,
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_lines() {
        let opts = SupervisorOpts {
            command: "echo foo",
            cwd: None,
            timeout_secs: 0,
            interleave_stdout_stderr: false,
            stdout_file: None,
            stderr_file: None,
            extra_env: &[],
        };
        let result = run(&opts).unwrap();
        assert_eq!(result.rc, 0);
        assert_eq!(result.stdout_lines, vec!["foo".to_string()]);
        assert!(!result.timeout_reached);
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let opts = SupervisorOpts {
            command: "exit 3",
            cwd: None,
            timeout_secs: 0,
            interleave_stdout_stderr: false,
            stdout_file: None,
            stderr_file: None,
            extra_env: &[],
        };
        let result = run(&opts).unwrap();
        assert_eq!(result.rc, 3);
    }

    #[test]
    fn timeout_is_detected_and_child_is_killed() {
        let opts = SupervisorOpts {
            command: "sleep 5",
            cwd: None,
            timeout_secs: 1,
            interleave_stdout_stderr: false,
            stdout_file: None,
            stderr_file: None,
            extra_env: &[],
        };
        let start = std::time::Instant::now();
        let result = run(&opts).unwrap();
        assert!(result.timeout_reached);
        assert!(start.elapsed() < std::time::Duration::from_secs(4));
    }
}
