//! Black-box CLI integration tests for `buildorc`.
//!
//! Each test runs the compiled binary in a fresh temp directory and
//! validates the on-disk state and/or the JSON envelope it prints.

use std::path::{Path, PathBuf};
use std::process::Command;

fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("buildorc");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

/// Test harness: an isolated temp directory acting as the cwd for every
/// invocation, so `.buildorc_cache_dir` pointer discovery is self-contained.
struct TestHarness {
    _tmp: tempfile::TempDir,
    cwd: PathBuf,
}

impl TestHarness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let cwd = tmp.path().to_path_buf();
        Self { _tmp: tmp, cwd }
    }

    fn cache_dir(&self) -> PathBuf {
        self.cwd.join("cache")
    }

    fn run(&self, args: &[&str]) -> serde_json::Value {
        let (value, status) = self.run_raw(args);
        assert!(status.success(), "command failed: {args:?}, response: {value}");
        value
    }

    fn run_raw(&self, args: &[&str]) -> (serde_json::Value, std::process::ExitStatus) {
        let output = Command::new(binary())
            .args(args)
            .current_dir(&self.cwd)
            .output()
            .expect("run binary");
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let value = serde_json::from_str(stdout.trim())
            .unwrap_or_else(|e| panic!("stdout is not valid JSON: {e}\nstdout: {stdout}\nstderr: {stderr}"));
        (value, output.status)
    }

    fn init(&self, project: &str, stages: &[&str]) {
        let mut args = vec!["init", "--project-name", project, "--output-directory"];
        let cache_dir = self.cache_dir();
        let cache_dir_str = cache_dir.to_str().unwrap();
        args.push(cache_dir_str);
        for s in stages {
            args.push("--stages");
            args.push(s);
        }
        self.run(&args);
    }

    fn add_job(&self, extra: &[&str]) -> serde_json::Value {
        let mut args = vec!["add-job"];
        args.extend_from_slice(extra);
        self.run(&args)
    }

    fn run_build(&self, extra: &[&str]) -> (serde_json::Value, std::process::ExitStatus) {
        let mut args = vec!["run-build"];
        args.extend_from_slice(extra);
        self.run_raw(&args)
    }

    fn run_document(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.cache_dir().join("run.json")).expect("read run.json");
        serde_json::from_str(&raw).expect("run.json is valid JSON")
    }

    fn jobs_dir(&self) -> PathBuf {
        self.cache_dir().join("jobs")
    }
}

fn job_ids_on_disk(dir: &Path) -> Vec<String> {
    let mut ids: Vec<String> = std::fs::read_dir(dir)
        .expect("read jobs dir")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    ids.sort();
    ids
}

// ── scenario 1: happy path ──────────────────────────────────────────────

#[test]
fn happy_path_produces_successful_run_document() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&[
        "--command", "echo foo",
        "--pipeline-name", "foo",
        "--ci-stage", "build",
    ]);
    let (_, status) = h.run_build(&[]);
    assert!(status.success());

    let doc = h.run_document();
    assert_eq!(doc["status"], "success");
    let pipelines = doc["pipelines"].as_array().unwrap();
    assert_eq!(pipelines.len(), 1);
    assert_eq!(pipelines[0]["name"], "foo");
    let build_stage = &pipelines[0]["ci_stages"][0];
    assert_eq!(build_stage["name"], "build");
    assert_eq!(build_stage["status"], "success");
    let job = &build_stage["jobs"][0];
    assert_eq!(job["outcome"], "success");
}

// ── scenario 2: ignored return ──────────────────────────────────────────

#[test]
fn ignored_return_zeros_wrapper_rc_but_keeps_raw_rc() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&[
        "--command", "false",
        "--pipeline-name", "foo",
        "--ci-stage", "build",
        "--ignore-returns", "1",
    ]);
    let (_, status) = h.run_build(&[]);
    assert!(status.success());

    let doc = h.run_document();
    let job = &doc["pipelines"][0]["ci_stages"][0]["jobs"][0];
    assert_eq!(job["outcome"], "success");
    assert_eq!(job["command_return_code"], 1);
    assert_eq!(job["wrapper_return_code"], 0);
}

// ── scenario 3: fail-on-pipeline-failure exit code ──────────────────────

#[test]
fn ok_returns_rolls_up_to_pipeline_failure_under_strict_flag() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&[
        "--command", "false",
        "--pipeline-name", "foo",
        "--ci-stage", "build",
        "--ok-returns", "1",
    ]);
    let (_, status) = h.run_build(&["--fail-on-pipeline-failure"]);
    assert_eq!(status.code(), Some(10));

    let doc = h.run_document();
    let job = &doc["pipelines"][0]["ci_stages"][0]["jobs"][0];
    assert_eq!(job["outcome"], "fail_ignored");
    assert_eq!(doc["pipelines"][0]["status"], "fail");
}

// ── scenario 4: multi-job set via repeated add-job ──────────────────────

#[test]
fn multiple_jobs_under_one_stage_all_appear_in_the_stage() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    for cmd in ["echo foo", "echo bar", "echo baz"] {
        h.add_job(&[
            "--command", cmd,
            "--pipeline-name", "foo",
            "--ci-stage", "build",
        ]);
    }
    let (_, status) = h.run_build(&[]);
    assert!(status.success());

    let doc = h.run_document();
    let jobs = doc["pipelines"][0]["ci_stages"][0]["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j["outcome"] == "success"));
}

// ── uniqueness / round-trip properties ──────────────────────────────────

#[test]
fn two_add_jobs_get_distinct_ids_on_disk() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&["--command", "true", "--pipeline-name", "p", "--ci-stage", "build"]);
    h.add_job(&["--command", "true", "--pipeline-name", "p", "--ci-stage", "build"]);
    let ids = job_ids_on_disk(&h.jobs_dir());
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn identity_transform_round_trip_is_byte_equivalent() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&["--command", "true", "--pipeline-name", "p", "--ci-stage", "build"]);

    let ids_before = job_ids_on_disk(&h.jobs_dir());
    let before_bytes = std::fs::read(h.jobs_dir().join(&ids_before[0])).unwrap();

    let get_jobs = h.run(&["get-jobs"]);
    let jobs_array = get_jobs["jobs"].clone();

    let output = Command::new(binary())
        .arg("transform-jobs")
        .current_dir(&h.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            use std::io::Write;
            child
                .stdin
                .take()
                .unwrap()
                .write_all(jobs_array.to_string().as_bytes())?;
            child.wait_with_output()
        })
        .expect("run transform-jobs");
    assert!(output.status.success());

    let ids_after = job_ids_on_disk(&h.jobs_dir());
    assert_eq!(ids_before, ids_after);
    let after_bytes = std::fs::read(h.jobs_dir().join(&ids_after[0])).unwrap();
    assert_eq!(before_bytes, after_bytes);
}

// ── dependency ordering via the DAG ─────────────────────────────────────

#[test]
fn dependent_job_waits_for_its_producer() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    let produced = h.cwd.join("produced.txt");
    h.add_job(&[
        "--command", &format!("sleep 0.2 && touch {}", produced.display()),
        "--pipeline-name", "p",
        "--ci-stage", "build",
        "--outputs", produced.to_str().unwrap(),
    ]);
    h.add_job(&[
        "--command", &format!("test -f {}", produced.display()),
        "--pipeline-name", "p",
        "--ci-stage", "build",
        "--inputs", produced.to_str().unwrap(),
    ]);
    let (_, status) = h.run_build(&[]);
    assert!(status.success());

    let doc = h.run_document();
    let jobs = doc["pipelines"][0]["ci_stages"][0]["jobs"].as_array().unwrap();
    assert!(jobs.iter().all(|j| j["outcome"] == "success"));
}

#[test]
fn failing_producer_skips_its_dependent() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&[
        "--command", "false",
        "--pipeline-name", "p",
        "--ci-stage", "build",
        "--outputs", "never.txt",
    ]);
    h.add_job(&[
        "--command", "true",
        "--pipeline-name", "p",
        "--ci-stage", "build",
        "--inputs", "never.txt",
    ]);
    h.run_build(&[]);

    let doc = h.run_document();
    let jobs = doc["pipelines"][0]["ci_stages"][0]["jobs"].as_array().unwrap();
    let outcomes: Vec<&str> = jobs.iter().map(|j| j["outcome"].as_str().unwrap()).collect();
    assert!(outcomes.contains(&"fail"));
}

// ── init/add-job error handling ─────────────────────────────────────────

#[test]
fn add_job_rejects_an_undeclared_ci_stage() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    let (value, status) = {
        let output = Command::new(binary())
            .args([
                "add-job",
                "--command", "true",
                "--pipeline-name", "p",
                "--ci-stage", "deploy",
            ])
            .current_dir(&h.cwd)
            .output()
            .expect("run binary");
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        (
            serde_json::from_str::<serde_json::Value>(stdout.trim()).expect("valid JSON"),
            output.status,
        )
    };
    assert!(!status.success());
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "unknown_ci_stage");
}

#[test]
fn init_twice_at_the_same_directory_fails() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    let output = Command::new(binary())
        .args([
            "init",
            "--project-name", "foo",
            "--output-directory", h.cache_dir().to_str().unwrap(),
        ])
        .current_dir(&h.cwd)
        .output()
        .expect("run binary");
    assert!(!output.status.success());
}

// ── envelope shape ───────────────────────────────────────────────────────

#[test]
fn get_jobs_envelope_has_expected_shape() {
    let h = TestHarness::new();
    h.init("foo", &["build"]);
    h.add_job(&["--command", "true", "--pipeline-name", "p", "--ci-stage", "build"]);
    let v = h.run(&["get-jobs"]);
    assert_eq!(v["schema_version"], "0.1");
    assert_eq!(v["ok"], true);
    assert_eq!(v["type"], "get-jobs");
    let job = &v["jobs"].as_array().unwrap()[0];
    assert_eq!(job["command"], "true");
    assert!(job["job_id"].is_string());
    // private fields never round-trip through get-jobs
    assert!(job.get("status_file").is_none());
    assert!(job.get("subcommand").is_none());
}
