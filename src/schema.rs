//! Shared JSON types: the CLI envelope used for machine-readable replies,
//! and the persisted on-disk state (job definitions, job status, the
//! published run document).
//!
//! Stdout carries exactly one JSON value per invocation of a
//! machine-readable subcommand; `tracing` logs go to stderr. Persisted
//! state files (`cache.json`, `jobs/*.json`, `status/*.json`, `run.json`)
//! are pretty-printed with 2-space indent; the CLI envelope is not.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: &str = "0.1";

/// Serialize `value` to a single-line JSON string and print it to stdout.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Serialize `value` to pretty-printed JSON (2-space indent).
pub fn to_pretty_json(value: &impl Serialize) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

/// Top-level envelope used for every successful CLI response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorResponse {
    /// `retryable` should be `true` only for transient conditions (I/O
    /// contention, a temporarily-locked directory); `false` for permanent
    /// failures such as "job not found" or a configuration error.
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                retryable,
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Persisted job definition (jobs/<job_id>.json) ----------

/// A declared job. Fields are immutable once written to `jobs/<job_id>.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Job {
    pub job_id: String,
    pub pipeline_name: String,
    pub ci_stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// `None` means the `--phony-outputs` flag was never passed (a missing
    /// declared output still warns); `Some(vec![])` means it was passed
    /// with no values, meaning every declared output is phony.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phony_outputs: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub timeout_ok: bool,
    #[serde(default)]
    pub timeout_ignore: bool,
    #[serde(default)]
    pub ignore_returns: Vec<i32>,
    #[serde(default)]
    pub ok_returns: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_table: Option<String>,

    #[serde(default)]
    pub interleave_stdout_stderr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Private fields: never echoed back by `get-jobs`.
    pub status_file: String,
    pub subcommand: String,
}

/// A job with the private fields (`status_file`, `subcommand`) stripped,
/// as returned by `get-jobs`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PublicJob {
    pub job_id: String,
    pub pipeline_name: String,
    pub ci_stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phony_outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub timeout_ok: bool,
    #[serde(default)]
    pub timeout_ignore: bool,
    #[serde(default)]
    pub ignore_returns: Vec<i32>,
    #[serde(default)]
    pub ok_returns: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_table: Option<String>,
    #[serde(default)]
    pub interleave_stdout_stderr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&Job> for PublicJob {
    fn from(j: &Job) -> Self {
        PublicJob {
            job_id: j.job_id.clone(),
            pipeline_name: j.pipeline_name.clone(),
            ci_stage: j.ci_stage.clone(),
            description: j.description.clone(),
            command: j.command.clone(),
            cwd: j.cwd.clone(),
            inputs: j.inputs.clone(),
            outputs: j.outputs.clone(),
            phony_outputs: j.phony_outputs.clone(),
            timeout: j.timeout,
            timeout_ok: j.timeout_ok,
            timeout_ignore: j.timeout_ignore,
            ignore_returns: j.ignore_returns.clone(),
            ok_returns: j.ok_returns.clone(),
            outcome_table: j.outcome_table.clone(),
            interleave_stdout_stderr: j.interleave_stdout_stderr,
            stdout_file: j.stdout_file.clone(),
            stderr_file: j.stderr_file.clone(),
            pool: j.pool.clone(),
            tags: j.tags.clone(),
        }
    }
}

/// Payload for `get-jobs` / `transform-jobs`. `Response`'s `data` field is
/// flattened, and flatten requires a struct or map — not a bare sequence —
/// so every array-returning command wraps its `Vec` in a named field here,
/// the same way the teacher's `ListData` wraps `list`'s job array.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobsData {
    pub jobs: Vec<PublicJob>,
}

/// Payload for `print-expiry-candidates`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExpiryCandidatesData {
    pub candidates: Vec<std::path::PathBuf>,
}

/// Payload for `gc`.
#[derive(Debug, Serialize, Deserialize)]
pub struct GcData {
    pub removed: Vec<std::path::PathBuf>,
}

// ---------- Outcome / job status (status/<job_id>.json) ----------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Worst. Ordinal 0 so `min()` over a job set yields the worst outcome.
    Fail,
    FailIgnored,
    Success,
}

/// Status of a single job, written twice: an incomplete snapshot at spawn,
/// then a complete snapshot at exit. Both share the same file
/// (`status/<job_id>.json`), replaced via atomic rename.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub complete: bool,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper_return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_reached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_outcome_dict: Option<serde_json::Value>,
}

impl JobStatus {
    pub fn started(job_id: impl Into<String>, start_time: impl Into<String>) -> Self {
        JobStatus {
            job_id: job_id.into(),
            complete: false,
            start_time: start_time.into(),
            end_time: None,
            duration: None,
            command_return_code: None,
            wrapper_return_code: None,
            timeout_reached: None,
            outcome: None,
            stdout: None,
            stderr: None,
            loaded_outcome_dict: None,
        }
    }
}

// ---------- Pools (declared at init time) ----------

pub type Pools = BTreeMap<String, u32>;

// ---------- cache.json ----------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Cache {
    pub project: String,
    pub run_id: String,
    pub version: &'static str,
    #[serde(default)]
    pub pools: Pools,
    pub stages: Vec<String>,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_symlink: Option<String>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<ParallelismTrace>,
}

/// `[SUPPLEMENT]` concurrency telemetry: see SPEC_FULL.md §4.J.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ParallelismTrace {
    pub trace: Vec<ParallelismSample>,
    pub max_parallelism: u32,
    pub n_proc: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ParallelismSample {
    pub running: u32,
    pub finished: u32,
    pub total: u32,
    pub time: String,
}

// ---------- Run document (run.json) ----------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunDocument {
    pub project: String,
    pub run_id: String,
    pub status: Outcome,
    pub pipelines: Vec<PipelineView>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineView {
    pub name: String,
    pub status: Outcome,
    pub ci_stages: Vec<StageView>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageView {
    pub name: String,
    pub status: Outcome,
    pub progress: u32,
    pub complete: bool,
    pub url: String,
    pub jobs: Vec<JobView>,
}

/// One of three shapes, matching the run-document validator's three
/// job-status variants: not started, started-and-incomplete, complete.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum JobView {
    NotStarted {
        job_id: String,
        pipeline_name: String,
        ci_stage: String,
        description: Option<String>,
        complete: bool,
    },
    Running {
        job_id: String,
        pipeline_name: String,
        ci_stage: String,
        description: Option<String>,
        complete: bool,
        start_time: String,
    },
    Complete {
        job_id: String,
        pipeline_name: String,
        ci_stage: String,
        description: Option<String>,
        complete: bool,
        start_time: String,
        end_time: String,
        duration: f64,
        command_return_code: Option<i32>,
        wrapper_return_code: Option<i32>,
        timeout_reached: bool,
        outcome: Outcome,
    },
}

impl JobView {
    pub fn start_time(&self) -> Option<&str> {
        match self {
            JobView::NotStarted { .. } => None,
            JobView::Running { start_time, .. } => Some(start_time),
            JobView::Complete { start_time, .. } => Some(start_time),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, JobView::Complete { .. })
    }
}
