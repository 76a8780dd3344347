//! Scheduler: builds the job dependency DAG, honors named pools and the
//! global `--parallel` bound, drives execution, and copies declared
//! outputs into `artifacts/<pipeline>/<stage>/`.
//!
//! Pipeline/stage partial builds (`-p`/`-s` on `run-build`) are expressed
//! as a job-set filter computed up front rather than as synthetic phony
//! graph nodes: since this scheduler runs in-process (no external DAG
//! runner file format to target), selecting "every job in pipeline P plus
//! everything it transitively depends on" is the same operation a phony
//! `__pipeline_name_P` target would trigger, without needing a node that
//! is never itself "run". See DESIGN.md.

use anyhow::{Context, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use crate::outcome::{self, Policy, ProcessResult};
use crate::schema::{Cache, Job, JobStatus, Outcome, ParallelismSample};
use crate::supervisor::{self, SupervisorOpts};
use crate::{cachedir, timefmt};

/// Marker error: the declared jobs contain a dependency cycle.
#[derive(Debug)]
pub struct DependencyCycle;

impl std::fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job graph contains a dependency cycle")
    }
}
impl std::error::Error for DependencyCycle {}

/// Expand any `@file`-prefixed token into the JSON array of strings the
/// file contains; tokens without the prefix pass through unchanged.
pub fn expand_tokens(tokens: &[String], cache_dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for tok in tokens {
        if let Some(rel) = tok.strip_prefix('@') {
            let path = cache_dir.join(rel);
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read @file list {}", path.display()))?;
            let list: Vec<String> =
                serde_json::from_str(&raw).with_context(|| format!("parse @file list {}", path.display()))?;
            out.extend(list);
        } else {
            out.push(tok.clone());
        }
    }
    Ok(out)
}

pub struct Graph {
    pub graph: DiGraph<String, ()>,
    pub index_of: HashMap<String, NodeIndex>,
    pub jobs: HashMap<String, Job>,
}

/// Build the dependency graph: an edge producer -> consumer exists when a
/// file in `producer.outputs` appears in `consumer.inputs` (after `@file`
/// expansion). The first job that declares a given output "owns" it; a
/// later job declaring the same output is not linked as a second producer
/// (undefined in spec.md; the simplest deterministic rule is kept).
pub fn build_graph(cache_dir: &Path, jobs: Vec<Job>) -> Result<Graph> {
    let mut graph = DiGraph::new();
    let mut index_of = HashMap::new();
    let mut by_job = HashMap::new();

    for job in &jobs {
        let idx = graph.add_node(job.job_id.clone());
        index_of.insert(job.job_id.clone(), idx);
    }

    let mut output_owner: HashMap<String, String> = HashMap::new();
    for job in &jobs {
        let outputs = expand_tokens(&job.outputs, cache_dir)?;
        for out in outputs {
            output_owner.entry(out).or_insert_with(|| job.job_id.clone());
        }
    }

    for job in &jobs {
        let inputs = expand_tokens(&job.inputs, cache_dir)?;
        for input in inputs {
            if let Some(producer_id) = output_owner.get(&input) {
                if producer_id != &job.job_id {
                    graph.add_edge(index_of[producer_id], index_of[&job.job_id], ());
                }
            }
        }
    }

    if toposort(&graph, None).is_err() {
        anyhow::bail!(DependencyCycle);
    }

    for job in jobs {
        by_job.insert(job.job_id.clone(), job);
    }

    Ok(Graph {
        graph,
        index_of,
        jobs: by_job,
    })
}

/// Reduce `graph` to the jobs in `pipelines`/`stage` plus everything they
/// transitively depend on. `None`/`None` means "everything".
pub fn select_subset(
    graph: &Graph,
    pipelines: Option<&[String]>,
    stage: Option<&str>,
) -> Vec<String> {
    let wanted: Vec<&String> = graph
        .jobs
        .values()
        .filter(|j| {
            let pipeline_ok = pipelines.map(|ps| ps.iter().any(|p| p == &j.pipeline_name)).unwrap_or(true);
            let stage_ok = stage.map(|s| s == j.ci_stage).unwrap_or(true);
            pipeline_ok && stage_ok
        })
        .map(|j| &j.job_id)
        .collect();

    let mut included: std::collections::HashSet<String> = wanted.iter().map(|s| (*s).clone()).collect();
    let mut stack: Vec<String> = wanted.into_iter().cloned().collect();
    while let Some(id) = stack.pop() {
        let idx = graph.index_of[&id];
        for dep in graph
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
        {
            let dep_id = &graph.graph[dep];
            if included.insert(dep_id.clone()) {
                stack.push(dep_id.clone());
            }
        }
    }
    included.into_iter().collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Running,
    Done(Outcome),
    Skipped,
}

struct Shared {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

struct SchedulerState {
    status: HashMap<String, RunState>,
    pool_usage: HashMap<String, u32>,
    global_running: u32,
    finished_count: usize,
    samples: Vec<ParallelismSample>,
    max_parallelism: u32,
}

pub struct SchedulerOpts<'a> {
    pub cache_dir: &'a Path,
    pub pools: &'a crate::schema::Pools,
    pub parallel: usize,
    pub dry_run: bool,
}

/// Drive every included job to completion. Returns the final parallelism
/// trace (SPEC_FULL.md §4.J).
pub fn run(graph: &Graph, included: &[String], opts: SchedulerOpts) -> Result<crate::schema::ParallelismTrace> {
    let total = included.len() as u32;
    let mut status = HashMap::new();
    for id in included {
        status.insert(id.clone(), RunState::NotStarted);
    }

    let shared = Arc::new(Shared {
        state: Mutex::new(SchedulerState {
            status,
            pool_usage: HashMap::new(),
            global_running: 0,
            finished_count: 0,
            samples: Vec::new(),
            max_parallelism: 0,
        }),
        cv: Condvar::new(),
    });

    let global_cap = if opts.parallel == 0 {
        usize::MAX
    } else {
        opts.parallel
    };

    let included_set: std::collections::HashSet<&String> = included.iter().collect();

    loop {
        if crate::signals::termination_requested() {
            crate::signals::cascade_to_process_group();
            break;
        }

        let mut guard = shared.state.lock().unwrap();
        if guard.finished_count >= included.len() {
            break;
        }

        // Find every ready job: NotStarted, all producers Done(success-ish)
        // or Skipped-inheriting-fail (which marks it Skipped too), and
        // capacity available.
        let mut started_any = false;
        let ready: Vec<String> = included
            .iter()
            .filter(|id| guard.status.get(*id) == Some(&RunState::NotStarted))
            .cloned()
            .collect();

        for id in ready {
            let job = &graph.jobs[&id];
            let idx = graph.index_of[&id];
            let mut blocked_by_failure = false;
            let mut deps_done = true;
            for dep in graph
                .graph
                .neighbors_directed(idx, petgraph::Direction::Incoming)
            {
                let dep_id = &graph.graph[dep];
                if !included_set.contains(dep_id) {
                    continue;
                }
                match guard.status.get(dep_id) {
                    Some(RunState::Done(Outcome::Fail)) | Some(RunState::Skipped) => {
                        blocked_by_failure = true;
                    }
                    Some(RunState::Done(_)) => {}
                    _ => deps_done = false,
                }
            }

            if blocked_by_failure {
                guard.status.insert(id.clone(), RunState::Skipped);
                guard.finished_count += 1;
                write_skipped_status(opts.cache_dir, job)?;
                continue;
            }
            if !deps_done {
                continue;
            }

            let pool_ok = match &job.pool {
                Some(name) => {
                    let depth = *opts.pools.get(name).unwrap_or(&u32::MAX);
                    *guard.pool_usage.get(name).unwrap_or(&0) < depth
                }
                None => true,
            };
            if !pool_ok || guard.global_running as usize >= global_cap {
                continue;
            }

            guard.status.insert(id.clone(), RunState::Running);
            guard.global_running += 1;
            if let Some(name) = &job.pool {
                *guard.pool_usage.entry(name.clone()).or_insert(0) += 1;
            }
            started_any = true;

            record_sample(&mut guard, total);

            let job = job.clone();
            let cache_dir = opts.cache_dir.to_path_buf();
            let dry_run = opts.dry_run;
            let shared2 = Arc::clone(&shared);
            std::thread::spawn(move || {
                let outcome = if dry_run {
                    Outcome::Success
                } else {
                    execute_job(&cache_dir, &job).unwrap_or(Outcome::Fail)
                };
                let mut g = shared2.state.lock().unwrap();
                g.global_running -= 1;
                if let Some(name) = &job.pool {
                    if let Some(u) = g.pool_usage.get_mut(name) {
                        *u = u.saturating_sub(1);
                    }
                }
                g.status.insert(job.job_id.clone(), RunState::Done(outcome));
                g.finished_count += 1;
                record_sample(&mut g, total);
                shared2.cv.notify_all();
            });
        }

        if !started_any {
            let _unused = shared.cv.wait_timeout(guard, std::time::Duration::from_millis(200)).unwrap();
        }
    }

    let guard = shared.state.lock().unwrap();
    Ok(crate::schema::ParallelismTrace {
        trace: guard.samples.clone(),
        max_parallelism: guard.max_parallelism,
        n_proc: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    })
}

fn record_sample(guard: &mut SchedulerState, total: u32) {
    let running = guard.global_running;
    let finished = guard.finished_count as u32;
    guard.max_parallelism = guard.max_parallelism.max(running);
    guard.samples.push(ParallelismSample {
        running,
        finished,
        total,
        time: timefmt::now_rfc3339_millis(),
    });
}

fn write_skipped_status(cache_dir: &Path, job: &Job) -> Result<()> {
    let now = timefmt::now_rfc3339();
    let status = JobStatus {
        job_id: job.job_id.clone(),
        complete: true,
        start_time: now.clone(),
        end_time: Some(now),
        duration: Some(0.0),
        command_return_code: None,
        wrapper_return_code: Some(1),
        timeout_reached: Some(false),
        outcome: Some(Outcome::Fail),
        stdout: Some(Vec::new()),
        stderr: Some(vec!["skipped: upstream dependency failed".to_string()]),
        loaded_outcome_dict: None,
    };
    cachedir::atomic_write_json(&cachedir::status_dir(cache_dir).join(format!("{}.json", job.job_id)), &status)
}

/// Run a single job end-to-end: two-phase status write, supervision,
/// classification, artifact copy. Shared by the in-process scheduler path
/// and the standalone `exec` subcommand (see DESIGN.md, Open Question 6).
pub fn execute_job(cache_dir: &Path, job: &Job) -> Result<Outcome> {
    let status_path = cachedir::status_dir(cache_dir).join(format!("{}.json", job.job_id));
    let start_time = timefmt::now_rfc3339();
    cachedir::atomic_write_json(&status_path, &JobStatus::started(&job.job_id, &start_time))?;

    let cwd = job.cwd.as_ref().map(std::path::PathBuf::from);
    let stdout_file = job.stdout_file.as_ref().map(std::path::PathBuf::from);
    let stderr_file = job.stderr_file.as_ref().map(std::path::PathBuf::from);
    let extra_env = vec![
        ("BUILDORC_JOB_ID".to_string(), job.job_id.clone()),
    ];

    let opts = SupervisorOpts {
        command: &job.command,
        cwd: cwd.as_deref(),
        timeout_secs: job.timeout.unwrap_or(0),
        interleave_stdout_stderr: job.interleave_stdout_stderr,
        stdout_file: stdout_file.as_deref(),
        stderr_file: stderr_file.as_deref(),
        extra_env: &extra_env,
    };
    let result = supervisor::run(&opts)?;

    let policy = Policy {
        timeout_ok: job.timeout_ok,
        timeout_ignore: job.timeout_ignore,
        ignore_returns: &job.ignore_returns,
        ok_returns: &job.ok_returns,
        outcome_table: job.outcome_table.as_ref().map(std::path::Path::new),
    };
    let (outcome, wrapper_rc) = outcome::classify(
        &ProcessResult {
            rc: result.rc,
            timeout_reached: result.timeout_reached,
        },
        &policy,
    )?;

    let end_time = timefmt::now_rfc3339();
    let final_status = JobStatus {
        job_id: job.job_id.clone(),
        complete: true,
        start_time,
        end_time: Some(end_time),
        duration: Some(result.duration_secs),
        command_return_code: Some(result.rc),
        wrapper_return_code: Some(wrapper_rc),
        timeout_reached: Some(result.timeout_reached),
        outcome: Some(outcome),
        stdout: Some(result.stdout_lines),
        stderr: Some(result.stderr_lines),
        loaded_outcome_dict: None,
    };
    cachedir::atomic_write_json(&status_path, &final_status)?;

    copy_artifacts(cache_dir, job)?;

    Ok(outcome)
}

/// Copy each declared output that exists on disk into
/// `artifacts/<pipeline>/<stage>/`. A missing output logs a warning and is
/// skipped unless it is phony-listed. `phony_outputs` carries a three-way
/// distinction: `None` (flag never passed) warns on any missing output;
/// `Some(vec![])` (flag passed with no values) means every declared output
/// is phony; `Some(list)` phonies only the named outputs. Directories are
/// copied recursively; a name collision logs a warning and keeps the first
/// copy.
pub fn copy_artifacts(cache_dir: &Path, job: &Job) -> Result<()> {
    let dest_dir = cachedir::artifacts_dir(cache_dir)
        .join(&job.pipeline_name)
        .join(&job.ci_stage);
    std::fs::create_dir_all(&dest_dir)?;

    let all_phony = matches!(&job.phony_outputs, Some(p) if p.is_empty()) && !job.outputs.is_empty();

    for output in &job.outputs {
        let src = Path::new(output);
        let is_phony = all_phony
            || job
                .phony_outputs
                .as_ref()
                .map(|p| p.iter().any(|x| x == output))
                .unwrap_or(false);
        if !src.exists() {
            if is_phony {
                continue;
            }
            tracing::warn!(job_id = %job.job_id, output, "declared output is missing, skipping artifact copy");
            continue;
        }
        let file_name = src.file_name().map(|n| n.to_owned()).unwrap_or_else(|| src.as_os_str().to_owned());
        let dest = dest_dir.join(&file_name);
        if dest.exists() {
            tracing::warn!(job_id = %job.job_id, output, "artifact name collision, keeping first copy");
            continue;
        }
        if src.is_dir() {
            copy_dir_recursive(src, &dest)?;
        } else {
            std::fs::copy(src, &dest)
                .with_context(|| format!("copy artifact {} -> {}", src.display(), dest.display()))?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Re-merge the final per-job outcomes into `cache.json`'s top-level
/// `status` field: `success` only if every job's `outcome` is `success`.
pub fn finalize_cache_status(cache: &mut Cache, cache_dir: &Path) -> Result<()> {
    let mut worst = Outcome::Success;
    for job in &cache.jobs {
        let path = cachedir::status_dir(cache_dir).join(format!("{}.json", job.job_id));
        let Ok(raw) = std::fs::read_to_string(&path) else {
            worst = Outcome::Fail;
            continue;
        };
        let status: JobStatus = serde_json::from_str(&raw)?;
        if status.outcome != Some(Outcome::Success) {
            worst = worst.min(Outcome::Fail);
        }
    }
    cache.status = Some(worst);
    cache.end_time = Some(timefmt::now_rfc3339());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(id: &str, inputs: Vec<&str>, outputs: Vec<&str>) -> Job {
        Job {
            job_id: id.to_string(),
            pipeline_name: "p".into(),
            ci_stage: "build".into(),
            description: None,
            command: "true".into(),
            cwd: None,
            inputs: inputs.into_iter().map(String::from).collect(),
            outputs: outputs.into_iter().map(String::from).collect(),
            phony_outputs: None,
            timeout: None,
            timeout_ok: false,
            timeout_ignore: false,
            ignore_returns: vec![],
            ok_returns: vec![],
            outcome_table: None,
            interleave_stdout_stderr: false,
            stdout_file: None,
            stderr_file: None,
            pool: None,
            tags: vec![],
            status_file: String::new(),
            subcommand: "exec".into(),
        }
    }

    #[test]
    fn edge_exists_when_output_feeds_input() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![job("a", vec![], vec!["out.txt"]), job("b", vec!["out.txt"], vec![])];
        let graph = build_graph(dir.path(), jobs).unwrap();
        let a = graph.index_of["a"];
        let b = graph.index_of["b"];
        assert!(graph.graph.find_edge(a, b).is_some());
    }

    #[test]
    fn cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![job("a", vec!["b.out"], vec!["a.out"]), job("b", vec!["a.out"], vec!["b.out"])];
        let err = build_graph(dir.path(), jobs).unwrap_err();
        assert!(err.downcast_ref::<DependencyCycle>().is_some());
    }

    #[test]
    fn select_subset_pulls_in_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let mut j_a = job("a", vec![], vec!["out.txt"]);
        j_a.pipeline_name = "other".into();
        let j_b = job("b", vec!["out.txt"], vec![]);
        let graph = build_graph(dir.path(), vec![j_a, j_b]).unwrap();
        let subset = select_subset(&graph, Some(&["p".to_string()]), None);
        assert!(subset.contains(&"a".to_string()));
        assert!(subset.contains(&"b".to_string()));
    }

    #[test]
    fn pool_depth_default_is_unbounded_without_declared_pool() {
        let pools: BTreeMap<String, u32> = BTreeMap::new();
        assert!(pools.get("missing").is_none());
    }
}
