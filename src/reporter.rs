//! Reporter: joins job definitions with status snapshots into the
//! hierarchical run document, rolls up per-stage/per-pipeline/per-run
//! status, and republishes it atomically.
//!
//! Runs as a background thread carrying a shared "killer" flag (spec.md
//! §9's explicit design note), woken every ~2 seconds or early by the
//! scheduler.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cachedir;
use crate::schema::{Cache, Job, JobStatus, JobView, Outcome, PipelineView, RunDocument, StageView};

/// Load `cache.json` and every listed job's `status/<id>.json` (missing
/// files are treated as "not started", never an error) and compute the
/// full run document.
pub fn build_run_document(cache_dir: &Path, cache: &Cache) -> Result<RunDocument> {
    let mut by_pipeline: HashMap<&str, HashMap<&str, Vec<JobView>>> = HashMap::new();

    for job in &cache.jobs {
        let view = job_view(cache_dir, job)?;
        by_pipeline
            .entry(&job.pipeline_name)
            .or_default()
            .entry(&job.ci_stage)
            .or_default()
            .push(view);
    }

    let mut pipelines = Vec::new();
    for pipeline_name in by_pipeline.keys().copied().collect::<std::collections::BTreeSet<_>>() {
        let stages_for_pipeline = &by_pipeline[pipeline_name];
        let mut ci_stages = Vec::new();
        for stage_name in &cache.stages {
            let mut jobs = stages_for_pipeline.get(stage_name.as_str()).cloned().unwrap_or_default();
            job_sort(&mut jobs);
            let stage = stage_view(stage_name, jobs);
            ci_stages.push(stage);
        }
        let pipe_status = pipe_status(&ci_stages);
        pipelines.push(PipelineView {
            name: pipeline_name.to_string(),
            status: pipe_status,
            ci_stages,
        });
    }

    // Sort pipelines worst-first: Outcome's ordinal (Fail=0) makes this a
    // plain ascending sort.
    pipelines.sort_by_key(|p| p.status);

    let run_status = run_status(&pipelines);

    Ok(RunDocument {
        project: cache.project.clone(),
        run_id: cache.run_id.clone(),
        status: run_status,
        pipelines,
    })
}

fn job_view(cache_dir: &Path, job: &Job) -> Result<JobView> {
    let status_path = cachedir::status_dir(cache_dir).join(format!("{}.json", job.job_id));
    let status: Option<JobStatus> = match std::fs::read_to_string(&status_path) {
        Ok(raw) => Some(serde_json::from_str(&raw).with_context(|| format!("parse {}", status_path.display()))?),
        Err(_) => None,
    };

    Ok(match status {
        None => JobView::NotStarted {
            job_id: job.job_id.clone(),
            pipeline_name: job.pipeline_name.clone(),
            ci_stage: job.ci_stage.clone(),
            description: job.description.clone(),
            complete: false,
        },
        Some(s) if !s.complete => JobView::Running {
            job_id: job.job_id.clone(),
            pipeline_name: job.pipeline_name.clone(),
            ci_stage: job.ci_stage.clone(),
            description: job.description.clone(),
            complete: false,
            start_time: s.start_time,
        },
        Some(s) => JobView::Complete {
            job_id: job.job_id.clone(),
            pipeline_name: job.pipeline_name.clone(),
            ci_stage: job.ci_stage.clone(),
            description: job.description.clone(),
            complete: true,
            start_time: s.start_time,
            end_time: s.end_time.unwrap_or_default(),
            duration: s.duration.unwrap_or(0.0),
            command_return_code: s.command_return_code,
            wrapper_return_code: s.wrapper_return_code,
            timeout_reached: s.timeout_reached.unwrap_or(false),
            outcome: s.outcome.unwrap_or(Outcome::Fail),
        },
    })
}

/// Incomplete jobs first, then ascending `start_time` (jobs with no start
/// time — not yet started — sort last among the "incomplete" group by
/// using an empty string, which sorts before any real timestamp; to keep
/// "incomplete before complete" as the primary key we sort on that first).
fn job_sort(jobs: &mut [JobView]) {
    jobs.sort_by(|a, b| {
        a.is_complete()
            .cmp(&b.is_complete())
            .then_with(|| a.start_time().unwrap_or("").cmp(b.start_time().unwrap_or("")))
    });
}

fn stage_view(name: &str, jobs: Vec<JobView>) -> StageView {
    let total = jobs.len();
    let complete_count = jobs.iter().filter(|j| j.is_complete()).count();
    let complete = total == 0 || complete_count == total;
    let progress = if total == 0 {
        100
    } else {
        ((complete_count * 100) / total) as u32
    };

    // add_stage_stats: status starts SUCCESS; a job whose
    // wrapper_return_code is nonzero overrides to FAIL; else a nonzero
    // command_return_code or a timeout while still SUCCESS downgrades to
    // FAIL_IGNORED.
    let mut status = Outcome::Success;
    for job in &jobs {
        if let JobView::Complete {
            wrapper_return_code,
            command_return_code,
            timeout_reached,
            ..
        } = job
        {
            if wrapper_return_code.unwrap_or(0) != 0 {
                status = Outcome::Fail;
            } else if status == Outcome::Success
                && (command_return_code.unwrap_or(0) != 0 || *timeout_reached)
            {
                status = Outcome::FailIgnored;
            }
        }
    }

    StageView {
        name: name.to_string(),
        status,
        progress,
        complete,
        url: format!("artifacts/{name}/index.html"),
        jobs,
    }
}

/// add_pipe_stats, strictest interpretation (DESIGN.md Open Question 1):
/// a pipeline is SUCCESS only if every stage is SUCCESS and every stage is
/// complete; any incomplete stage pulls it down to at least FAIL_IGNORED.
/// A genuine FAIL among the *completed* stages always wins, though — an
/// incomplete stage elsewhere must never mask an already-observed failure
/// (Outcome's ordinal order makes FAIL the worst value, so this is computed
/// as the worst status among completed stages first, independent of
/// whether anything else is still running).
fn pipe_status(stages: &[StageView]) -> Outcome {
    let worst_complete = stages.iter().filter(|s| s.complete).map(|s| s.status).min();
    if worst_complete == Some(Outcome::Fail) {
        return Outcome::Fail;
    }
    if stages.iter().any(|s| !s.complete) {
        return Outcome::FailIgnored;
    }
    if worst_complete.map(|o| o != Outcome::Success).unwrap_or(false) {
        return Outcome::Fail;
    }
    Outcome::Success
}

/// Run status is the worst of its pipelines' statuses — the minimum under
/// `Outcome`'s ordinal order (`Fail` < `FailIgnored` < `Success`). Computing
/// it as a single minimum, rather than two separate `any()` checks in a
/// fixed order, is what guarantees a genuine `Fail` pipeline always
/// outranks a merely-incomplete one, matching spec §8's "run ≥ worst
/// pipeline" invariant.
fn run_status(pipelines: &[PipelineView]) -> Outcome {
    pipelines.iter().map(|p| p.status).min().unwrap_or(Outcome::Success)
}

/// Background aggregation loop: every ~2 seconds (or immediately when
/// `wake` is notified), recompute and atomically publish `run.json`.
/// Exits when `killer` is set.
pub fn run_loop(
    cache_dir: &Path,
    killer: Arc<AtomicBool>,
    out_file: Option<std::path::PathBuf>,
) -> Result<()> {
    while !killer.load(Ordering::Relaxed) {
        publish_once(cache_dir, out_file.as_deref())?;
        std::thread::sleep(Duration::from_secs(2));
    }
    // Final publish after the run ends.
    publish_once(cache_dir, out_file.as_deref())?;
    Ok(())
}

pub fn publish_once(cache_dir: &Path, out_file: Option<&Path>) -> Result<RunDocument> {
    let cache = cachedir::read_cache(cache_dir)?;
    let doc = build_run_document(cache_dir, &cache)?;
    crate::validate::validate_run_document(&doc)?;
    cachedir::atomic_write_json(&cache_dir.join(cachedir::RUN_DOCUMENT_FILE), &doc)?;
    if let Some(path) = out_file {
        cachedir::atomic_write_json(path, &doc)?;
    }
    Ok(doc)
}
