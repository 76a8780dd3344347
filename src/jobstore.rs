//! Job store: `jobs/<job_id>.json` CRUD plus the `transform-jobs` diff
//! protocol and the one-time merge into `cache.json` ahead of scheduling.

use anyhow::{Context, Result};
use std::path::Path;

use crate::cachedir::{self, atomic_write_json};
use crate::schema::{Cache, Job, PublicJob};

/// Marker error: a job references a `ci_stage` not declared at init time.
#[derive(Debug)]
pub struct UnknownCiStage(pub String);

impl std::fmt::Display for UnknownCiStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown ci_stage: {:?}", self.0)
    }
}
impl std::error::Error for UnknownCiStage {}

/// Marker error: a referenced `job_id` has no corresponding `jobs/*.json`.
#[derive(Debug)]
pub struct JobNotFound(pub String);

impl std::fmt::Display for JobNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job not found: {:?}", self.0)
    }
}
impl std::error::Error for JobNotFound {}

/// Look up one job by id, or `JobNotFound`.
pub fn get_job(cache_dir: &Path, job_id: &str) -> Result<Job> {
    list_jobs(cache_dir)?
        .into_iter()
        .find(|j| j.job_id == job_id)
        .ok_or_else(|| anyhow::anyhow!(JobNotFound(job_id.to_string())))
}

/// Fields not echoed back by `get_jobs`/`transform_jobs` output.
fn strip_private(job: &Job) -> PublicJob {
    PublicJob::from(job)
}

fn job_path(cache_dir: &Path, job_id: &str) -> std::path::PathBuf {
    cachedir::jobs_dir(cache_dir).join(format!("{job_id}.json"))
}

/// Draft of a job as supplied by `add-job`, before an id is assigned.
pub struct NewJob {
    pub pipeline_name: String,
    pub ci_stage: String,
    pub description: Option<String>,
    pub command: String,
    pub cwd: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub phony_outputs: Option<Vec<String>>,
    pub timeout: Option<u64>,
    pub timeout_ok: bool,
    pub timeout_ignore: bool,
    pub ignore_returns: Vec<i32>,
    pub ok_returns: Vec<i32>,
    pub outcome_table: Option<String>,
    pub interleave_stdout_stderr: bool,
    pub stdout_file: Option<String>,
    pub stderr_file: Option<String>,
    pub pool: Option<String>,
    pub tags: Vec<String>,
}

/// Validate `ci_stage` and write a new `jobs/<job_id>.json`.
///
/// If `phony_outputs` is non-empty and `outputs` is empty, the phony list
/// is treated as the output list (a job whose only "outputs" are tolerated
/// as absent still needs its outputs declared for DAG/artifact purposes).
pub fn add_job(cache_dir: &Path, declared_stages: &[String], mut draft: NewJob) -> Result<Job> {
    if !declared_stages.iter().any(|s| s == &draft.ci_stage) {
        anyhow::bail!(UnknownCiStage(draft.ci_stage.clone()));
    }
    if draft.outputs.is_empty() {
        if let Some(phony) = &draft.phony_outputs {
            if !phony.is_empty() {
                draft.outputs = phony.clone();
            }
        }
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let status_file = format!("status/{job_id}.json");

    let job = Job {
        job_id: job_id.clone(),
        pipeline_name: draft.pipeline_name,
        ci_stage: draft.ci_stage,
        description: draft.description,
        command: draft.command,
        cwd: draft.cwd,
        inputs: draft.inputs,
        outputs: draft.outputs,
        phony_outputs: draft.phony_outputs,
        timeout: draft.timeout,
        timeout_ok: draft.timeout_ok,
        timeout_ignore: draft.timeout_ignore,
        ignore_returns: draft.ignore_returns,
        ok_returns: draft.ok_returns,
        outcome_table: draft.outcome_table,
        interleave_stdout_stderr: draft.interleave_stdout_stderr,
        stdout_file: draft.stdout_file,
        stderr_file: draft.stderr_file,
        pool: draft.pool,
        tags: draft.tags,
        status_file,
        subcommand: "exec".to_string(),
    };

    crate::validate::validate_job(&job, declared_stages)?;
    atomic_write_json(&job_path(cache_dir, &job_id), &job)?;
    Ok(job)
}

/// Read every `jobs/*.json` file, in no particular order.
pub fn list_jobs(cache_dir: &Path) -> Result<Vec<Job>> {
    let dir = cachedir::jobs_dir(cache_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut jobs = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("read {}", entry.path().display()))?;
        let job: Job = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", entry.path().display()))?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// `get-jobs`: every declared job with private fields stripped.
pub fn get_jobs(cache_dir: &Path) -> Result<Vec<PublicJob>> {
    Ok(list_jobs(cache_dir)?.iter().map(strip_private).collect())
}

/// `set-jobs`: replace the entire job set.
pub fn set_jobs(cache_dir: &Path, declared_stages: &[String], drafts: Vec<NewJob>) -> Result<Vec<Job>> {
    for job in list_jobs(cache_dir)? {
        std::fs::remove_file(job_path(cache_dir, &job.job_id)).ok();
    }
    drafts
        .into_iter()
        .map(|d| add_job(cache_dir, declared_stages, d))
        .collect()
}

/// `transform-jobs`: apply a caller-edited array of public jobs against the
/// current set.
///
/// Rule (spec's literal wording, not the simpler "delete all, readd with
/// fresh ids" behavior seen in one retrieved source snapshot — see
/// DESIGN.md, Open Question 3): for each job present before the edit, if
/// its id is absent from `new_jobs`, delete it; if the edited entry is
/// byte-identical to the one on disk, keep the file untouched (preserving
/// its `job_id` and private fields); otherwise rewrite it, preserving the
/// original `job_id` and private fields but replacing every public field.
/// An entry in `new_jobs` whose `job_id` was not seen before is added: a
/// fresh `job_id` is minted for it exactly as `add_job` would, ignoring
/// whatever `job_id` the caller supplied (the protocol has no way to
/// request a specific new id).
pub fn transform_jobs(
    cache_dir: &Path,
    declared_stages: &[String],
    new_jobs: &[PublicJob],
) -> Result<Vec<Job>> {
    let before = list_jobs(cache_dir)?;
    let mut before_by_id: std::collections::HashMap<String, Job> =
        before.into_iter().map(|j| (j.job_id.clone(), j)).collect();

    let mut result = Vec::with_capacity(new_jobs.len());

    for public in new_jobs {
        match before_by_id.remove(&public.job_id) {
            Some(existing) => {
                let candidate = Job {
                    job_id: existing.job_id.clone(),
                    pipeline_name: public.pipeline_name.clone(),
                    ci_stage: public.ci_stage.clone(),
                    description: public.description.clone(),
                    command: public.command.clone(),
                    cwd: public.cwd.clone(),
                    inputs: public.inputs.clone(),
                    outputs: public.outputs.clone(),
                    phony_outputs: public.phony_outputs.clone(),
                    timeout: public.timeout,
                    timeout_ok: public.timeout_ok,
                    timeout_ignore: public.timeout_ignore,
                    ignore_returns: public.ignore_returns.clone(),
                    ok_returns: public.ok_returns.clone(),
                    outcome_table: public.outcome_table.clone(),
                    interleave_stdout_stderr: public.interleave_stdout_stderr,
                    stdout_file: public.stdout_file.clone(),
                    stderr_file: public.stderr_file.clone(),
                    pool: public.pool.clone(),
                    tags: public.tags.clone(),
                    status_file: existing.status_file.clone(),
                    subcommand: existing.subcommand.clone(),
                };
                crate::validate::validate_job(&candidate, declared_stages)?;
                if serde_json::to_vec(&candidate)? != serde_json::to_vec(&existing)? {
                    atomic_write_json(&job_path(cache_dir, &candidate.job_id), &candidate)?;
                }
                result.push(candidate);
            }
            None => {
                let added = add_job(
                    cache_dir,
                    declared_stages,
                    NewJob {
                        pipeline_name: public.pipeline_name.clone(),
                        ci_stage: public.ci_stage.clone(),
                        description: public.description.clone(),
                        command: public.command.clone(),
                        cwd: public.cwd.clone(),
                        inputs: public.inputs.clone(),
                        outputs: public.outputs.clone(),
                        phony_outputs: public.phony_outputs.clone(),
                        timeout: public.timeout,
                        timeout_ok: public.timeout_ok,
                        timeout_ignore: public.timeout_ignore,
                        ignore_returns: public.ignore_returns.clone(),
                        ok_returns: public.ok_returns.clone(),
                        outcome_table: public.outcome_table.clone(),
                        interleave_stdout_stderr: public.interleave_stdout_stderr,
                        stdout_file: public.stdout_file.clone(),
                        stderr_file: public.stderr_file.clone(),
                        pool: public.pool.clone(),
                        tags: public.tags.clone(),
                    },
                )?;
                result.push(added);
            }
        }
    }

    // Anything left in before_by_id was absent from new_jobs: delete it.
    for (id, _) in before_by_id {
        std::fs::remove_file(job_path(cache_dir, &id)).ok();
    }

    Ok(result)
}

/// Merge every `jobs/*.json` into `cache.json.jobs[]`, atomically. Called
/// once before scheduling; fails if no jobs have been declared.
pub fn collect_jobs_into_cache(cache_dir: &Path) -> Result<Cache> {
    let jobs = list_jobs(cache_dir)?;
    anyhow::ensure!(!jobs.is_empty(), "no jobs declared; run add-job first");

    let mut cache = cachedir::read_cache(cache_dir)?;
    cache.jobs = jobs;
    cachedir::write_cache(cache_dir, &cache)?;
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        cachedir::init(
            &dir.path().join("cache"),
            "proj",
            vec!["build".into(), "test".into()],
            Default::default(),
            None,
        )
        .unwrap();
        dir
    }

    fn sample_draft(stage: &str) -> NewJob {
        NewJob {
            pipeline_name: "p".into(),
            ci_stage: stage.into(),
            description: None,
            command: "true".into(),
            cwd: None,
            inputs: vec![],
            outputs: vec![],
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
        }
    }

    #[test]
    fn add_job_rejects_unknown_stage() {
        let dir = setup();
        let cache_dir = dir.path().join("cache");
        let err = add_job(
            &cache_dir,
            &["build".into(), "test".into()],
            sample_draft("deploy"),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<UnknownCiStage>().is_some());
    }

    #[test]
    fn two_add_jobs_get_distinct_ids() {
        let dir = setup();
        let cache_dir = dir.path().join("cache");
        let j1 = add_job(&cache_dir, &["build".into()], sample_draft("build")).unwrap();
        let j2 = add_job(&cache_dir, &["build".into()], sample_draft("build")).unwrap();
        assert_ne!(j1.job_id, j2.job_id);
    }

    #[test]
    fn transform_jobs_identity_round_trip_is_byte_equivalent() {
        let dir = setup();
        let cache_dir = dir.path().join("cache");
        add_job(&cache_dir, &["build".into()], sample_draft("build")).unwrap();
        let before_raw = {
            let jobs = list_jobs(&cache_dir).unwrap();
            std::fs::read(job_path(&cache_dir, &jobs[0].job_id)).unwrap()
        };

        let public = get_jobs(&cache_dir).unwrap();
        transform_jobs(&cache_dir, &["build".into()], &public).unwrap();

        let after_raw = {
            let jobs = list_jobs(&cache_dir).unwrap();
            std::fs::read(job_path(&cache_dir, &jobs[0].job_id)).unwrap()
        };
        assert_eq!(before_raw, after_raw);
    }

    #[test]
    fn transform_jobs_deletes_absent_ids() {
        let dir = setup();
        let cache_dir = dir.path().join("cache");
        add_job(&cache_dir, &["build".into()], sample_draft("build")).unwrap();
        transform_jobs(&cache_dir, &["build".into()], &[]).unwrap();
        assert!(list_jobs(&cache_dir).unwrap().is_empty());
    }

    #[test]
    fn transform_jobs_adds_entries_with_unrecognized_ids() {
        let dir = setup();
        let cache_dir = dir.path().join("cache");
        let mut new_job = PublicJob {
            job_id: String::new(),
            pipeline_name: "p".into(),
            ci_stage: "build".into(),
            description: None,
            command: "true".into(),
            cwd: None,
            inputs: vec![],
            outputs: vec![],
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
        };
        new_job.job_id = "not-on-disk-yet".into();
        let result = transform_jobs(&cache_dir, &["build".into()], &[new_job]).unwrap();
        assert_eq!(result.len(), 1);
        assert_ne!(result[0].job_id, "not-on-disk-yet");
        assert_eq!(list_jobs(&cache_dir).unwrap().len(), 1);
    }
}
