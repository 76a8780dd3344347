//! Validators for the two documents the crate persists: a single job and
//! the published run document. Violations here indicate a bug in this
//! program, not bad user input — every failure is fatal (spec.md §4.I).

use crate::schema::{Job, JobStatus, JobView, RunDocument};

/// Marker error: a document failed validation. Carries a human-readable
/// explanation of the first violation found.
#[derive(Debug)]
pub struct ValidationFailed(pub String);

impl std::fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation failed: {}", self.0)
    }
}
impl std::error::Error for ValidationFailed {}

/// `ci_stage` must be one of the declared stages; `pool`, if set, should
/// name a declared pool (checked by the caller, which has the pool map).
pub fn validate_job(job: &Job, declared_stages: &[String]) -> Result<(), ValidationFailed> {
    if !declared_stages.iter().any(|s| s == &job.ci_stage) {
        return Err(ValidationFailed(format!(
            "job {} declares ci_stage {:?} not in {:?}",
            job.job_id, job.ci_stage, declared_stages
        )));
    }
    if job.job_id.is_empty() {
        return Err(ValidationFailed("job_id must not be empty".into()));
    }
    Ok(())
}

/// `complete ⇒ all timing fields and outcome are present`.
pub fn validate_job_status(status: &JobStatus) -> Result<(), ValidationFailed> {
    if !status.complete {
        return Ok(());
    }
    let missing = [
        ("end_time", status.end_time.is_none()),
        ("duration", status.duration.is_none()),
        ("wrapper_return_code", status.wrapper_return_code.is_none()),
        ("timeout_reached", status.timeout_reached.is_none()),
        ("outcome", status.outcome.is_none()),
    ]
    .into_iter()
    .filter(|(_, missing)| *missing)
    .map(|(name, _)| name)
    .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(ValidationFailed(format!(
            "job {} is complete but missing fields: {}",
            status.job_id,
            missing.join(", ")
        )));
    }
    Ok(())
}

/// A stage is `complete` iff every job view in it is the `Complete`
/// variant, and every job_id is unique across the whole run document.
pub fn validate_run_document(doc: &RunDocument) -> Result<(), ValidationFailed> {
    let mut seen = std::collections::HashSet::new();
    for pipeline in &doc.pipelines {
        for stage in &pipeline.ci_stages {
            let all_complete = stage.jobs.iter().all(|j| j.is_complete());
            if stage.complete != all_complete {
                return Err(ValidationFailed(format!(
                    "pipeline {:?} stage {:?}: complete={} but jobs agree on {}",
                    pipeline.name, stage.name, stage.complete, all_complete
                )));
            }
            for job in &stage.jobs {
                if let JobView::Complete { job_id, .. }
                | JobView::Running { job_id, .. }
                | JobView::NotStarted { job_id, .. } = job
                {
                    if !seen.insert(job_id.clone()) {
                        return Err(ValidationFailed(format!(
                            "job_id {job_id} appears more than once in the run document"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}
