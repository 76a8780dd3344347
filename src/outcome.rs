//! Outcome classifier: maps a finished process's raw result plus the job's
//! policy into `(outcome, wrapper_return_code)`.
//!
//! `wrapper_return_code` is what the scheduler gates downstream jobs on;
//! `command_return_code` (kept separately by the caller) preserves the raw
//! exit code for reporting.

use anyhow::{Context, Result};
use std::path::Path;

use crate::schema::Outcome;

pub struct ProcessResult {
    pub rc: i32,
    pub timeout_reached: bool,
}

pub struct Policy<'a> {
    pub timeout_ok: bool,
    pub timeout_ignore: bool,
    pub ignore_returns: &'a [i32],
    pub ok_returns: &'a [i32],
    pub outcome_table: Option<&'a Path>,
}

/// A `(rc, timeout) -> outcome` override table, keyed by `"<rc>:<timeout>"`.
#[derive(Debug, serde::Deserialize)]
#[serde(transparent)]
struct OutcomeTable(std::collections::HashMap<String, Outcome>);

pub fn classify(result: &ProcessResult, policy: &Policy) -> Result<(Outcome, i32)> {
    if let Some(table_path) = policy.outcome_table {
        let raw = std::fs::read_to_string(table_path)
            .with_context(|| format!("read outcome table {}", table_path.display()))?;
        let table: OutcomeTable =
            serde_json::from_str(&raw).context("parse outcome table JSON")?;
        let key = format!("{}:{}", result.rc, result.timeout_reached);
        if let Some(outcome) = table.0.get(&key) {
            let wrapper_rc = if *outcome == Outcome::Success || *outcome == Outcome::FailIgnored {
                0
            } else {
                result.rc
            };
            return Ok((*outcome, wrapper_rc));
        }
        // Fall through to the decision tree if the table has no entry for
        // this exact key.
    }

    if result.timeout_reached && policy.timeout_ok {
        return Ok((Outcome::Success, 0));
    }
    if result.timeout_reached && policy.timeout_ignore {
        return Ok((Outcome::FailIgnored, 0));
    }
    if result.timeout_reached {
        return Ok((Outcome::Fail, nonzero_rc(result.rc)));
    }
    if result.rc == 0 {
        return Ok((Outcome::Success, 0));
    }
    if policy.ignore_returns.contains(&result.rc) {
        return Ok((Outcome::Success, 0));
    }
    if policy.ok_returns.contains(&result.rc) {
        return Ok((Outcome::FailIgnored, 0));
    }
    Ok((Outcome::Fail, result.rc))
}

/// A timed-out process's rc is whatever the kernel delivered (typically
/// the negated signal number); guarantee it reads as a failure even if
/// that happens to be zero.
fn nonzero_rc(rc: i32) -> i32 {
    if rc == 0 { -1 } else { rc }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy<'static> {
        Policy {
            timeout_ok: false,
            timeout_ignore: false,
            ignore_returns: &[],
            ok_returns: &[],
            outcome_table: None,
        }
    }

    #[test]
    fn zero_rc_is_success() {
        let r = ProcessResult { rc: 0, timeout_reached: false };
        assert_eq!(classify(&r, &policy()).unwrap(), (Outcome::Success, 0));
    }

    #[test]
    fn ignore_returns_zeros_wrapper_rc() {
        let r = ProcessResult { rc: 1, timeout_reached: false };
        let p = Policy { ignore_returns: &[1], ..policy() };
        assert_eq!(classify(&r, &p).unwrap(), (Outcome::Success, 0));
    }

    #[test]
    fn ok_returns_is_fail_ignored_with_zero_wrapper_rc() {
        let r = ProcessResult { rc: 2, timeout_reached: false };
        let p = Policy { ok_returns: &[2], ..policy() };
        assert_eq!(classify(&r, &p).unwrap(), (Outcome::FailIgnored, 0));
    }

    #[test]
    fn plain_nonzero_rc_is_fail_with_rc_as_wrapper_rc() {
        let r = ProcessResult { rc: 7, timeout_reached: false };
        assert_eq!(classify(&r, &policy()).unwrap(), (Outcome::Fail, 7));
    }

    #[test]
    fn timeout_ok_overrides_everything() {
        let r = ProcessResult { rc: 9, timeout_reached: true };
        let p = Policy { timeout_ok: true, ..policy() };
        assert_eq!(classify(&r, &p).unwrap(), (Outcome::Success, 0));
    }

    #[test]
    fn timeout_ignore_is_fail_ignored() {
        let r = ProcessResult { rc: 9, timeout_reached: true };
        let p = Policy { timeout_ignore: true, ..policy() };
        assert_eq!(classify(&r, &p).unwrap(), (Outcome::FailIgnored, 0));
    }

    #[test]
    fn bare_timeout_is_fail_with_nonzero_wrapper_rc() {
        let r = ProcessResult { rc: 0, timeout_reached: true };
        let (outcome, wrapper_rc) = classify(&r, &policy()).unwrap();
        assert_eq!(outcome, Outcome::Fail);
        assert_ne!(wrapper_rc, 0);
    }
}
