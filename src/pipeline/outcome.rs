// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Stage outcomes and subject status

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::subject::Subject;

/// Result of running one stage. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    SkippedPrecondition { reason: Unmet },
    Failed { failure: StageFailure },
}

impl StageOutcome {
    pub fn failed(failure: StageFailure) -> Self {
        Self::Failed { failure }
    }

    pub fn skipped(reason: Unmet) -> Self {
        Self::SkippedPrecondition { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::SkippedPrecondition { reason } => write!(f, "skipped: {}", reason),
            Self::Failed { failure } => write!(f, "failed: {}", failure),
        }
    }
}

/// A precondition that did not hold when the stage was reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Unmet {
    LicenseMissing { path: PathBuf },
    InputMissing { path: PathBuf },
    UpstreamIncomplete { stage: String },
}

impl std::fmt::Display for Unmet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LicenseMissing { path } => write!(f, "no license found at {}", path.display()),
            Self::InputMissing { path } => write!(f, "missing input {}", path.display()),
            Self::UpstreamIncomplete { stage } => write!(f, "stage '{}' did not complete", stage),
        }
    }
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// The tool ran and exited non-zero
    ToolExecutionFailed { exit_code: Option<i32> },
    /// The runtime or program could not be found
    ToolNotAvailable { program: String },
    /// The process could not be started
    SpawnFailed { error: String },
    /// The invocation could not be built from its template
    InvalidInvocation { message: String },
    /// The tool succeeded but its output could not be interpreted
    OutputParseFailed { message: String },
    /// The tool succeeded but an expected output is absent or empty
    MissingOutput { path: PathBuf },
    /// The brain-age stage found no slices to score
    EmptySliceSet { directory: PathBuf },
    /// The invocation was aborted
    Cancelled,
    /// The invocation exceeded its time limit
    TimedOut { seconds: u64 },
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolExecutionFailed { exit_code: Some(code) } => {
                write!(f, "tool exited with status {}", code)
            }
            Self::ToolExecutionFailed { exit_code: None } => {
                write!(f, "tool terminated by signal")
            }
            Self::ToolNotAvailable { program } => write!(f, "'{}' is not available", program),
            Self::SpawnFailed { error } => write!(f, "could not start tool: {}", error),
            Self::InvalidInvocation { message } => write!(f, "invalid invocation: {}", message),
            Self::OutputParseFailed { message } => write!(f, "unreadable output: {}", message),
            Self::MissingOutput { path } => write!(f, "expected output {} missing", path.display()),
            Self::EmptySliceSet { directory } => {
                write!(f, "no slices found in {}", directory.display())
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut { seconds } => write!(f, "timed out after {}s", seconds),
        }
    }
}

/// Outcome of one stage together with timing
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Overall status of one subject's run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubjectStatus {
    Completed,
    CompletedWithSkips,
    Aborted { at_stage: String },
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::CompletedWithSkips => write!(f, "completed with skips"),
            Self::Aborted { at_stage } => write!(f, "aborted at '{}'", at_stage),
        }
    }
}

/// Everything the orchestrator learned about one subject
#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: Subject,
    /// One entry per stage that was reached, level by level
    pub stages: Vec<StageReport>,
    /// Stages never reached because the subject aborted
    pub not_run: Vec<String>,
    pub status: SubjectStatus,
}

impl SubjectReport {
    /// Derive the status from stage reports and the first fail-fast failure
    pub fn new(
        subject: Subject,
        stages: Vec<StageReport>,
        not_run: Vec<String>,
        aborted_at: Option<String>,
    ) -> Self {
        let status = match aborted_at {
            Some(at_stage) => SubjectStatus::Aborted { at_stage },
            None if stages.iter().all(|r| r.outcome.is_success()) => SubjectStatus::Completed,
            None => SubjectStatus::CompletedWithSkips,
        };

        Self {
            subject,
            stages,
            not_run,
            status,
        }
    }

    /// Outcome recorded for `stage`, if it was reached
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, SubjectStatus::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(stage: &str, outcome: StageOutcome) -> StageReport {
        StageReport {
            stage: stage.into(),
            outcome,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_all_succeeded_is_completed() {
        let r = SubjectReport::new(
            Subject::new("01"),
            vec![report("a", StageOutcome::Succeeded)],
            vec![],
            None,
        );
        assert_eq!(r.status, SubjectStatus::Completed);
    }

    #[test]
    fn test_skip_is_completed_with_skips() {
        let r = SubjectReport::new(
            Subject::new("01"),
            vec![
                report("a", StageOutcome::Succeeded),
                report(
                    "b",
                    StageOutcome::skipped(Unmet::UpstreamIncomplete { stage: "a".into() }),
                ),
            ],
            vec![],
            None,
        );
        assert_eq!(r.status, SubjectStatus::CompletedWithSkips);
        assert!(!r.is_aborted());
    }

    #[test]
    fn test_abort_wins() {
        let r = SubjectReport::new(
            Subject::new("01"),
            vec![report("a", StageOutcome::failed(StageFailure::Cancelled))],
            vec!["b".into()],
            Some("a".into()),
        );
        assert_eq!(
            r.status,
            SubjectStatus::Aborted {
                at_stage: "a".into()
            }
        );
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_string(&StageOutcome::failed(StageFailure::TimedOut {
            seconds: 5,
        }))
        .unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
        assert!(json.contains("\"kind\":\"timed_out\""));
    }
}
