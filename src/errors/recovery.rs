// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Recovery suggestions
//!
//! Operator-facing advice for stages that were skipped or failed.

use crate::pipeline::{StageFailure, Unmet};

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Suggest how to satisfy an unmet precondition
    pub fn for_unmet(stage: &str, unmet: &Unmet) -> Self {
        match unmet {
            Unmet::LicenseMissing { path } => Self {
                action: "Provide a FreeSurfer license".into(),
                steps: vec![
                    format!("Stage '{}' requires a license file at {}", stage, path.display()),
                    "Licenses are free: https://surfer.nmr.mgh.harvard.edu/registration.html".into(),
                    "The license is checked when the stage starts, so it can be added mid-run".into(),
                ],
                commands: vec![format!("cp ~/license.txt {}", path.display())],
            },
            Unmet::InputMissing { path } => Self {
                action: format!("Provide input '{}'", path.display()),
                steps: vec![
                    format!("Stage '{}' needs {} to exist and be non-empty", stage, path.display()),
                    "Check the conversion heuristic covers this scan type".into(),
                ],
                commands: vec![],
            },
            Unmet::UpstreamIncomplete { stage: upstream } => Self {
                action: format!("Re-run stage '{}'", upstream),
                steps: vec![
                    format!(
                        "Stage '{}' consumes outputs of '{}', which did not complete",
                        stage, upstream
                    ),
                    format!("Inspect the logs under the '{}' stage directory", upstream),
                ],
                commands: vec![],
            },
        }
    }

    /// Suggest how to investigate a failed stage
    pub fn for_failure(stage: &str, failure: &StageFailure) -> Self {
        match failure {
            StageFailure::ToolNotAvailable { program } => Self {
                action: format!("Install '{}'", program),
                steps: vec![
                    format!("'{}' was not found on PATH", program),
                    "Install Singularity/Apptainer or register a native tool".into(),
                ],
                commands: vec![format!("which {}", program)],
            },
            StageFailure::Cancelled | StageFailure::TimedOut { .. } => Self {
                action: format!("Re-run stage '{}'", stage),
                steps: vec![
                    "The invocation was terminated before it finished".into(),
                    "Partial outputs are not marked complete and will be rebuilt".into(),
                ],
                commands: vec![],
            },
            _ => Self {
                action: format!("Inspect stage '{}'", stage),
                steps: vec![
                    failure.to_string(),
                    "stdout.log and stderr.log are kept in the stage directory".into(),
                ],
                commands: vec![],
            },
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}
