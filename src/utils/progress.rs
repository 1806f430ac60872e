// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Progress reporting
//!
//! Stage and subject lines for the operator. With several subjects in flight
//! the lines are prefixed with the subject label and printed above a
//! progress bar.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::errors::RecoverySuggestion;
use crate::pipeline::{StageOutcome, StageReport, SubjectReport, SubjectStatus};

/// Create a progress bar for determinate progress
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message(message.to_string());
    pb
}

/// Where stage and subject lines go
#[derive(Clone)]
pub struct Reporter {
    enabled: bool,
    verbose: bool,
    bar: Option<ProgressBar>,
}

impl Reporter {
    /// Print lines to stdout
    pub fn stdout(verbose: bool) -> Self {
        Self {
            enabled: true,
            verbose,
            bar: None,
        }
    }

    /// Print nothing
    pub fn silent() -> Self {
        Self {
            enabled: false,
            verbose: false,
            bar: None,
        }
    }

    /// Print lines above a bar counting finished subjects
    pub fn with_progress(mut self, subjects: u64) -> Self {
        if self.enabled && subjects > 1 {
            self.bar = Some(create_progress_bar(subjects, "Subjects"));
        }
        self
    }

    fn line(&self, text: String) {
        if !self.enabled {
            return;
        }
        match &self.bar {
            Some(bar) => bar.println(text),
            None => println!("{}", text),
        }
    }

    /// One line per stage, naming the invocation about to run
    pub fn stage_started(&self, label: &str, stage: &str, command: Option<&str>) {
        let what = command.unwrap_or("(no external tool)");
        self.line(format!("  {} [{}] {}: {}", "→".blue(), label, stage.bold(), what.dimmed()));
    }

    pub fn stage_finished(&self, label: &str, report: &StageReport) {
        let secs = report.duration.as_secs_f64();
        let text = match &report.outcome {
            StageOutcome::Succeeded => {
                format!("  {} [{}] {} ({:.2}s)", "✓".green(), label, report.stage.bold(), secs)
            }
            StageOutcome::SkippedPrecondition { reason } => format!(
                "  {} [{}] {} {}",
                "○".dimmed(),
                label,
                report.stage.dimmed(),
                format!("skipped: {}", reason).yellow()
            ),
            StageOutcome::Failed { failure } => format!(
                "  {} [{}] {} {}",
                "✗".red(),
                label,
                report.stage.bold(),
                format!("failed: {}", failure).red()
            ),
        };
        self.line(text);

        if self.verbose {
            let suggestion = match &report.outcome {
                StageOutcome::SkippedPrecondition { reason } => {
                    Some(RecoverySuggestion::for_unmet(&report.stage, reason))
                }
                StageOutcome::Failed { failure } => {
                    Some(RecoverySuggestion::for_failure(&report.stage, failure))
                }
                StageOutcome::Succeeded => None,
            };
            if let Some(suggestion) = suggestion {
                self.line(suggestion.to_string().trim_end().dimmed().to_string());
            }
        }
    }

    /// Final per-subject status line
    pub fn subject_finished(&self, report: &SubjectReport) {
        let status = report.status.to_string();
        let styled = match report.status {
            SubjectStatus::Completed => status.green().bold(),
            SubjectStatus::CompletedWithSkips => status.yellow().bold(),
            SubjectStatus::Aborted { .. } => status.red().bold(),
        };
        self.line(format!("{} {}", report.subject.label().bold(), styled));

        if !report.not_run.is_empty() {
            self.line(format!("  not run: {}", report.not_run.join(", ")).dimmed().to_string());
        }

        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
