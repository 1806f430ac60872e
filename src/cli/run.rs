// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Run command - process subjects through the pipeline

use colored::Colorize;
use miette::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::{load_pipeline, OutputFormat, RunArgs};
use crate::collate::ResultAggregator;
use crate::executors::{CancellationToken, ProcessRunner, ToolSlots};
use crate::pipeline::{
    PipelineOrchestrator, PipelineValidator, StageRunner, SubjectPaths, SubjectReport,
    SubjectStatus,
};
use crate::subject::Subject;
use crate::utils::{print_header, print_warning, Reporter};

/// Every subject completed, possibly with skipped stages
pub const EXIT_OK: u8 = 0;

/// At least one subject was aborted by a fail-fast stage
pub const EXIT_ABORTED: u8 = 3;

/// Run the pipeline and return the process exit code
pub async fn run(args: RunArgs, verbose: bool) -> Result<u8> {
    let pipeline = load_pipeline(args.pipeline.as_deref())?;
    let registry = args.tools.registry()?;

    let validation = PipelineValidator::ensure_valid(&pipeline, Some(&registry))?;
    if validation.has_warnings() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in &validation.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    let subjects: Vec<Subject> = args.subjects.iter().map(Subject::new).collect();
    if let Some(empty) = subjects.iter().find(|s| s.is_empty()) {
        return Err(miette::miette!(
            "Subject '{}' contains no letters or digits",
            empty.raw()
        ));
    }

    let mut paths = SubjectPaths::new(&args.base, &args.derivs, &args.work, &args.license);
    if let Some(dicom) = &args.dicom {
        paths = paths.with_dicom(dicom);
    }
    if let Some(bids) = &args.bids {
        paths = paths.with_bids(bids);
    }
    if let Some(code) = &args.code {
        paths = paths.with_code(code);
    }

    let cancel = CancellationToken::new();
    let reporter = match (args.format, args.dry_run) {
        (OutputFormat::Json, false) => Reporter::silent(),
        _ => Reporter::stdout(verbose).with_progress(subjects.len() as u64),
    };

    let slots = ToolSlots::from_registry(&registry);
    let tools = ProcessRunner::new(registry).with_timeout(args.timeout.map(Duration::from_secs));
    let runner = StageRunner::new(Arc::new(tools))
        .with_slots(slots)
        .with_aggregator(ResultAggregator::new())
        .with_cancellation(cancel.clone())
        .with_reporter(reporter);
    let orchestrator = PipelineOrchestrator::new(pipeline, runner)?;

    if args.dry_run {
        orchestrator.print_plan(&subjects, &paths)?;
        return Ok(EXIT_OK);
    }

    for tool in orchestrator.check_tools().await {
        warn!(tool = %tool, "tool not available; stages using it will fail");
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", "Interrupted, stopping running tools...".yellow());
                cancel.cancel();
            }
        });
    }

    if args.format == OutputFormat::Text {
        print_header(&format!("Pipeline: {}", orchestrator.pipeline().name));
    }

    let start = Instant::now();
    let reports = orchestrator
        .run_batch(subjects, &paths, args.jobs)
        .await?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&reports)
                .map_err(|e| miette::miette!("Failed to serialize reports: {}", e))?;
            println!("{}", json);
        }
        OutputFormat::Text => print_summary(&reports, start.elapsed()),
    }

    Ok(exit_code(&reports))
}

fn exit_code(reports: &[SubjectReport]) -> u8 {
    if reports.iter().any(SubjectReport::is_aborted) {
        EXIT_ABORTED
    } else {
        EXIT_OK
    }
}

fn print_summary(reports: &[SubjectReport], elapsed: Duration) {
    let count = |pred: fn(&SubjectStatus) -> bool| reports.iter().filter(|r| pred(&r.status)).count();
    let completed = count(|s| matches!(s, SubjectStatus::Completed));
    let skipped = count(|s| matches!(s, SubjectStatus::CompletedWithSkips));
    let aborted = count(|s| matches!(s, SubjectStatus::Aborted { .. }));

    println!();
    let summary = format!(
        "{} subject{} in {:.2}s: {} completed, {} with skips, {} aborted",
        reports.len(),
        if reports.len() == 1 { "" } else { "s" },
        elapsed.as_secs_f64(),
        completed,
        skipped,
        aborted
    );
    if aborted > 0 {
        println!("{}", summary.red().bold());
        for report in reports.iter().filter(|r| r.is_aborted()) {
            print_warning(&format!("{}: {}", report.subject.label(), report.status));
        }
    } else if skipped > 0 {
        println!("{}", summary.yellow().bold());
    } else {
        println!("{}", summary.green().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageFailure, StageOutcome, StageReport, Unmet};
    use std::path::PathBuf;

    fn report(outcome: StageOutcome, aborted_at: Option<&str>) -> SubjectReport {
        SubjectReport::new(
            Subject::new("01"),
            vec![StageReport {
                stage: "convert".into(),
                outcome,
                duration: Duration::ZERO,
            }],
            vec![],
            aborted_at.map(String::from),
        )
    }

    #[test]
    fn test_skips_exit_zero() {
        let skipped = report(
            StageOutcome::skipped(Unmet::LicenseMissing {
                path: PathBuf::from("/fs/license.txt"),
            }),
            None,
        );
        assert_eq!(exit_code(&[skipped]), EXIT_OK);
    }

    #[test]
    fn test_abort_exits_nonzero() {
        let ok = report(StageOutcome::Succeeded, None);
        let aborted = report(
            StageOutcome::failed(StageFailure::ToolExecutionFailed { exit_code: Some(1) }),
            Some("convert"),
        );
        assert_eq!(exit_code(&[ok, aborted]), EXIT_ABORTED);
    }
}
