// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Pipeline orchestrator
//!
//! Runs the stage graph for one subject in dependency order and applies each
//! stage's failure policy. Stages on the same level of the graph run
//! concurrently. Subjects run on a bounded worker pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::errors::{MriflowError, MriflowResult};
use crate::pipeline::runner::{StageRunner, SubjectPaths};
use crate::pipeline::{
    DagBuilder, FailurePolicy, Pipeline, StageOutcome, StageReport, SubjectReport, Unmet,
};
use crate::subject::Subject;

/// Runs a pipeline for subjects
#[derive(Clone)]
pub struct PipelineOrchestrator {
    pipeline: Arc<Pipeline>,
    dag: Arc<DagBuilder>,
    levels: Arc<Vec<Vec<usize>>>,
    /// Direct dependencies of each stage, by declaration index
    dependencies: Arc<Vec<Vec<usize>>>,
    runner: StageRunner,
}

impl PipelineOrchestrator {
    /// Build the stage graph; the pipeline's environment is handed to `runner`
    pub fn new(pipeline: Pipeline, runner: StageRunner) -> MriflowResult<Self> {
        let dag = DagBuilder::build(&pipeline)?;
        let levels = dag.levels()?;

        let dependencies = pipeline
            .stages
            .iter()
            .map(|stage| {
                stage
                    .depends_on
                    .iter()
                    .filter_map(|dep| pipeline.stages.iter().position(|s| &s.name == dep))
                    .collect()
            })
            .collect();

        let runner = runner.with_env(pipeline.env.clone());

        Ok(Self {
            pipeline: Arc::new(pipeline),
            dag: Arc::new(dag),
            levels: Arc::new(levels),
            dependencies: Arc::new(dependencies),
            runner,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    /// Run every stage for `subject`.
    ///
    /// A stage whose dependency did not succeed is skipped. A fail-fast
    /// failure lets the rest of its level finish and then stops the subject;
    /// later stages are listed in [`SubjectReport::not_run`].
    pub async fn run_subject(
        &self,
        subject: Subject,
        paths: &SubjectPaths,
    ) -> MriflowResult<SubjectReport> {
        let start = Instant::now();
        info!(subject = %subject, raw = subject.raw(), "starting subject");
        self.prepare_dirs(&subject, paths)?;

        let reporter = self.runner.reporter().clone();
        let mut outcomes: Vec<Option<StageOutcome>> = vec![None; self.pipeline.stages.len()];
        let mut reports = Vec::with_capacity(self.pipeline.stages.len());
        let mut aborted_at = None;
        let mut not_run = Vec::new();

        for level in self.levels.iter() {
            if aborted_at.is_some() {
                not_run.extend(level.iter().map(|&idx| self.pipeline.stages[idx].name.clone()));
                continue;
            }

            let mut tasks = JoinSet::new();
            let mut finished = Vec::with_capacity(level.len());

            for &idx in level {
                let stage_name = &self.pipeline.stages[idx].name;

                if let Some(&dep) = self.dependencies[idx]
                    .iter()
                    .find(|&&dep| !matches!(outcomes[dep], Some(StageOutcome::Succeeded)))
                {
                    let report = StageReport {
                        stage: stage_name.clone(),
                        outcome: StageOutcome::skipped(Unmet::UpstreamIncomplete {
                            stage: self.pipeline.stages[dep].name.clone(),
                        }),
                        duration: Default::default(),
                    };
                    reporter.stage_finished(subject.label(), &report);
                    finished.push((idx, report));
                    continue;
                }

                let pipeline = self.pipeline.clone();
                let runner = self.runner.clone();
                let subject = subject.clone();
                let paths = paths.clone();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let outcome = runner.run(&pipeline.stages[idx], &subject, &paths).await;
                    (idx, outcome, started.elapsed())
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (idx, outcome, duration) = match joined {
                    Ok(done) => done,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(_) => continue,
                };
                let report = StageReport {
                    stage: self.pipeline.stages[idx].name.clone(),
                    outcome: outcome?,
                    duration,
                };
                reporter.stage_finished(subject.label(), &report);
                finished.push((idx, report));
            }

            finished.sort_by_key(|(idx, _)| *idx);
            for (idx, report) in finished {
                let stage = &self.pipeline.stages[idx];
                if aborted_at.is_none()
                    && stage.policy == FailurePolicy::FailFast
                    && matches!(report.outcome, StageOutcome::Failed { .. })
                {
                    aborted_at = Some(stage.name.clone());
                }
                outcomes[idx] = Some(report.outcome.clone());
                reports.push(report);
            }
        }

        let report = SubjectReport::new(subject, reports, not_run, aborted_at);
        info!(
            subject = %report.subject,
            status = %report.status,
            elapsed = ?start.elapsed(),
            "subject finished"
        );
        reporter.subject_finished(&report);
        Ok(report)
    }

    /// Run `subjects` with at most `jobs` in flight.
    ///
    /// Reports come back in input order. A fatal error cancels the
    /// remaining invocations and is returned once every subject has stopped.
    pub async fn run_batch(
        &self,
        subjects: Vec<Subject>,
        paths: &SubjectPaths,
        jobs: usize,
    ) -> MriflowResult<Vec<SubjectReport>> {
        let pool = Arc::new(Semaphore::new(jobs.max(1)));
        let mut tasks = JoinSet::new();

        for (position, subject) in subjects.into_iter().enumerate() {
            let pool = pool.clone();
            let orchestrator = self.clone();
            let paths = paths.clone();
            tasks.spawn(async move {
                let _worker = pool.acquire_owned().await;
                (position, orchestrator.run_subject(subject, &paths).await)
            });
        }

        let mut reports = Vec::new();
        let mut fatal = None;

        while let Some(joined) = tasks.join_next().await {
            let (position, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            match result {
                Ok(report) => reports.push((position, report)),
                Err(e) => {
                    error!(error = %e, "fatal error, cancelling remaining subjects");
                    self.runner.cancellation().cancel();
                    fatal.get_or_insert(e);
                }
            }
        }

        self.runner.reporter().finish();

        if let Some(e) = fatal {
            return Err(e);
        }

        reports.sort_by_key(|(position, _)| *position);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }

    /// Print the levels and the invocation each stage would run
    pub fn print_plan(&self, subjects: &[Subject], paths: &SubjectPaths) -> MriflowResult<()> {
        println!();
        println!("{}: {}", "Pipeline".bold(), self.pipeline.name);
        println!("{}", "═".repeat(50));
        print!("{}", self.dag.to_text(&self.pipeline)?);

        for subject in subjects {
            println!();
            println!("{} {}", "Subject".bold(), subject.label());
            for level in self.levels.iter() {
                for &idx in level {
                    let stage = &self.pipeline.stages[idx];
                    let line = match self.runner.plan(stage, subject, paths) {
                        Ok(Some(invocation)) => self.runner.describe(&invocation),
                        Ok(None) => "(no external tool)".to_string(),
                        Err(e) => format!("invalid: {}", e).red().to_string(),
                    };
                    println!("  {} {}: {}", "→".blue(), stage.name.bold(), line.dimmed());
                }
            }
        }

        println!();
        Ok(())
    }

    /// Tools referenced by the pipeline that cannot be started
    pub async fn check_tools(&self) -> Vec<String> {
        let mut tools: Vec<&str> = self
            .pipeline
            .stages
            .iter()
            .flat_map(|stage| stage.tool_names())
            .collect();
        tools.sort_unstable();
        tools.dedup();

        let mut missing = Vec::new();
        for tool in tools {
            if !matches!(self.runner.check_available(tool).await, Ok(true)) {
                missing.push(tool.to_string());
            }
        }
        missing
    }

    /// Create the subject's stage directories; safe to repeat
    fn prepare_dirs(&self, subject: &Subject, paths: &SubjectPaths) -> MriflowResult<()> {
        for stage in &self.pipeline.stages {
            let dir = paths.stage_dir(subject, &stage.name);
            create_dir(&dir)?;
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> MriflowResult<()> {
    std::fs::create_dir_all(path).map_err(|e| MriflowError::directory(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{CancellationToken, Invocation, ToolOutput, ToolRunner, ToolSlots};
    use crate::pipeline::{StageFailure, SubjectStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Exit codes per tool; unscripted tools succeed and create their outputs
    #[derive(Default)]
    struct Scripted {
        exit_codes: HashMap<String, i32>,
        ran: Mutex<Vec<String>>,
        /// File written while the named tool runs
        create_while: Mutex<Option<(String, std::path::PathBuf)>>,
    }

    impl Scripted {
        fn failing(tool: &str) -> Self {
            let mut exit_codes = HashMap::new();
            exit_codes.insert(tool.to_string(), 1);
            Self {
                exit_codes,
                ..Default::default()
            }
        }

        fn ran(&self) -> Vec<String> {
            let mut ran = self.ran.lock().unwrap().clone();
            ran.sort();
            ran
        }
    }

    #[async_trait]
    impl ToolRunner for Scripted {
        async fn run(
            &self,
            invocation: &Invocation,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput, StageFailure> {
            self.ran.lock().unwrap().push(invocation.tool.clone());
            if let Some((tool, path)) = self.create_while.lock().unwrap().as_ref() {
                if *tool == invocation.tool {
                    fs::write(path, "key").unwrap();
                }
            }
            let code = self.exit_codes.get(&invocation.tool).copied().unwrap_or(0);
            if code != 0 {
                return Ok(ToolOutput::failure(code, "boom"));
            }
            for path in &invocation.expected_outputs {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, "data").unwrap();
            }
            Ok(ToolOutput::success(""))
        }

        async fn check_available(&self, _tool: &str) -> Result<bool, MriflowError> {
            Ok(true)
        }
    }

    /// Writes lesion results the way the segmentation container does,
    /// including the summary file it appends to without a lock
    struct Segmentation;

    #[async_trait]
    impl ToolRunner for Segmentation {
        async fn run(
            &self,
            invocation: &Invocation,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput, StageFailure> {
            let label = invocation
                .args
                .iter()
                .skip_while(|arg| *arg != "--subject")
                .nth(1)
                .unwrap()
                .clone();
            let output = &invocation
                .binds
                .iter()
                .find(|bind| bind.guest == "/tmp/output")
                .unwrap()
                .host;

            let dir = output.join(&label);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("wmh_mask_prob.nii.gz"), "nii").unwrap();
            fs::write(
                dir.join("wmh_mask_bin0.9_stats.txt"),
                "WMH number 4\nWMH volume 12.5\n",
            )
            .unwrap();

            let mut own = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(output.join("WMHstats_collated.csv"))
                .unwrap();
            writeln!(own, "{},0.9,5,4,12.5", label).unwrap();
            Ok(ToolOutput::success(""))
        }

        async fn check_available(&self, _tool: &str) -> Result<bool, MriflowError> {
            Ok(true)
        }
    }

    const PIPELINE: &str = r#"
name: test
stages:
  - name: convert
    invocation: { tool: heudiconv }
  - name: qc
    policy: fail_soft
    depends_on: [convert]
    invocation: { tool: mriqc }
  - name: seg
    policy: fail_soft
    depends_on: [convert]
    preconditions: [license_present]
    invocation: { tool: fastsurfer, args: ["{license}"] }
  - name: seg-qc
    policy: fail_soft
    depends_on: [seg]
    invocation: { tool: qatools }
"#;

    fn paths(root: &Path) -> SubjectPaths {
        SubjectPaths::new(
            root.join("base"),
            root.join("derivs"),
            root.join("work"),
            root.join("license.txt"),
        )
    }

    fn orchestrator(tools: Arc<Scripted>) -> PipelineOrchestrator {
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        PipelineOrchestrator::new(pipeline, StageRunner::new(tools)).unwrap()
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        fs::write(&paths.license, "key").unwrap();
        let tools = Arc::new(Scripted::default());

        let report = orchestrator(tools.clone())
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(report.status, SubjectStatus::Completed);
        assert_eq!(report.stages.len(), 4);
        assert_eq!(tools.ran(), vec!["fastsurfer", "heudiconv", "mriqc", "qatools"]);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_remaining_stages() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let tools = Arc::new(Scripted::failing("heudiconv"));

        let report = orchestrator(tools.clone())
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(
            report.status,
            SubjectStatus::Aborted {
                at_stage: "convert".into()
            }
        );
        assert_eq!(report.not_run, vec!["qc", "seg", "seg-qc"]);
        assert_eq!(tools.ran(), vec!["heudiconv"]);
        assert!(report.outcome("qc").is_none());
    }

    #[tokio::test]
    async fn test_fail_soft_continues_with_skips() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        fs::write(&paths.license, "key").unwrap();
        let tools = Arc::new(Scripted::failing("mriqc"));

        let report = orchestrator(tools.clone())
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(report.status, SubjectStatus::CompletedWithSkips);
        assert!(report.not_run.is_empty());
        assert_eq!(
            report.outcome("qc"),
            Some(&StageOutcome::failed(StageFailure::ToolExecutionFailed {
                exit_code: Some(1)
            }))
        );
        assert_eq!(report.outcome("seg-qc"), Some(&StageOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_missing_license_skips_dependents() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let tools = Arc::new(Scripted::default());

        let report = orchestrator(tools.clone())
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(report.status, SubjectStatus::CompletedWithSkips);
        assert!(matches!(
            report.outcome("seg"),
            Some(StageOutcome::SkippedPrecondition {
                reason: Unmet::LicenseMissing { .. }
            })
        ));
        assert_eq!(
            report.outcome("seg-qc"),
            Some(&StageOutcome::skipped(Unmet::UpstreamIncomplete {
                stage: "seg".into()
            }))
        );
        assert_eq!(tools.ran(), vec!["heudiconv", "mriqc"]);
    }

    #[tokio::test]
    async fn test_license_checked_when_stage_is_reached() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        assert!(!paths.license.exists());

        // The license appears while conversion runs
        let tools = Arc::new(Scripted {
            create_while: Mutex::new(Some(("heudiconv".into(), paths.license.clone()))),
            ..Default::default()
        });

        let report = orchestrator(tools)
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(report.outcome("seg"), Some(&StageOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_second_run_reuses_directories() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let orchestrator = orchestrator(Arc::new(Scripted::default()));

        let first = orchestrator
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();
        let second = orchestrator
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(first.status, second.status);
        assert!(paths.stage_dir(&Subject::new("01"), "seg-qc").is_dir());
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let orchestrator = PipelineOrchestrator::new(
            Pipeline::from_yaml(PIPELINE).unwrap(),
            StageRunner::new(Arc::new(Scripted::default()))
                .with_slots(ToolSlots::unlimited().with_limit("fastsurfer", 1)),
        )
        .unwrap();

        let subjects = ["03", "01", "02"].map(Subject::new).to_vec();
        let reports = orchestrator.run_batch(subjects, &paths, 2).await.unwrap();

        let labels: Vec<&str> = reports.iter().map(|r| r.subject.label()).collect();
        assert_eq!(labels, vec!["sub-03", "sub-01", "sub-02"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_stages() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orchestrator = PipelineOrchestrator::new(
            Pipeline::from_yaml(PIPELINE).unwrap(),
            StageRunner::new(Arc::new(Scripted::default())).with_cancellation(cancel),
        )
        .unwrap();

        let report = orchestrator
            .run_subject(Subject::new("01"), &paths)
            .await
            .unwrap();

        assert_eq!(
            report.outcome("convert"),
            Some(&StageOutcome::failed(StageFailure::Cancelled))
        );
        assert!(report.is_aborted());
    }

    #[tokio::test]
    async fn test_lesion_table_has_one_row_per_subject() {
        let temp = TempDir::new().unwrap();
        let paths = paths(temp.path());
        let subjects = ["01", "02", "03"].map(Subject::new).to_vec();
        for subject in &subjects {
            let anat = paths.bids.join(subject.label()).join("anat");
            fs::create_dir_all(&anat).unwrap();
            for modality in ["T1w", "FLAIR"] {
                fs::write(
                    anat.join(format!("{}_{}.nii.gz", subject.label(), modality)),
                    "nii",
                )
                .unwrap();
            }
        }

        let mut pipeline = Pipeline::standard().unwrap();
        pipeline.stages.retain(|s| s.name == "lesion-segmentation");
        pipeline.stages[0].depends_on.clear();
        let orchestrator =
            PipelineOrchestrator::new(pipeline, StageRunner::new(Arc::new(Segmentation))).unwrap();

        let reports = orchestrator.run_batch(subjects, &paths, 3).await.unwrap();
        assert!(reports.iter().all(|r| r.status == SubjectStatus::Completed));

        let table = fs::read_to_string(paths.derivs.join("WMHstats_collated.csv")).unwrap();
        let mut lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines.remove(0),
            "ID,probability_threshold_used,min_cluster_size_used,WMH_number,WMH_volume"
        );
        lines.sort();
        assert_eq!(
            lines,
            vec![
                "sub-01,0.9,5,4,12.5",
                "sub-02,0.9,5,4,12.5",
                "sub-03,0.9,5,4,12.5"
            ]
        );
    }
}
