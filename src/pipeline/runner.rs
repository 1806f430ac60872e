// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Stage runner
//!
//! Turns one stage of the pipeline into a concrete invocation for one
//! subject, runs it and classifies the result.
//!
//! Anything that goes wrong inside the stage becomes a [`StageOutcome`].
//! Only filesystem errors on the work tree and collation contract
//! violations escape as [`MriflowError`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::brain_age::{self, CommandPredictor};
use crate::collate::{CollatedRow, ResultAggregator};
use crate::errors::{MriflowError, MriflowResult};
use crate::executors::{Bind, CancellationToken, Invocation, ToolRunner, ToolSlots};
use crate::lesion;
use crate::pipeline::template::TemplateContext;
use crate::pipeline::{
    Analysis, BindTemplate, InvocationTemplate, Precondition, Stage, StageFailure, StageOutcome,
    Unmet,
};
use crate::subject::Subject;
use crate::utils::Reporter;

/// Written into a stage directory once the stage's outputs are validated
pub const COMPLETE_MARKER: &str = ".complete";

const STDOUT_LOG: &str = "stdout.log";
const STDERR_LOG: &str = "stderr.log";

/// Header of the per-subject brain-age file when the stage does not collate
const DEFAULT_AGE_COLUMNS: &[&str] = &["ID", "Predicted_Age"];

/// Directories a run works with
#[derive(Debug, Clone)]
pub struct SubjectPaths {
    pub base: PathBuf,
    pub dicom: PathBuf,
    pub bids: PathBuf,
    pub derivs: PathBuf,
    pub code: PathBuf,
    pub work: PathBuf,
    pub license: PathBuf,
}

impl SubjectPaths {
    /// Raw data, BIDS and code directories default to `base/{dicom,bids,code}`
    pub fn new(
        base: impl Into<PathBuf>,
        derivs: impl Into<PathBuf>,
        work: impl Into<PathBuf>,
        license: impl Into<PathBuf>,
    ) -> Self {
        let base = resolve_root(base.into());
        Self {
            dicom: base.join("dicom"),
            bids: base.join("bids"),
            code: base.join("code"),
            base,
            derivs: resolve_root(derivs.into()),
            work: resolve_root(work.into()),
            license: resolve_root(license.into()),
        }
    }

    pub fn with_dicom(mut self, dicom: impl Into<PathBuf>) -> Self {
        self.dicom = resolve_root(dicom.into());
        self
    }

    pub fn with_bids(mut self, bids: impl Into<PathBuf>) -> Self {
        self.bids = resolve_root(bids.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<PathBuf>) -> Self {
        self.code = resolve_root(code.into());
        self
    }

    /// `<work>/<label>`
    pub fn subject_dir(&self, subject: &Subject) -> PathBuf {
        self.work.join(subject.label())
    }

    /// `<work>/<label>/<stage>`
    pub fn stage_dir(&self, subject: &Subject, stage: &str) -> PathBuf {
        self.subject_dir(subject).join(stage)
    }

    /// Completion marker of `stage` for `subject`
    pub fn marker(&self, subject: &Subject, stage: &str) -> PathBuf {
        self.stage_dir(subject, stage).join(COMPLETE_MARKER)
    }

    /// Template values shared by every stage of `subject`
    pub fn context(&self, subject: &Subject) -> TemplateContext {
        TemplateContext::for_subject(subject)
            .with_path("base", &self.base)
            .with_path("dicom", &self.dicom)
            .with_path("bids", &self.bids)
            .with_path("derivs", &self.derivs)
            .with_path("code", &self.code)
            .with_path("work", &self.work)
    }
}

/// Absolute form of an operator-supplied root with `.` and `..` folded away.
///
/// Roots come from the command line and may climb out of the working
/// directory. Folding them here leaves traversal checks on rendered paths to
/// catch only what templates and subject tokens introduce.
fn resolve_root(path: PathBuf) -> PathBuf {
    let absolute = std::path::absolute(&path).unwrap_or(path);
    let mut folded = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other.as_os_str()),
        }
    }
    folded
}

/// Why a stage stopped before succeeding
enum Interrupt {
    Skipped(Unmet),
    Failed(StageFailure),
    Fatal(MriflowError),
}

impl From<StageFailure> for Interrupt {
    fn from(failure: StageFailure) -> Self {
        Self::Failed(failure)
    }
}

impl From<MriflowError> for Interrupt {
    fn from(error: MriflowError) -> Self {
        Self::Fatal(error)
    }
}

/// Template and traversal errors fail the stage before anything is spawned
fn invalid(error: MriflowError) -> Interrupt {
    Interrupt::Failed(StageFailure::InvalidInvocation {
        message: error.to_string(),
    })
}

/// Runs single stages for single subjects
#[derive(Clone)]
pub struct StageRunner {
    tools: Arc<dyn ToolRunner>,
    slots: ToolSlots,
    aggregator: ResultAggregator,
    cancel: CancellationToken,
    env: BTreeMap<String, String>,
    reporter: Reporter,
}

impl StageRunner {
    pub fn new(tools: Arc<dyn ToolRunner>) -> Self {
        Self {
            tools,
            slots: ToolSlots::unlimited(),
            aggregator: ResultAggregator::new(),
            cancel: CancellationToken::new(),
            env: BTreeMap::new(),
            reporter: Reporter::silent(),
        }
    }

    /// Share tool slots with other runners
    pub fn with_slots(mut self, slots: ToolSlots) -> Self {
        self.slots = slots;
        self
    }

    /// Share table locks with other runners
    pub fn with_aggregator(mut self, aggregator: ResultAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Environment passed to every invocation
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `stage` for `subject`.
    ///
    /// Preconditions are evaluated now, not when the pipeline started.
    pub async fn run(
        &self,
        stage: &Stage,
        subject: &Subject,
        paths: &SubjectPaths,
    ) -> MriflowResult<StageOutcome> {
        match self.execute(stage, subject, paths).await {
            Ok(()) => Ok(StageOutcome::Succeeded),
            Err(Interrupt::Skipped(unmet)) => {
                info!(stage = %stage.name, subject = %subject, reason = %unmet, "stage skipped");
                Ok(StageOutcome::skipped(unmet))
            }
            Err(Interrupt::Failed(failure)) => {
                warn!(stage = %stage.name, subject = %subject, %failure, "stage failed");
                Ok(StageOutcome::failed(failure))
            }
            Err(Interrupt::Fatal(error)) => Err(error),
        }
    }

    /// The invocation `stage` would run, for plans and dry runs.
    ///
    /// License placeholders are bound from the configured path without
    /// checking that the file exists.
    pub fn plan(
        &self,
        stage: &Stage,
        subject: &Subject,
        paths: &SubjectPaths,
    ) -> MriflowResult<Option<Invocation>> {
        let mut ctx = self.stage_context(stage, subject, paths)?;
        bind_license(&mut ctx, &paths.license);

        stage
            .invocation
            .as_ref()
            .map(|template| self.render_invocation(template, stage, &ctx))
            .transpose()
    }

    /// Human-readable command line for an invocation
    pub fn describe(&self, invocation: &Invocation) -> String {
        self.tools.describe(invocation)
    }

    /// Whether `tool` can be started on this machine
    pub async fn check_available(&self, tool: &str) -> MriflowResult<bool> {
        self.tools.check_available(tool).await
    }

    fn stage_context(
        &self,
        stage: &Stage,
        subject: &Subject,
        paths: &SubjectPaths,
    ) -> MriflowResult<TemplateContext> {
        let mut ctx = paths
            .context(subject)
            .with_path("stage_dir", &paths.stage_dir(subject, &stage.name));

        if let Some(template) = &stage.output_dir {
            let output_dir = ctx.render_path(template)?;
            ctx.set("output_dir", output_dir.to_string_lossy());
        }

        Ok(ctx)
    }

    async fn execute(
        &self,
        stage: &Stage,
        subject: &Subject,
        paths: &SubjectPaths,
    ) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(StageFailure::Cancelled.into());
        }

        let stage_dir = paths.stage_dir(subject, &stage.name);
        let ctx = self.stage_context(stage, subject, paths).map_err(invalid)?;
        let ctx = self.check_preconditions(stage, ctx, subject, paths)?;

        let invocation = stage
            .invocation
            .as_ref()
            .map(|template| self.render_invocation(template, stage, &ctx))
            .transpose()
            .map_err(invalid)?;

        remove_marker(&stage_dir)?;
        create_dir(&stage_dir)?;
        if let Some(output_dir) = ctx.get("output_dir") {
            create_dir(Path::new(output_dir))?;
        }
        if let Some(Analysis::BrainAge { slices, .. }) = &stage.analysis {
            create_dir(&ctx.render_path(slices).map_err(invalid)?)?;
        }

        let command = invocation.as_ref().map(|inv| self.tools.describe(inv));
        self.reporter
            .stage_started(subject.label(), &stage.name, command.as_deref());

        if let Some(invocation) = &invocation {
            self.invoke(invocation, &stage_dir).await?;
        }

        let rows = match &stage.analysis {
            Some(analysis) => self.analyze(analysis, stage, subject, &ctx).await?,
            None => vec![],
        };

        if let Some(collation) = &stage.collate {
            let table = ctx.render_path(&collation.table).map_err(invalid)?;
            self.aggregator
                .append(&table, &collation.columns, &rows)
                .await?;
        }

        write_marker(&stage_dir)?;
        debug!(stage = %stage.name, subject = %subject, "stage complete");
        Ok(())
    }

    /// Evaluate preconditions in order; the first unmet one skips the stage.
    ///
    /// A verified license is bound into the returned context, so only stages
    /// that checked for it can render license placeholders.
    fn check_preconditions(
        &self,
        stage: &Stage,
        mut ctx: TemplateContext,
        subject: &Subject,
        paths: &SubjectPaths,
    ) -> Result<TemplateContext, Interrupt> {
        for precondition in &stage.preconditions {
            match precondition {
                Precondition::LicensePresent => {
                    if !is_nonempty_file(&paths.license) {
                        return Err(Interrupt::Skipped(Unmet::LicenseMissing {
                            path: paths.license.clone(),
                        }));
                    }
                    bind_license(&mut ctx, &paths.license);
                }
                Precondition::FileExists(template) => {
                    let path = ctx.render_path(template).map_err(invalid)?;
                    if !is_nonempty(&path) {
                        return Err(Interrupt::Skipped(Unmet::InputMissing { path }));
                    }
                }
                Precondition::UpstreamComplete(upstream) => {
                    if !paths.marker(subject, upstream).is_file() {
                        return Err(Interrupt::Skipped(Unmet::UpstreamIncomplete {
                            stage: upstream.clone(),
                        }));
                    }
                }
            }
        }
        Ok(ctx)
    }

    fn render_invocation(
        &self,
        template: &InvocationTemplate,
        stage: &Stage,
        ctx: &TemplateContext,
    ) -> MriflowResult<Invocation> {
        let args = template
            .args
            .iter()
            .map(|arg| ctx.render(arg))
            .collect::<MriflowResult<Vec<_>>>()?;

        let mut invocation = Invocation::new(template.tool.clone(), args);
        invocation.binds = render_binds(&template.binds, ctx)?;

        for (key, value) in self.env.iter().chain(stage.env.iter()) {
            invocation.env.insert(key.clone(), ctx.render(value)?);
        }

        invocation.expected_outputs = stage
            .expected_outputs
            .iter()
            .map(|path| ctx.render_path(path))
            .collect::<MriflowResult<Vec<_>>>()?;

        Ok(invocation)
    }

    /// Run the tool under its slot, keep its logs and check its outputs
    async fn invoke(&self, invocation: &Invocation, stage_dir: &Path) -> Result<(), Interrupt> {
        info!(tool = %invocation.tool, "running {}", self.tools.describe(invocation));

        let output = {
            let _slot = self.slots.acquire(&invocation.tool, &self.cancel).await?;
            self.tools.run(invocation, &self.cancel).await?
        };

        save_log(&stage_dir.join(STDOUT_LOG), &output.stdout);
        save_log(&stage_dir.join(STDERR_LOG), &output.stderr);

        if !output.success_status() {
            return Err(StageFailure::ToolExecutionFailed {
                exit_code: output.exit_code,
            }
            .into());
        }

        for path in &invocation.expected_outputs {
            if !is_nonempty(path) {
                return Err(StageFailure::MissingOutput { path: path.clone() }.into());
            }
        }

        Ok(())
    }

    async fn analyze(
        &self,
        analysis: &Analysis,
        stage: &Stage,
        subject: &Subject,
        ctx: &TemplateContext,
    ) -> Result<Vec<CollatedRow>, Interrupt> {
        match analysis {
            Analysis::ClusterStats {
                report,
                thresholds,
                min_cluster_size,
            } => {
                let mut rows = Vec::with_capacity(thresholds.len());
                for threshold in thresholds {
                    let ctx = ctx
                        .clone()
                        .with("threshold", lesion::format_threshold(*threshold));
                    let path = ctx.render_path(report).map_err(invalid)?;
                    let stats = lesion::read_cluster_stats(&path)?;
                    rows.push(lesion::stats_row(
                        subject.label(),
                        *threshold,
                        *min_cluster_size,
                        &stats,
                    ));
                }
                Ok(rows)
            }
            Analysis::BrainAge {
                model,
                model_args,
                model_binds,
                slices,
                batch_size,
                scan_marker,
                result_file,
            } => {
                let slices_dir = ctx.render_path(slices).map_err(invalid)?;
                let args = model_args
                    .iter()
                    .map(|arg| ctx.render(arg))
                    .collect::<MriflowResult<Vec<_>>>()
                    .map_err(invalid)?;
                let binds = render_binds(model_binds, ctx).map_err(invalid)?;

                let files = brain_age::list_slices(&slices_dir).map_err(invalid)?;
                if files.is_empty() {
                    return Err(StageFailure::EmptySliceSet {
                        directory: slices_dir,
                    }
                    .into());
                }

                let predictor = CommandPredictor::new(self.tools.clone(), model.clone(), &slices_dir)
                    .with_args(args)
                    .with_binds(binds);

                let estimate = {
                    let _slot = self.slots.acquire(model, &self.cancel).await?;
                    brain_age::estimate_age(
                        &predictor,
                        subject.label(),
                        &files,
                        *batch_size,
                        scan_marker,
                        &self.cancel,
                    )
                    .await?
                };
                info!(
                    subject = %subject,
                    predicted_age = estimate.predicted_age,
                    scans = estimate.group_medians.len(),
                    "brain age estimated"
                );

                let row = CollatedRow::new(subject.label(), [estimate.predicted_age]);

                if let Some(template) = result_file {
                    let path = ctx.render_path(template).map_err(invalid)?;
                    let columns: Vec<String> = match &stage.collate {
                        Some(collation) => collation.columns.clone(),
                        None => DEFAULT_AGE_COLUMNS.iter().map(|c| c.to_string()).collect(),
                    };
                    write_result_file(&path, &columns, &row)?;
                }

                Ok(vec![row])
            }
        }
    }
}

fn render_binds(binds: &[BindTemplate], ctx: &TemplateContext) -> MriflowResult<Vec<Bind>> {
    binds
        .iter()
        .map(|bind| {
            Ok(Bind {
                host: ctx.render_path(&bind.host)?,
                guest: ctx.render(&bind.guest)?,
                read_only: bind.read_only,
            })
        })
        .collect()
}

fn bind_license(ctx: &mut TemplateContext, license: &Path) {
    ctx.set("license", license.to_string_lossy());
    ctx.set(
        "license_name",
        license
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
    );
}

fn is_nonempty_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// A non-empty file, or a directory with at least one entry
fn is_nonempty(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(m) if m.is_dir() => fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some()),
        Ok(m) => m.len() > 0,
        Err(_) => false,
    }
}

fn create_dir(path: &Path) -> MriflowResult<()> {
    fs::create_dir_all(path).map_err(|e| MriflowError::directory(path, e))
}

fn remove_marker(stage_dir: &Path) -> MriflowResult<()> {
    let marker = stage_dir.join(COMPLETE_MARKER);
    match fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MriflowError::FileWriteError {
            path: marker,
            error: e.to_string(),
        }),
    }
}

fn write_marker(stage_dir: &Path) -> MriflowResult<()> {
    let marker = stage_dir.join(COMPLETE_MARKER);
    let finished = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    fs::write(&marker, format!("{}\n", finished)).map_err(|e| MriflowError::FileWriteError {
        path: marker,
        error: e.to_string(),
    })
}

fn save_log(path: &Path, content: &str) {
    if let Err(e) = fs::write(path, content) {
        warn!(path = %path.display(), error = %e, "could not save tool log");
    }
}

fn write_result_file(path: &Path, columns: &[String], row: &CollatedRow) -> MriflowResult<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let content = format!("{}\n{}\n", columns.join(","), row.fields().join(","));
    fs::write(path, content).map_err(|e| MriflowError::FileWriteError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}
