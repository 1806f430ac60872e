// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Slice scoring models

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::executors::{Bind, CancellationToken, Invocation, ToolRunner};
use crate::pipeline::StageFailure;

/// Where the slice directory is mounted inside the model's filesystem view
pub const SLICE_MOUNT: &str = "/tmp/slices";

/// Scores slice images
#[async_trait]
pub trait Predictor: Send + Sync {
    /// One score per slice, in input order
    async fn predict_batch(
        &self,
        slices: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<Vec<f64>, StageFailure>;
}

/// Runs a registered model tool once per batch.
///
/// The tool receives `model_args` followed by one guest path per slice and
/// must print one number per line on stdout, in the same order.
pub struct CommandPredictor {
    runner: Arc<dyn ToolRunner>,
    tool: String,
    args: Vec<String>,
    slices_dir: PathBuf,
    binds: Vec<Bind>,
}

impl CommandPredictor {
    pub fn new(runner: Arc<dyn ToolRunner>, tool: impl Into<String>, slices_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool: tool.into(),
            args: vec![],
            slices_dir: slices_dir.into(),
            binds: vec![],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_binds(mut self, binds: Vec<Bind>) -> Self {
        self.binds = binds;
        self
    }

    fn invocation(&self, slices: &[PathBuf]) -> Result<Invocation, StageFailure> {
        let mut args = self.args.clone();
        for slice in slices {
            args.push(guest_path(&self.slices_dir, slice)?);
        }

        let mut invocation = Invocation::new(self.tool.clone(), args).with_bind(
            self.slices_dir.clone(),
            SLICE_MOUNT,
            true,
        );
        invocation.binds.extend(self.binds.iter().cloned());
        Ok(invocation)
    }
}

fn guest_path(slices_dir: &Path, slice: &Path) -> Result<String, StageFailure> {
    let name = slice
        .strip_prefix(slices_dir)
        .map_err(|_| StageFailure::InvalidInvocation {
            message: format!(
                "slice {} is outside {}",
                slice.display(),
                slices_dir.display()
            ),
        })?;
    Ok(format!("{}/{}", SLICE_MOUNT, name.display()))
}

/// Parse one score per non-blank line
pub(crate) fn parse_scores(stdout: &str) -> Result<Vec<f64>, StageFailure> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(StageFailure::OutputParseFailed {
                message: format!("'{}' is not a score", line),
            }),
        })
        .collect()
}

#[async_trait]
impl Predictor for CommandPredictor {
    async fn predict_batch(
        &self,
        slices: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<Vec<f64>, StageFailure> {
        let invocation = self.invocation(slices)?;
        let output = self.runner.run(&invocation, cancel).await?;

        if !output.success_status() {
            return Err(StageFailure::ToolExecutionFailed {
                exit_code: output.exit_code,
            });
        }

        parse_scores(&output.stdout)
    }
}
