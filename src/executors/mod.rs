// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Tool executors
//!
//! A stage never builds a shell string. It hands a structured [`Invocation`]
//! to a [`ToolRunner`], which decides how to start the registered tool.

mod cancel;
mod process;
mod registry;
mod slots;

pub use cancel::CancellationToken;
pub use process::ProcessRunner;
pub use registry::{ToolEntry, ToolRegistry, ToolSpec, DEFAULT_RUNTIME};
pub use slots::ToolSlots;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::MriflowError;
use crate::pipeline::StageFailure;

/// A host directory or file made visible to a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bind {
    pub host: PathBuf,
    pub guest: String,
    pub read_only: bool,
}

impl std::fmt::Display for Bind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.guest)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

/// A fully resolved tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// Symbolic tool name
    pub tool: String,
    /// Arguments with all placeholders substituted
    pub args: Vec<String>,
    /// Bind mounts
    pub binds: Vec<Bind>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Paths that must exist and be non-empty once the tool succeeds
    pub expected_outputs: Vec<PathBuf>,
}

impl Invocation {
    /// Create an invocation without binds or expected outputs
    pub fn new(tool: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
            binds: vec![],
            env: BTreeMap::new(),
            expected_outputs: vec![],
        }
    }

    /// Add a bind mount
    pub fn with_bind(mut self, host: impl Into<PathBuf>, guest: &str, read_only: bool) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            guest: guest.to_string(),
            read_only,
        });
        self
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tool)?;
        for bind in &self.binds {
            write!(f, " --bind {}", bind)?;
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Wall-clock duration
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Create a failed output
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// Whether the process exited with status 0
    pub fn success_status(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for anything that can execute an [`Invocation`]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the invocation to completion.
    ///
    /// A non-zero exit is reported through [`ToolOutput::exit_code`]; the
    /// error path is reserved for invocations that never produced an exit
    /// status (missing runtime, spawn failure, cancellation, timeout).
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, StageFailure>;

    /// The concrete command line, for plans and logs
    fn describe(&self, invocation: &Invocation) -> String {
        invocation.to_string()
    }

    /// Check whether the program behind `tool` can be started
    async fn check_available(&self, tool: &str) -> Result<bool, MriflowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let invocation = Invocation::new("mriqc", vec!["/tmp/data".into(), "participant".into()])
            .with_bind("/data/bids", "/tmp/data", true);

        assert_eq!(
            invocation.to_string(),
            "mriqc --bind /data/bids:/tmp/data:ro /tmp/data participant"
        );
    }

    #[test]
    fn test_output_status() {
        assert!(ToolOutput::success("").success_status());
        assert!(!ToolOutput::failure(1, "boom").success_status());
    }
}
