// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Process executor
//!
//! Starts registered tools as child processes, either through the container
//! runtime or directly on the host.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Bind, CancellationToken, Invocation, ToolOutput, ToolRegistry, ToolRunner, ToolSpec};
use crate::errors::MriflowError;
use crate::pipeline::StageFailure;

/// Runs invocations as child processes
pub struct ProcessRunner {
    registry: ToolRegistry,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// Create a runner backed by `registry`
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    /// Terminate any invocation that runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the program and argument vector for an invocation
    pub fn build_command(&self, invocation: &Invocation) -> Result<(String, Vec<String>), MriflowError> {
        let entry = self.registry.get(&invocation.tool)?;

        match &entry.spec {
            ToolSpec::Container {
                image,
                cleanenv,
                runtime_args,
            } => {
                let mut args = vec!["run".to_string()];
                if *cleanenv {
                    args.push("--cleanenv".into());
                }
                args.extend(runtime_args.iter().cloned());
                for (key, value) in &invocation.env {
                    args.push("--env".into());
                    args.push(format!("{}={}", key, value));
                }
                for bind in &invocation.binds {
                    args.push("--bind".into());
                    args.push(bind.to_string());
                }
                args.push(image.clone());
                args.extend(invocation.args.iter().cloned());

                Ok((self.registry.runtime.clone(), args))
            }
            ToolSpec::Native { program } => {
                let args = invocation
                    .args
                    .iter()
                    .map(|arg| host_view(arg, &invocation.binds))
                    .collect();
                Ok((program.clone(), args))
            }
        }
    }
}

/// Native tools see the host filesystem, so guest paths in an argument are
/// mapped back to the host path they were bound from.
fn host_view(arg: &str, binds: &[Bind]) -> String {
    // Longest guest prefix wins so nested mounts resolve correctly
    let best = binds
        .iter()
        .filter(|b| {
            arg == b.guest
                || arg
                    .strip_prefix(b.guest.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|b| b.guest.len());

    match best {
        Some(bind) => format!("{}{}", bind.host.display(), &arg[bind.guest.len()..]),
        None => arg.to_string(),
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, StageFailure> {
        let (program, args) =
            self.build_command(invocation)
                .map_err(|e| StageFailure::InvalidInvocation {
                    message: e.to_string(),
                })?;

        let resolved = which::which(&program).map_err(|_| StageFailure::ToolNotAvailable {
            program: program.clone(),
        })?;

        let mut cmd = Command::new(resolved);
        cmd.args(&args);
        if matches!(self.registry.get(&invocation.tool).map(|e| &e.spec), Ok(ToolSpec::Native { .. })) {
            cmd.envs(&invocation.env);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the wait future on cancellation or timeout kills the child
        cmd.kill_on_drop(true);

        debug!(program = %program, args = ?args, "spawning tool");
        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| StageFailure::SpawnFailed {
            error: e.to_string(),
        })?;

        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(|e| StageFailure::SpawnFailed { error: e.to_string() })?;
                Ok(ToolOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration: start.elapsed(),
                })
            }
            _ = cancel.cancelled() => {
                warn!(tool = %invocation.tool, "invocation cancelled");
                Err(StageFailure::Cancelled)
            }
            _ = deadline => {
                let seconds = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(tool = %invocation.tool, seconds, "invocation timed out");
                Err(StageFailure::TimedOut { seconds })
            }
        }
    }

    fn describe(&self, invocation: &Invocation) -> String {
        match self.build_command(invocation) {
            Ok((program, args)) => format!("{} {}", program, args.join(" ")),
            Err(_) => invocation.to_string(),
        }
    }

    async fn check_available(&self, tool: &str) -> Result<bool, MriflowError> {
        let program = match &self.registry.get(tool)?.spec {
            ToolSpec::Container { image, .. } => {
                if !image.contains("://") && !std::path::Path::new(image).exists() {
                    return Ok(false);
                }
                self.registry.runtime.clone()
            }
            ToolSpec::Native { program } => program.clone(),
        };
        Ok(which::which(program).is_ok())
    }
}
