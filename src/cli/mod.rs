// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for mriflow.

pub mod graph;
pub mod run;
pub mod validate;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::errors::MriflowResult;
use crate::executors::ToolRegistry;
use crate::pipeline::Pipeline;

/// Neuroimaging pipeline orchestrator
///
/// Converts, checks and processes MRI sessions one subject at a time.
#[derive(Parser, Debug)]
#[clap(
    name = "mriflow",
    version,
    about = "Per-subject neuroimaging pipeline orchestrator",
    long_about = None,
    after_help = "Examples:\n\
        mriflow run --subject HBA0001 --base /data --derivs /data/derivatives \\\n\
        \x20           --work /scratch --license fs_license.txt --containers /opt/sif\n\
        mriflow validate --containers /opt/sif\n\
        mriflow graph --format mermaid\n\n\
        See 'mriflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for one or more subjects
    Run(RunArgs),

    /// Validate a pipeline definition
    Validate {
        /// Pipeline file (defaults to the built-in pipeline)
        #[clap(short, long)]
        pipeline: Option<PathBuf>,

        #[clap(flatten)]
        tools: ToolArgs,
    },

    /// Show the stage graph
    Graph {
        /// Pipeline file (defaults to the built-in pipeline)
        #[clap(short, long)]
        pipeline: Option<PathBuf>,

        /// Output format
        #[clap(short, long, default_value = "text")]
        format: GraphFormat,
    },
}

/// Arguments of `mriflow run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Raw subject identifier (repeatable)
    #[clap(short, long = "subject", required = true, value_name = "ID")]
    pub subjects: Vec<String>,

    /// Project root holding the raw data, BIDS and code directories
    #[clap(long, value_name = "DIR")]
    pub base: PathBuf,

    /// Derivatives root
    #[clap(long, value_name = "DIR")]
    pub derivs: PathBuf,

    /// Working root; one directory per subject and stage is created here
    #[clap(long, value_name = "DIR")]
    pub work: PathBuf,

    /// FreeSurfer license file, checked by license-gated stages
    #[clap(long, value_name = "FILE", env = "FS_LICENSE")]
    pub license: PathBuf,

    /// Raw DICOM directory (default: <base>/dicom)
    #[clap(long, value_name = "DIR")]
    pub dicom: Option<PathBuf>,

    /// BIDS directory (default: <base>/bids)
    #[clap(long, value_name = "DIR")]
    pub bids: Option<PathBuf>,

    /// Code directory with heuristics and model weights (default: <base>/code)
    #[clap(long, value_name = "DIR")]
    pub code: Option<PathBuf>,

    #[clap(flatten)]
    pub tools: ToolArgs,

    /// Pipeline file (defaults to the built-in pipeline)
    #[clap(short, long)]
    pub pipeline: Option<PathBuf>,

    /// Subjects processed concurrently
    #[clap(short, long, default_value = "1")]
    pub jobs: usize,

    /// Time limit for every tool invocation, in seconds
    #[clap(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the plan and rendered invocations without running anything
    #[clap(long)]
    pub dry_run: bool,

    /// Output format of the subject reports
    #[clap(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Where tool definitions come from
#[derive(Args, Debug, Clone, Default)]
pub struct ToolArgs {
    /// Tool registry file (TOML)
    #[clap(long, value_name = "FILE")]
    pub registry: Option<PathBuf>,

    /// Directory holding the standard container images
    #[clap(long, value_name = "DIR")]
    pub containers: Option<PathBuf>,
}

impl ToolArgs {
    /// The registry to run with; fails when none is available
    pub fn registry(&self) -> MriflowResult<ToolRegistry> {
        ToolRegistry::resolve(self.registry.as_deref(), self.containers.as_deref())
    }

    /// A registry if one was given or is configured
    pub fn optional_registry(&self) -> MriflowResult<Option<ToolRegistry>> {
        let configured = ToolRegistry::default_path().is_some_and(|path| path.is_file());
        if self.registry.is_some() || self.containers.is_some() || configured {
            self.registry().map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Load `path`, or the built-in pipeline when none is given
pub fn load_pipeline(path: Option<&Path>) -> miette::Result<Pipeline> {
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(miette::miette!(
                    "Pipeline file not found: {}\n\n\
                     Omit --pipeline to use the built-in pipeline.",
                    path.display()
                ));
            }
            Pipeline::from_file(path)
                .map_err(|e| miette::miette!("Failed to load pipeline: {}", e))
        }
        None => Ok(Pipeline::standard()?),
    }
}

/// Output format for subject reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

impl std::str::FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "dot" => Ok(Self::Dot),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown graph format: {}", s)),
        }
    }
}
