// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Pipeline definition structures
//!
//! Defines the schema for pipeline YAML files. The standard neuroimaging
//! pipeline is itself expressed in this schema, see [`Pipeline::standard`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The pipeline shipped with mriflow
const STANDARD_PIPELINE: &str = include_str!("../../pipelines/standard.yaml");

/// Pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages in declaration order
    pub stages: Vec<Stage>,

    /// Environment variables passed to every invocation
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Pipeline {
    /// Load pipeline from a YAML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::MriflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::MriflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            }
        })?;

        Self::from_yaml(&content)
    }

    /// Parse pipeline from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::MriflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, crate::MriflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// The built-in conversion, QC, segmentation and preprocessing pipeline
    pub fn standard() -> Result<Self, crate::MriflowError> {
        Self::from_yaml(STANDARD_PIPELINE)
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get all stage names
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (must be unique within pipeline)
    pub name: String,

    /// Stage description
    #[serde(default)]
    pub description: Option<String>,

    /// External tool invocation
    #[serde(default)]
    pub invocation: Option<InvocationTemplate>,

    /// Computation run after the invocation succeeds
    #[serde(default)]
    pub analysis: Option<Analysis>,

    /// Stage dependencies (other stage names)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// What a failure of this stage means for the rest of the subject
    #[serde(default)]
    pub policy: FailurePolicy,

    /// Checks evaluated immediately before the stage runs
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub preconditions: Vec<Precondition>,

    /// Host directory receiving the stage's derivatives
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Files that must exist and be non-empty after a successful run
    #[serde(default)]
    pub expected_outputs: Vec<String>,

    /// Shared table that receives this stage's result rows
    #[serde(default)]
    pub collate: Option<Collation>,

    /// Environment variables for this stage
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Stage {
    /// Tools this stage may invoke
    pub fn tool_names(&self) -> Vec<&str> {
        let mut tools = Vec::new();
        if let Some(ref invocation) = self.invocation {
            tools.push(invocation.tool.as_str());
        }
        if let Some(Analysis::BrainAge { ref model, .. }) = self.analysis {
            tools.push(model.as_str());
        }
        tools
    }

    /// Short label used in plans and graphs
    pub fn kind(&self) -> &str {
        match (&self.invocation, &self.analysis) {
            (_, Some(Analysis::BrainAge { .. })) => "brain-age",
            (_, Some(Analysis::ClusterStats { .. })) => "cluster-stats",
            (Some(invocation), None) => invocation.tool.as_str(),
            (None, None) => "noop",
        }
    }

    /// Whether the stage produces rows for a collated table
    pub fn produces_rows(&self) -> bool {
        self.analysis.is_some()
    }
}

/// Continuation policy for a failed stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A failure aborts the remaining stages of the subject
    #[default]
    FailFast,
    /// A failure is recorded and independent stages still run
    FailSoft,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::FailSoft => write!(f, "fail-soft"),
        }
    }
}

/// Templated invocation of a registered tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationTemplate {
    /// Symbolic tool name, resolved through the tool registry
    pub tool: String,

    /// Argument templates, in order
    #[serde(default)]
    pub args: Vec<String>,

    /// Host/guest directory pairs made visible to the tool
    #[serde(default)]
    pub binds: Vec<BindTemplate>,
}

/// A templated bind mount
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindTemplate {
    /// Host path template
    pub host: String,

    /// Path inside the tool's filesystem view
    pub guest: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Computation performed by the stage itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Analysis {
    /// Parse cluster statistics reports, one per probability threshold
    ClusterStats {
        /// Report path template, `{threshold}` is bound per threshold
        report: String,

        /// Probability thresholds
        #[serde(default = "default_thresholds")]
        thresholds: Vec<f64>,

        /// Minimum cluster size, in voxels
        #[serde(default = "default_min_cluster_size")]
        min_cluster_size: u32,
    },

    /// Score every slice with a model and reduce to one predicted age
    BrainAge {
        /// Registered tool that scores a batch of slice images
        model: String,

        /// Extra arguments placed before the slice paths
        #[serde(default)]
        model_args: Vec<String>,

        /// Extra mounts for the model, e.g. its weights
        #[serde(default)]
        model_binds: Vec<BindTemplate>,

        /// Directory template holding the slice images
        slices: String,

        /// Slices per model call
        #[serde(default = "default_batch_size")]
        batch_size: usize,

        /// Marker separating the scan identity from the slice suffix
        #[serde(default = "default_scan_marker")]
        scan_marker: String,

        /// Per-subject result file template
        #[serde(default)]
        result_file: Option<String>,
    },
}

fn default_thresholds() -> Vec<f64> {
    vec![0.9]
}

fn default_min_cluster_size() -> u32 {
    5
}

fn default_batch_size() -> usize {
    80
}

fn default_scan_marker() -> String {
    "_T1".to_string()
}

/// Condition checked immediately before a stage runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// The FreeSurfer license file passed on the command line exists
    LicensePresent,
    /// A templated path exists and is non-empty
    FileExists(String),
    /// Another stage completed and left its marker
    UpstreamComplete(String),
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LicensePresent => write!(f, "license present"),
            Self::FileExists(path) => write!(f, "file exists: {}", path),
            Self::UpstreamComplete(stage) => write!(f, "stage '{}' complete", stage),
        }
    }
}

/// Destination for a stage's result rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collation {
    /// Table path template
    pub table: String,

    /// Column names, in order
    pub columns: Vec<String>,
}
