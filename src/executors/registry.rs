// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Tool registry
//!
//! Maps the symbolic tool names used in pipeline definitions to something
//! that can actually be started: a container image run through
//! Singularity/Apptainer, or a native program on `PATH`.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{MriflowError, MriflowResult};

/// Container runtime used when the registry does not name one
pub const DEFAULT_RUNTIME: &str = "singularity";

/// Registry file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistry {
    /// Container runtime binary
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Registered tools by symbolic name
    #[serde(default)]
    tools: BTreeMap<String, ToolEntry>,
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

/// A registered tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    #[serde(flatten)]
    pub spec: ToolSpec,

    /// Maximum concurrent invocations across all subjects
    #[serde(default)]
    pub slots: Option<usize>,
}

/// How a tool is started
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolSpec {
    /// Container image run by the registry's runtime
    Container {
        /// Image file (`.sif`) or URI
        image: String,

        /// Start from a clean environment
        #[serde(default)]
        cleanenv: bool,

        /// Extra runtime flags placed before the image
        #[serde(default)]
        runtime_args: Vec<String>,
    },

    /// Program started directly on the host
    Native {
        /// Program name or path
        program: String,
    },
}

impl ToolEntry {
    /// Container tool without a slot limit
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            spec: ToolSpec::Container {
                image: image.into(),
                cleanenv: false,
                runtime_args: vec![],
            },
            slots: None,
        }
    }

    /// Native tool without a slot limit
    pub fn native(program: impl Into<String>) -> Self {
        Self {
            spec: ToolSpec::Native {
                program: program.into(),
            },
            slots: None,
        }
    }

    /// Start from a clean environment
    pub fn with_cleanenv(mut self) -> Self {
        if let ToolSpec::Container { ref mut cleanenv, .. } = self.spec {
            *cleanenv = true;
        }
        self
    }

    /// Limit concurrent invocations
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = Some(slots);
        self
    }
}

impl ToolRegistry {
    /// Create an empty registry using the default runtime
    pub fn new() -> Self {
        Self {
            runtime: default_runtime(),
            tools: BTreeMap::new(),
        }
    }

    /// Registry file location under the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "mriflow", "mriflow").map(|dirs| dirs.config_dir().join("tools.toml"))
    }

    /// Load a registry from a TOML file
    pub fn from_file(path: &Path) -> MriflowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MriflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse a registry from TOML
    pub fn from_toml(content: &str) -> MriflowResult<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    /// The images the standard pipeline expects, all in `containers`
    pub fn standard(containers: &Path) -> Self {
        let image = |file: &str| containers.join(file).to_string_lossy().to_string();

        Self::new()
            .with_tool("heudiconv", ToolEntry::container(image("heudiconv_latest.sif")))
            .with_tool("mriqc", ToolEntry::container(image("mriqc_latest.sif")))
            .with_tool(
                "fastsurfer",
                ToolEntry::container(image("fastsurfer_cpu.sif")).with_slots(1),
            )
            .with_tool("qatools", ToolEntry::container(image("qatools_latest.sif")))
            .with_tool("deep-brain-net", ToolEntry::container(image("ants-pynet_latest.sif")))
            .with_tool(
                "deep-brain-net-model",
                ToolEntry::container(image("ants-pynet_latest.sif")),
            )
            .with_tool(
                "lesion-segmentation",
                ToolEntry::container(image("lesion-segmentation_latest.sif")),
            )
            .with_tool(
                "qsiprep",
                ToolEntry::container(image("qsiprep_latest.sif")).with_cleanenv(),
            )
            .with_tool(
                "fmriprep",
                ToolEntry::container(image("fmriprep_latest.sif")).with_cleanenv(),
            )
    }

    /// Pick the registry for a run.
    ///
    /// An explicit file wins, then a containers directory, then the file in
    /// the user's config directory.
    pub fn resolve(explicit: Option<&Path>, containers: Option<&Path>) -> MriflowResult<Self> {
        if let Some(path) = explicit {
            debug!(path = %path.display(), "loading tool registry");
            return Self::from_file(path);
        }

        if let Some(dir) = containers {
            debug!(dir = %dir.display(), "using standard container layout");
            return Ok(Self::standard(dir));
        }

        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "loading tool registry");
                Self::from_file(&path)
            }
            _ => Err(MriflowError::InvalidPipeline {
                reason: "no tool registry available".into(),
                help: Some("Pass --registry FILE or --containers DIR".into()),
            }),
        }
    }

    /// Register a tool
    pub fn with_tool(mut self, name: &str, entry: ToolEntry) -> Self {
        self.tools.insert(name.to_string(), entry);
        self
    }

    /// Use a different container runtime
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Look up a tool
    pub fn get(&self, name: &str) -> MriflowResult<&ToolEntry> {
        self.tools.get(name).ok_or_else(|| MriflowError::UnknownTool {
            tool: name.to_string(),
        })
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tools
    pub fn tools(&self) -> impl Iterator<Item = (&str, &ToolEntry)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
