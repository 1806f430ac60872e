// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Error types
//!
//! Only orchestrator-level and collation-level invariant violations are
//! errors. Anything that goes wrong inside a single stage is captured as a
//! [`StageOutcome`](crate::pipeline::StageOutcome) instead.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for mriflow operations
pub type MriflowResult<T> = Result<T, MriflowError>;

/// Main error type for mriflow
#[derive(Error, Debug, Diagnostic)]
pub enum MriflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Collation Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Schema mismatch in table '{table}': {reason}")]
    #[diagnostic(
        code(mriflow::schema_mismatch),
        help("Rows appended to a collated table must match its header exactly")
    )]
    SchemaMismatch { table: PathBuf, reason: String },

    #[error("Field '{value}' cannot be written to table '{table}'")]
    #[diagnostic(
        code(mriflow::invalid_field),
        help("Collated fields must not contain commas or line breaks")
    )]
    InvalidField { table: PathBuf, value: String },

    #[error("Timed out waiting for lock on '{path}'")]
    #[diagnostic(
        code(mriflow::lock_timeout),
        help("Another process may be holding the table lock; remove the lock file if it is stale")
    )]
    LockTimeout { path: PathBuf },

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(mriflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Circular dependency detected")]
    #[diagnostic(
        code(mriflow::circular_dependency),
        help("Review your stage dependencies to remove the cycle")
    )]
    CircularDependency { stages: Vec<String> },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    #[diagnostic(
        code(mriflow::unknown_dependency),
        help("Check that '{dependency}' is defined in your pipeline")
    )]
    UnknownDependency { stage: String, dependency: String },

    #[error("Tool '{tool}' is not registered")]
    #[diagnostic(
        code(mriflow::unknown_tool),
        help("Add '{tool}' to the tool registry or pass --containers")
    )]
    UnknownTool { tool: String },

    #[error("Template '{template}' is invalid: {reason}")]
    #[diagnostic(code(mriflow::template_error))]
    TemplateError { template: String, reason: String },

    #[error("Refusing path traversal in '{value}'")]
    #[diagnostic(
        code(mriflow::path_traversal),
        help("Subject identifiers and bound paths must not contain '..' or path separators")
    )]
    PathTraversal { value: String },

    // ─────────────────────────────────────────────────────────────────────────
    // File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to create directory '{path}': {error}")]
    #[diagnostic(code(mriflow::directory_creation))]
    DirectoryCreation { path: PathBuf, error: String },

    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(mriflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(mriflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(mriflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(mriflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON error: {message}")]
    #[diagnostic(code(mriflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(mriflow::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(mriflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for MriflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for MriflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for MriflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for MriflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for MriflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl MriflowError {
    /// Create a directory error for `path`
    pub fn directory(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::DirectoryCreation {
            path: path.into(),
            error: error.to_string(),
        }
    }

    /// Whether this error is a collation contract violation
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. } | Self::InvalidField { .. })
    }
}
