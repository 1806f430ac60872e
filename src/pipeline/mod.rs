// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Pipeline definitions and execution
//!
//! This module defines the stage graph, the per-stage runner that turns a
//! stage into an external invocation, and the orchestrator that applies
//! failure policies across a subject's stages.

mod dag;
mod definition;
mod orchestrator;
mod outcome;
mod runner;
pub mod template;
mod validation;

pub use dag::DagBuilder;
pub use definition::*;
pub use orchestrator::PipelineOrchestrator;
pub use outcome::*;
pub use runner::{StageRunner, SubjectPaths, COMPLETE_MARKER};
pub use template::TemplateContext;
pub use validation::{PipelineValidator, ValidationResult};
