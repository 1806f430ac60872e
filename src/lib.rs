// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! # mriflow - neuroimaging pipeline orchestrator
//!
//! `mriflow` runs a fixed graph of external neuroimaging tools for each
//! subject of a study: DICOM to BIDS conversion, quality control, cortical
//! segmentation, brain-age estimation, lesion segmentation and diffusion or
//! functional preprocessing.
//!
//! ## Features
//!
//! - **Declared failure policy** - each stage is fail-fast or fail-soft
//! - **Late preconditions** - licenses and inputs are checked when a stage is reached
//! - **Structured invocations** - no shell strings, subject tokens are sanitized once
//! - **Safe collation** - concurrent subjects append to shared CSV tables under a lock
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the built-in pipeline against your container directory
//! mriflow validate --containers /opt/sif
//!
//! # Process two subjects, two at a time
//! mriflow run -s HBA0001 -s HBA0002 --jobs 2 \
//!     --base /data --derivs /data/derivatives --work /scratch \
//!     --license /opt/freesurfer/license.txt --containers /opt/sif
//! ```

pub mod brain_age;
pub mod cli;
pub mod collate;
pub mod errors;
pub mod executors;
pub mod lesion;
pub mod pipeline;
pub mod subject;
pub mod utils;

// Re-export commonly used types
pub use errors::{MriflowError, MriflowResult};
pub use pipeline::{Pipeline, PipelineOrchestrator, Stage, StageOutcome, SubjectReport};
pub use subject::Subject;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
