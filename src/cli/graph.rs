// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Graph command - show the stage graph

use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, GraphFormat};
use crate::pipeline::DagBuilder;

/// Run the graph command
pub async fn run(pipeline_path: Option<PathBuf>, format: GraphFormat, _verbose: bool) -> Result<()> {
    let pipeline = load_pipeline(pipeline_path.as_deref())?;
    let dag = DagBuilder::build(&pipeline)?;

    let output = match format {
        GraphFormat::Text => dag.to_text(&pipeline)?,
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(),
    };

    println!("{}", output);

    Ok(())
}
