// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Validate command - check a pipeline definition

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, ToolArgs};
use crate::pipeline::PipelineValidator;

/// Run the validate command
pub async fn run(pipeline_path: Option<PathBuf>, tools: ToolArgs, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let pipeline = match load_pipeline(pipeline_path.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  {} Failed to parse pipeline", "✗".red());
            eprintln!();
            return Err(e);
        }
    };

    match &pipeline_path {
        Some(path) => println!("  {} {} is valid YAML", "✓".green(), path.display()),
        None => println!("  {} Using the built-in pipeline", "✓".green()),
    }

    let registry = tools.optional_registry()?;
    if registry.is_none() {
        println!(
            "  {} No tool registry given; tool names are not checked",
            "⚠".yellow()
        );
    }

    let validation = PipelineValidator::validate(&pipeline, registry.as_ref());

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", pipeline.name);
        println!("  Stages: {}", pipeline.stages.len());
        for stage in &pipeline.stages {
            let deps = if stage.depends_on.is_empty() {
                String::new()
            } else {
                format!(" [depends: {}]", stage.depends_on.join(", "))
            };
            println!(
                "    - {} ({}, {}){}",
                stage.name,
                stage.kind(),
                stage.policy,
                deps.dimmed()
            );
        }
    }

    println!();

    if !validation.is_valid() {
        Err(miette::miette!("Pipeline validation failed"))
    } else if validation.has_warnings() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        Ok(())
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
        Ok(())
    }
}
