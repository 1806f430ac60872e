// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! mriflow - per-subject neuroimaging pipeline orchestrator

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mriflow::cli::{Cli, Commands};

/// Exit code for fatal errors
const EXIT_FATAL: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mriflow=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => mriflow::cli::run::run(args, cli.verbose).await,
        Commands::Validate { pipeline, tools } => mriflow::cli::validate::run(pipeline, tools, cli.verbose)
            .await
            .map(|()| mriflow::cli::run::EXIT_OK),
        Commands::Graph { pipeline, format } => mriflow::cli::graph::run(pipeline, format, cli.verbose)
            .await
            .map(|()| mriflow::cli::run::EXIT_OK),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{:?}", report);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
