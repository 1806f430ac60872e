// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Pipeline validation
//!
//! Validates pipeline configuration before any subject is processed.

use std::collections::HashSet;

use crate::errors::MriflowError;
use crate::executors::ToolRegistry;
use crate::pipeline::template::{placeholders, KNOWN_PLACEHOLDERS, LICENSE_PLACEHOLDERS};
use crate::pipeline::{Analysis, DagBuilder, Pipeline, Precondition, Stage};

/// Row width produced by each analysis, label column included
const BRAIN_AGE_COLUMNS: usize = 2;
const CLUSTER_STATS_COLUMNS: usize = 5;

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline configuration, checking tools when a registry is given
    pub fn validate(pipeline: &Pipeline, registry: Option<&ToolRegistry>) -> ValidationResult {
        let mut result = ValidationResult::new();

        if pipeline.stages.is_empty() {
            result.add_error("Pipeline has no stages defined");
        }

        let mut seen_names = HashSet::new();
        for stage in &pipeline.stages {
            if !seen_names.insert(&stage.name) {
                result.add_error(&format!("Duplicate stage name: '{}'", stage.name));
            }
        }

        let dag = match DagBuilder::build(pipeline) {
            Ok(dag) => Some(dag),
            Err(MriflowError::CircularDependency { stages }) => {
                result.add_error(&format!("Circular dependency: {}", stages.join(" -> ")));
                None
            }
            Err(MriflowError::UnknownDependency { stage, dependency }) => {
                result.add_error(&format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage, dependency
                ));
                None
            }
            Err(e) => {
                result.add_error(&format!("DAG validation error: {}", e));
                None
            }
        };

        for stage in &pipeline.stages {
            Self::validate_stage(stage, pipeline, dag.as_ref(), &mut result);
            if let Some(registry) = registry {
                for tool in stage.tool_names() {
                    if !registry.contains(tool) {
                        result.add_error(&format!(
                            "Stage '{}': Tool '{}' is not registered",
                            stage.name, tool
                        ));
                    }
                }
            }
        }

        result
    }

    /// Validate, turning the first error into a [`MriflowError`]
    pub fn ensure_valid(pipeline: &Pipeline, registry: Option<&ToolRegistry>) -> Result<ValidationResult, MriflowError> {
        let result = Self::validate(pipeline, registry);
        match result.errors.first() {
            Some(first) => Err(MriflowError::InvalidPipeline {
                reason: first.clone(),
                help: (result.errors.len() > 1)
                    .then(|| format!("{} more problems; run 'mriflow validate' for details", result.errors.len() - 1)),
            }),
            None => Ok(result),
        }
    }

    /// Validate a single stage
    fn validate_stage(stage: &Stage, pipeline: &Pipeline, dag: Option<&DagBuilder>, result: &mut ValidationResult) {
        if stage.invocation.is_none() && stage.analysis.is_none() {
            result.add_error(&format!(
                "Stage '{}': Declares neither an invocation nor an analysis",
                stage.name
            ));
        }

        Self::validate_templates(stage, result);

        for precondition in &stage.preconditions {
            if let Precondition::UpstreamComplete(upstream) = precondition {
                if pipeline.get_stage(upstream).is_none() {
                    result.add_error(&format!(
                        "Stage '{}': Precondition references unknown stage '{}'",
                        stage.name, upstream
                    ));
                } else if dag.is_some_and(|d| !d.depends_on(&stage.name, upstream)) {
                    result.add_warning(&format!(
                        "Stage '{}': Requires '{}' to be complete but does not depend on it, \
                         so it may run first and be skipped",
                        stage.name, upstream
                    ));
                }
            }
        }

        match &stage.analysis {
            Some(Analysis::ClusterStats { thresholds, .. }) if thresholds.is_empty() => {
                result.add_error(&format!("Stage '{}': No thresholds given", stage.name));
            }
            Some(Analysis::BrainAge { batch_size: 0, .. }) => {
                result.add_error(&format!("Stage '{}': Batch size must be positive", stage.name));
            }
            _ => {}
        }

        match (&stage.collate, &stage.analysis) {
            (Some(_), None) => {
                result.add_error(&format!(
                    "Stage '{}': Collates results but has no analysis producing rows",
                    stage.name
                ));
            }
            (Some(collation), Some(analysis)) => {
                let width = match analysis {
                    Analysis::BrainAge { .. } => BRAIN_AGE_COLUMNS,
                    Analysis::ClusterStats { .. } => CLUSTER_STATS_COLUMNS,
                };
                if collation.columns.len() != width {
                    result.add_error(&format!(
                        "Stage '{}': Table has {} columns but rows have {} fields",
                        stage.name,
                        collation.columns.len(),
                        width
                    ));
                }
            }
            (None, Some(_)) => {
                result.add_warning(&format!(
                    "Stage '{}': Results are not collated into a table",
                    stage.name
                ));
            }
            (None, None) => {}
        }
    }

    /// Check every placeholder the stage can render
    fn validate_templates(stage: &Stage, result: &mut ValidationResult) {
        let has_license = stage.preconditions.contains(&Precondition::LicensePresent);
        let cluster_report = match &stage.analysis {
            Some(Analysis::ClusterStats { report, .. }) => Some(report.as_str()),
            _ => None,
        };

        for template in stage_templates(stage) {
            for name in placeholders(template) {
                if !KNOWN_PLACEHOLDERS.contains(&name.as_str()) {
                    result.add_error(&format!(
                        "Stage '{}': Unknown placeholder '{{{}}}' in '{}'",
                        stage.name, name, template
                    ));
                } else if LICENSE_PLACEHOLDERS.contains(&name.as_str()) && !has_license {
                    result.add_error(&format!(
                        "Stage '{}': '{{{}}}' requires a license_present precondition",
                        stage.name, name
                    ));
                } else if name == "output_dir" && stage.output_dir.is_none() {
                    result.add_error(&format!(
                        "Stage '{}': '{{output_dir}}' used but no output_dir declared",
                        stage.name
                    ));
                } else if name == "threshold" && cluster_report != Some(template) {
                    result.add_error(&format!(
                        "Stage '{}': '{{threshold}}' is only bound in a cluster statistics report",
                        stage.name
                    ));
                }
            }
        }

        if let Some(output_dir) = &stage.output_dir {
            if placeholders(output_dir).iter().any(|p| p == "output_dir") {
                result.add_error(&format!("Stage '{}': output_dir refers to itself", stage.name));
            }
        }
    }
}

/// Every template string a stage renders
fn stage_templates(stage: &Stage) -> Vec<&str> {
    let mut templates: Vec<&str> = Vec::new();

    if let Some(invocation) = &stage.invocation {
        templates.extend(invocation.args.iter().map(String::as_str));
        for bind in &invocation.binds {
            templates.push(&bind.host);
            templates.push(&bind.guest);
        }
    }
    templates.extend(stage.output_dir.as_deref());
    templates.extend(stage.expected_outputs.iter().map(String::as_str));
    templates.extend(stage.env.values().map(String::as_str));
    for precondition in &stage.preconditions {
        if let Precondition::FileExists(path) = precondition {
            templates.push(path);
        }
    }

    match &stage.analysis {
        Some(Analysis::ClusterStats { report, .. }) => templates.push(report),
        Some(Analysis::BrainAge {
            model_args,
            model_binds,
            slices,
            result_file,
            ..
        }) => {
            templates.extend(model_args.iter().map(String::as_str));
            for bind in model_binds {
                templates.push(&bind.host);
                templates.push(&bind.guest);
            }
            templates.push(slices);
            templates.extend(result_file.as_deref());
        }
        None => {}
    }

    if let Some(collation) = &stage.collate {
        templates.push(&collation.table);
    }

    templates
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(yaml: &str) -> Pipeline {
        Pipeline::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_standard_pipeline_is_valid() {
        let pipeline = Pipeline::standard().unwrap();
        let registry = ToolRegistry::standard(Path::new("/containers"));

        let result = PipelineValidator::validate(&pipeline, Some(&registry));
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(!result.has_warnings(), "{:?}", result.warnings);
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let pipeline = parse("name: empty\nstages: []\n");

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("no stages"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let pipeline = parse(
            r#"
name: test
stages:
  - { name: dup, invocation: { tool: mriqc } }
  - { name: dup, invocation: { tool: mriqc } }
"#,
        );

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(result.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_validate_cycle() {
        let pipeline = parse(
            r#"
name: test
stages:
  - { name: a, depends_on: [b], invocation: { tool: mriqc } }
  - { name: b, depends_on: [a], invocation: { tool: mriqc } }
"#,
        );

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(result.errors.iter().any(|e| e.contains("Circular")));
    }

    #[test]
    fn test_license_placeholder_needs_precondition() {
        let pipeline = parse(
            r#"
name: test
stages:
  - name: fmriprep
    invocation:
      tool: fmriprep
      args: ["--fs-license-file", "/tmp/{license_name}"]
"#,
        );

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(result.errors.iter().any(|e| e.contains("license_present")));
    }

    #[test]
    fn test_unknown_placeholder_and_tool() {
        let pipeline = parse(
            r#"
name: test
stages:
  - name: qc
    invocation:
      tool: not-a-tool
      args: ["{nope}"]
"#,
        );
        let registry = ToolRegistry::standard(Path::new("/containers"));

        let result = PipelineValidator::validate(&pipeline, Some(&registry));
        assert!(result.errors.iter().any(|e| e.contains("'{nope}'")));
        assert!(result.errors.iter().any(|e| e.contains("not registered")));
    }

    #[test]
    fn test_collation_needs_matching_analysis() {
        let pipeline = parse(
            r#"
name: test
stages:
  - name: qc
    invocation: { tool: mriqc }
    collate: { table: "/d/t.csv", columns: [ID, x] }
  - name: lesions
    analysis: { type: cluster_stats, report: "/d/{threshold}.txt" }
    collate: { table: "/d/w.csv", columns: [ID, n] }
"#,
        );

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(result.errors.iter().any(|e| e.contains("no analysis")));
        assert!(result.errors.iter().any(|e| e.contains("2 columns but rows have 5")));
    }

    #[test]
    fn test_upstream_without_dependency_warns() {
        let pipeline = parse(
            r#"
name: test
stages:
  - { name: seg, invocation: { tool: fastsurfer } }
  - name: seg-qc
    preconditions: [{ upstream_complete: seg }]
    invocation: { tool: qatools }
"#,
        );

        let result = PipelineValidator::validate(&pipeline, None);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("does not depend")));
    }

    #[test]
    fn test_ensure_valid_reports_first_error() {
        let pipeline = parse("name: empty\nstages: []\n");

        let err = PipelineValidator::ensure_valid(&pipeline, None).unwrap_err();
        assert!(matches!(err, MriflowError::InvalidPipeline { .. }));
    }
}
