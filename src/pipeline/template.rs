// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Invocation templates
//!
//! Arguments and paths in a pipeline definition use `{name}` placeholders.
//! `{{` and `}}` produce literal braces, which some tools need for their own
//! templating.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::{MriflowError, MriflowResult};
use crate::subject::Subject;

/// Placeholders that may appear in a pipeline definition
pub const KNOWN_PLACEHOLDERS: &[&str] = &[
    "subject",
    "label",
    "base",
    "dicom",
    "bids",
    "derivs",
    "code",
    "work",
    "stage_dir",
    "output_dir",
    "threshold",
    "license",
    "license_name",
];

/// Placeholders bound only by a verified license precondition
pub const LICENSE_PLACEHOLDERS: &[&str] = &["license", "license_name"];

/// Placeholder holding the raw, untrusted subject token
const RAW_SUBJECT: &str = "subject";

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_]+)\}").expect("valid placeholder regex"))
}

/// Values available to templates for one subject and stage
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context holding the subject's raw token and label
    pub fn for_subject(subject: &Subject) -> Self {
        Self::new()
            .with(RAW_SUBJECT, subject.raw())
            .with("label", subject.label())
    }

    /// Bind a placeholder
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Bind a placeholder to a path
    pub fn with_path(self, name: &str, path: &Path) -> Self {
        self.with(name, path.to_string_lossy())
    }

    /// Bind a placeholder in place
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Look up a bound value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every placeholder in `template`
    pub fn render(&self, template: &str) -> MriflowResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in token_regex().captures_iter(template) {
            let whole = caps.get(0).expect("capture 0 always present");
            check_literal(template, &template[last..whole.start()])?;
            out.push_str(&template[last..whole.start()]);

            match (whole.as_str(), caps.get(1)) {
                ("{{", _) => out.push('{'),
                ("}}", _) => out.push('}'),
                (_, Some(name)) => out.push_str(self.lookup(template, name.as_str())?),
                _ => unreachable!("regex only matches escapes and placeholders"),
            }
            last = whole.end();
        }

        check_literal(template, &template[last..])?;
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Substitute placeholders and reject paths that climb out of their root
    pub fn render_path(&self, template: &str) -> MriflowResult<PathBuf> {
        let rendered = self.render(template)?;
        let path = PathBuf::from(&rendered);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(MriflowError::PathTraversal { value: rendered });
        }
        Ok(path)
    }

    fn lookup(&self, template: &str, name: &str) -> MriflowResult<&str> {
        let value = self.get(name).ok_or_else(|| MriflowError::TemplateError {
            template: template.to_string(),
            reason: if LICENSE_PLACEHOLDERS.contains(&name) {
                format!("'{{{}}}' requires a license_present precondition", name)
            } else {
                format!("unknown placeholder '{{{}}}'", name)
            },
        })?;

        if name == RAW_SUBJECT && !is_safe_token(value) {
            return Err(MriflowError::PathTraversal {
                value: value.to_string(),
            });
        }

        Ok(value)
    }
}

fn check_literal(template: &str, literal: &str) -> MriflowResult<()> {
    if literal.contains('{') || literal.contains('}') {
        return Err(MriflowError::TemplateError {
            template: template.to_string(),
            reason: "unbalanced brace; use '{{' or '}}' for literal braces".into(),
        });
    }
    Ok(())
}

/// Whether a raw token can be substituted without escaping its directory
fn is_safe_token(value: &str) -> bool {
    !value.contains('/') && !value.contains('\\') && !value.contains("..")
}

/// Placeholder names used by `template`, ignoring escapes
pub fn placeholders(template: &str) -> Vec<String> {
    token_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext::for_subject(&Subject::new("HBA_0001_T1"))
            .with("bids", "/data/bids")
            .with("derivs", "/data/derivatives")
    }

    #[test]
    fn test_render_substitutes_values() {
        let rendered = context()
            .render("{bids}/{label}/anat/{label}_T1w.nii.gz")
            .unwrap();
        assert_eq!(rendered, "/data/bids/sub-HBA0001T1/anat/sub-HBA0001T1_T1w.nii.gz");
    }

    #[test]
    fn test_render_escaped_braces() {
        let rendered = context()
            .render("/tmp/dicom/{{subject}}/*/*/*IM*")
            .unwrap();
        assert_eq!(rendered, "/tmp/dicom/{subject}/*/*/*IM*");
    }

    #[test]
    fn test_unknown_placeholder_is_error() {
        let err = context().render("{nope}").unwrap_err();
        assert!(matches!(err, MriflowError::TemplateError { .. }));
    }

    #[test]
    fn test_license_placeholder_explains_precondition() {
        let err = context().render("--fs-license-file {license}").unwrap_err();
        assert!(err.to_string().contains("invalid"));
        match err {
            MriflowError::TemplateError { reason, .. } => assert!(reason.contains("license_present")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unbalanced_brace_is_error() {
        assert!(context().render("{bids").is_err());
        assert!(context().render("bids}").is_err());
    }

    #[test]
    fn test_raw_subject_with_traversal_rejected() {
        let ctx = TemplateContext::for_subject(&Subject::new("../../etc"));
        let err = ctx.render("--subjects {subject}").unwrap_err();
        assert!(matches!(err, MriflowError::PathTraversal { .. }));

        // The label is already sanitized and stays usable
        assert_eq!(ctx.render("{label}").unwrap(), "sub-etc");
    }

    #[test]
    fn test_render_path_rejects_parent_components() {
        let ctx = context().with("output_dir", "/data/derivatives/../../root");
        let err = ctx.render_path("{output_dir}/x").unwrap_err();
        assert!(matches!(err, MriflowError::PathTraversal { .. }));
    }

    #[test]
    fn test_placeholders_lists_names() {
        assert_eq!(
            placeholders("{{literal}} {bids}/{label}"),
            vec!["bids".to_string(), "label".to_string()]
        );
    }
}
