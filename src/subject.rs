// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Subject identifiers
//!
//! Raw subject tokens come from the scanner export and are untrusted. They are
//! normalized exactly once into a BIDS label, and every derived path is built
//! from the label rather than the raw token.

use serde::Serialize;
use std::fmt;

/// Namespace tag prepended to every normalized label
pub const LABEL_PREFIX: &str = "sub-";

/// A subject with its raw token and normalized BIDS label
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Subject {
    raw: String,
    label: String,
}

impl Subject {
    /// Create a subject from a raw token
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let label = normalize(&raw);
        Self { raw, label }
    }

    /// The token as supplied by the operator
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The normalized label, e.g. `sub-HBA0001T1`
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the label carries anything beyond the namespace tag
    pub fn is_empty(&self) -> bool {
        self.label.len() == LABEL_PREFIX.len()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Normalize a raw subject token into a BIDS label.
///
/// Every character that is not an ASCII letter or digit is dropped and the
/// result is prefixed with [`LABEL_PREFIX`].
///
/// A token that already carries the prefix keeps a single one: `sub-01`
/// stays `sub-01` rather than becoming `sub-sub01`. Plain prepending would
/// double it, so the transform would not be idempotent.
pub fn normalize(raw: &str) -> String {
    let body = raw.strip_prefix(LABEL_PREFIX).unwrap_or(raw);
    let cleaned: String = body.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("{}{}", LABEL_PREFIX, cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    const TOKENS: &[&str] = &[
        "",
        "HBA_0001_T1",
        "sub-01",
        "sub-sub-01",
        "sub01",
        "../../etc/passwd",
        "a b\tc\nd",
        "naïve-ü",
        "sub-",
        "-sub-",
        "x;rm -rf /",
    ];

    #[test]
    fn test_strips_non_alphanumeric() {
        assert_eq!(normalize("HBA_0001_T1"), "sub-HBA0001T1");
        assert_eq!(normalize("../../etc/passwd"), "sub-etcpasswd");
        assert_eq!(normalize("naïve-ü"), "sub-nave");
    }

    #[test]
    fn test_labels_match_namespace_pattern() {
        let pattern = Regex::new(r"^sub-[A-Za-z0-9]*$").unwrap();
        for token in TOKENS {
            let label = normalize(token);
            assert!(pattern.is_match(&label), "{token:?} -> {label:?}");
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for token in TOKENS {
            let once = normalize(token);
            assert_eq!(normalize(&once), once, "token {token:?}");
        }
    }

    #[test]
    fn test_prefixed_token_keeps_single_prefix() {
        assert_eq!(normalize("sub-01"), "sub-01");
        assert_eq!(normalize("sub-HBA_0001"), "sub-HBA0001");
    }

    #[test]
    fn test_empty_token_is_total() {
        let subject = Subject::new("");
        assert_eq!(subject.label(), "sub-");
        assert!(subject.is_empty());
    }

    #[test]
    fn test_subject_keeps_raw_token() {
        let subject = Subject::new("HBA_0001_T1");
        assert_eq!(subject.raw(), "HBA_0001_T1");
        assert_eq!(subject.to_string(), "sub-HBA0001T1");
    }
}
