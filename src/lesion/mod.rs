// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! White-matter lesion cluster statistics
//!
//! The segmentation tool writes one report per probability threshold. A
//! report line whose space-separated tokens include `number` carries the
//! cluster count as its last token; a line including `volume` carries the
//! total volume. Later lines win.

use std::path::Path;

use crate::collate::CollatedRow;
use crate::pipeline::StageFailure;

/// Count and volume read from one report
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStats {
    /// Cluster count, as written by the tool
    pub number: String,
    /// Total volume, as written by the tool
    pub volume: String,
}

/// Parse a cluster statistics report
pub fn parse_cluster_stats(text: &str) -> Result<ClusterStats, StageFailure> {
    let mut number = None;
    let mut volume = None;

    for line in text.lines() {
        let tokens: Vec<&str> = line.trim_end().split(' ').collect();
        if tokens.contains(&"number") {
            number = tokens.last().copied();
        } else if tokens.contains(&"volume") {
            volume = tokens.last().copied();
        }
    }

    Ok(ClusterStats {
        number: numeric(number, "number")?,
        volume: numeric(volume, "volume")?,
    })
}

fn numeric(token: Option<&str>, what: &str) -> Result<String, StageFailure> {
    match token {
        Some(t) if t.parse::<f64>().is_ok_and(f64::is_finite) => Ok(t.to_string()),
        Some(t) => Err(StageFailure::OutputParseFailed {
            message: format!("cluster {} '{}' is not numeric", what, t),
        }),
        None => Err(StageFailure::OutputParseFailed {
            message: format!("no cluster {} line in report", what),
        }),
    }
}

/// Read and parse the report at `path`
pub fn read_cluster_stats(path: &Path) -> Result<ClusterStats, StageFailure> {
    let text = std::fs::read_to_string(path).map_err(|_| StageFailure::MissingOutput {
        path: path.to_path_buf(),
    })?;
    parse_cluster_stats(&text)
}

/// Threshold as it appears in report names and table rows
pub fn format_threshold(threshold: f64) -> String {
    threshold.to_string()
}

/// One table row: label, threshold, minimum cluster size, count, volume
pub fn stats_row(label: &str, threshold: f64, min_cluster_size: u32, stats: &ClusterStats) -> CollatedRow {
    CollatedRow::new(
        label,
        vec![
            format_threshold(threshold),
            min_cluster_size.to_string(),
            stats.number.clone(),
            stats.volume.clone(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
Minimum cluster size: 5
WMH number 12
Total WMH volume 3456.7
";

    #[test]
    fn test_parse_report() {
        let stats = parse_cluster_stats(REPORT).unwrap();
        assert_eq!(stats.number, "12");
        assert_eq!(stats.volume, "3456.7");
    }

    #[test]
    fn test_tokens_match_whole_words() {
        // "numbers" is not the token "number"
        let err = parse_cluster_stats("numbers 3\nvolume 10\n").unwrap_err();
        assert!(matches!(err, StageFailure::OutputParseFailed { .. }));
    }

    #[test]
    fn test_last_matching_line_wins() {
        let stats = parse_cluster_stats("number 1\nnumber 2\nvolume 9\n").unwrap();
        assert_eq!(stats.number, "2");
    }

    #[test]
    fn test_non_numeric_value_fails() {
        let err = parse_cluster_stats("number many\nvolume 9\n").unwrap_err();
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn test_missing_report_is_missing_output() {
        let err = read_cluster_stats(Path::new("/nonexistent/stats.txt")).unwrap_err();
        assert!(matches!(err, StageFailure::MissingOutput { .. }));
    }

    #[test]
    fn test_stats_row() {
        let stats = parse_cluster_stats(REPORT).unwrap();
        let row = stats_row("sub-01", 0.9, 5, &stats);
        assert_eq!(row.fields(), &["sub-01", "0.9", "5", "12", "3456.7"]);
    }
}
