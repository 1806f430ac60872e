// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Brain-age estimation
//!
//! A T1 volume is cut into 2-D slices, every slice is scored by the model,
//! and the slice scores are reduced to a single predicted age.
//!
//! The reduction is two-level: slices are grouped by the scan they came from
//! and each group is reduced to its median, then the subject's estimate is
//! the median of those group medians. A subject with one scan therefore gets
//! the plain median of its slices.

mod predictor;

pub use predictor::{CommandPredictor, Predictor, SLICE_MOUNT};

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::MriflowResult;
use crate::executors::CancellationToken;
use crate::pipeline::StageFailure;

/// Slice image extensions the model accepts
const SLICE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// One model score for one slice
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlicePrediction {
    pub subject: String,
    /// Scan the slice was cut from
    pub scan: String,
    pub value: f64,
}

/// The reduced estimate for one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgeEstimate {
    pub predicted_age: f64,
    /// Median per scan
    pub group_medians: BTreeMap<String, f64>,
    pub slices: usize,
}

/// Scan identity of a slice file: everything before the modality marker.
///
/// `sub-01_ses-2_T1w-45.jpg` with marker `_T1` belongs to `sub-01_ses-2`.
/// Without the marker, the extension and a trailing `-<slice>` index are
/// dropped, so `sub-01_brain_MNI-45.jpg` belongs to `sub-01_brain_MNI`.
pub fn scan_identity<'a>(file_name: &'a str, marker: &str) -> &'a str {
    match file_name.find(marker) {
        Some(idx) if !marker.is_empty() => &file_name[..idx],
        _ => slice_stem(file_name),
    }
}

fn slice_stem(file_name: &str) -> &str {
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    match stem.rsplit_once('-') {
        Some((scan, index)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            scan
        }
        _ => stem,
    }
}

/// Median of `values`; the mean of the two middle values for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Groups slice predictions by scan and reduces them to one age
#[derive(Debug, Clone, Default)]
pub struct SliceMedianAggregator;

impl SliceMedianAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Group membership is decided by scan identity, not arrival order
    pub fn group(&self, predictions: &[SlicePrediction]) -> BTreeMap<String, Vec<f64>> {
        let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for prediction in predictions {
            groups
                .entry(prediction.scan.clone())
                .or_default()
                .push(prediction.value);
        }
        groups
    }

    /// Median of group medians. `None` for an empty slice set.
    pub fn reduce(&self, predictions: &[SlicePrediction]) -> Option<AgeEstimate> {
        let group_medians: BTreeMap<String, f64> = self
            .group(predictions)
            .into_iter()
            .filter_map(|(scan, values)| median(&values).map(|m| (scan, m)))
            .collect();

        let medians: Vec<f64> = group_medians.values().copied().collect();
        let predicted_age = median(&medians)?;

        Some(AgeEstimate {
            predicted_age,
            group_medians,
            slices: predictions.len(),
        })
    }
}

/// Slice images in `dir`, sorted by file name
pub fn list_slices(dir: &Path) -> MriflowResult<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let mut slices = Vec::new();

    for ext in SLICE_EXTENSIONS {
        let pattern = format!("{}/*.{}", escaped, ext);
        slices.extend(glob::glob(&pattern)?.filter_map(Result::ok).filter(|p| p.is_file()));
    }

    slices.sort();
    Ok(slices)
}

/// Score every slice in batches and reduce to a predicted age
pub async fn estimate_age(
    predictor: &dyn Predictor,
    subject: &str,
    slices: &[PathBuf],
    batch_size: usize,
    marker: &str,
    cancel: &CancellationToken,
) -> Result<AgeEstimate, StageFailure> {
    let mut predictions = Vec::with_capacity(slices.len());

    for batch in slices.chunks(batch_size.max(1)) {
        let scores = predictor.predict_batch(batch, cancel).await?;
        if scores.len() != batch.len() {
            return Err(StageFailure::OutputParseFailed {
                message: format!("model returned {} scores for {} slices", scores.len(), batch.len()),
            });
        }

        for (path, value) in batch.iter().zip(scores) {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            predictions.push(SlicePrediction {
                subject: subject.to_string(),
                scan: scan_identity(&file_name, marker).to_string(),
                value,
            });
        }
    }

    debug!(subject, slices = predictions.len(), "slices scored");

    SliceMedianAggregator::new()
        .reduce(&predictions)
        .ok_or_else(|| StageFailure::EmptySliceSet {
            directory: slices
                .first()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        })
}
