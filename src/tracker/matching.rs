//! Matching utilities for multi-object tracking.
//!
//! Costs blend IoU (primary) with normalized center distance (secondary).
//! Pairs outside the IoU or distance gate are infeasible and never matched.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::tracker::rect::{Rect, iou_batch};

/// Cost assigned to gated-out pairs and to padding cells.
pub const INFEASIBLE: f64 = 1e6;

/// Bias added per track rank so equal costs resolve to the older track.
const TIE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationConfig {
    /// Pairs with IoU below this are rejected.
    pub iou_threshold: f64,
    /// Pairs whose centers are farther apart than this (pixels) are rejected.
    pub max_distance: f64,
    pub iou_weight: f64,
    pub distance_weight: f64,
    /// Only associate detections with tracks of the same class.
    pub require_class_match: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_distance: 100.0,
            iou_weight: 0.7,
            distance_weight: 0.3,
            require_class_match: true,
        }
    }
}

/// What the associator needs to know about one side of a pair.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub bbox: Rect,
    pub class: &'a str,
}

/// Compute the cost matrix between tracks (rows) and detections (columns).
///
/// Rows must be ordered oldest track first; row `i` receives a bias of
/// `i * TIE_EPSILON` so that the solver prefers older tracks on ties.
pub fn cost_matrix(
    tracks: &[Candidate<'_>],
    detections: &[Candidate<'_>],
    config: &AssociationConfig,
) -> Array2<f64> {
    let track_boxes: Vec<Rect> = tracks.iter().map(|t| t.bbox).collect();
    let det_boxes: Vec<Rect> = detections.iter().map(|d| d.bbox).collect();
    let ious = iou_batch(&track_boxes, &det_boxes);

    let mut costs = Array2::from_elem((tracks.len(), detections.len()), INFEASIBLE);
    for (i, track) in tracks.iter().enumerate() {
        for (j, det) in detections.iter().enumerate() {
            if config.require_class_match && track.class != det.class {
                continue;
            }
            let iou = ious[[i, j]];
            let distance = track.bbox.center_distance(&det.bbox);
            if iou < config.iou_threshold || distance > config.max_distance {
                continue;
            }
            let normalized_distance = if config.max_distance > 0.0 {
                (distance / config.max_distance).min(1.0)
            } else {
                0.0
            };
            costs[[i, j]] = config.iou_weight * (1.0 - iou)
                + config.distance_weight * normalized_distance
                + i as f64 * TIE_EPSILON;
        }
    }
    costs
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Solve the assignment globally with Jonker-Volgenant on a square padded matrix.
///
/// Matches landing on infeasible cells are reported as unmatched on both sides.
pub fn linear_assignment(cost_matrix: &Array2<f64>) -> AssignmentResult {
    let (num_rows, num_cols) = cost_matrix.dim();

    if num_rows == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: vec![],
            unmatched_detections: (0..num_cols).collect(),
        };
    }

    if num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: (0..num_rows).collect(),
            unmatched_detections: vec![],
        };
    }

    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), INFEASIBLE);

    for i in 0..num_rows {
        for j in 0..num_cols {
            padded[[i, j]] = cost_matrix[[i, j]];
        }
    }

    let mut matches = vec![];
    let mut unmatched_tracks = vec![];
    let mut unmatched_detections_mask: Vec<bool> = vec![true; num_cols];

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row_idx, &col_idx) in row_to_col.iter().enumerate() {
                if row_idx >= num_rows {
                    continue;
                }
                if col_idx < num_cols && cost_matrix[[row_idx, col_idx]] < INFEASIBLE {
                    matches.push((row_idx, col_idx));
                    unmatched_detections_mask[col_idx] = false;
                } else {
                    unmatched_tracks.push(row_idx);
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = ?err, rows = num_rows, cols = num_cols, "assignment solver failed");
            unmatched_tracks = (0..num_rows).collect();
        }
    }

    let unmatched_detections: Vec<usize> = unmatched_detections_mask
        .iter()
        .enumerate()
        .filter_map(|(i, &u)| if u { Some(i) } else { None })
        .collect();

    AssignmentResult {
        matches,
        unmatched_tracks,
        unmatched_detections,
    }
}
