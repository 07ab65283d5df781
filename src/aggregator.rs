// 📊 Difference Aggregator - valid/valid cell differences → scalar statistics
//
// No-data on either side removes the cell position entirely. An empty overlap
// is Incomparable, never "unchanged".

use crate::grid::{AlignedPair, Epoch};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// STATISTICS
// ============================================================================

/// Summary of |height_b - height_a| over every valid/valid cell pair.
/// Only constructed when at least one pair was compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStatistics {
    pub mean_diff: f64,
    pub max_diff: f64,

    /// Share of compared pairs whose difference exceeds the significance threshold, in [0, 1]
    pub significant_fraction: f64,

    pub significant_count: usize,
    pub sum_diff: f64,

    /// Valid/valid pairs actually compared (> 0)
    pub compared_cells: usize,
}

// ============================================================================
// INCOMPARABLE
// ============================================================================

/// Why a building has no statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Incomparable {
    /// Rasters overlap but no cell is valid in both
    NoValidOverlap,

    /// One epoch has no raster
    MissingEpoch { epoch: Epoch },

    /// Rasters share no extent or disagree on CRS
    IncompatibleGeometry { detail: String },

    /// A raster exists but could not be decoded
    Unreadable { detail: String },
}

impl Incomparable {
    pub fn code(&self) -> &'static str {
        match self {
            Incomparable::NoValidOverlap => "no_valid_overlap",
            Incomparable::MissingEpoch { .. } => "missing_epoch",
            Incomparable::IncompatibleGeometry { .. } => "incompatible_geometry",
            Incomparable::Unreadable { .. } => "unreadable",
        }
    }
}

impl fmt::Display for Incomparable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incomparable::NoValidOverlap => write!(f, "no valid overlapping cells"),
            Incomparable::MissingEpoch { epoch } => write!(f, "missing {} raster", epoch),
            Incomparable::IncompatibleGeometry { detail } => write!(f, "incompatible geometry: {}", detail),
            Incomparable::Unreadable { detail } => write!(f, "unreadable raster: {}", detail),
        }
    }
}

/// Outcome of aggregating one aligned pair
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Statistics(ChangeStatistics),
    Incomparable(Incomparable),
}

// ============================================================================
// AGGREGATOR
// ============================================================================

pub struct DifferenceAggregator {
    /// Height delta (m) above which a cell pair counts as significant
    pub significance_threshold: f64,
}

impl DifferenceAggregator {
    pub fn new(significance_threshold: f64) -> Self {
        DifferenceAggregator {
            significance_threshold,
        }
    }

    pub fn aggregate(&self, pair: &AlignedPair) -> Aggregate {
        self.aggregate_cells(pair.cell_pairs())
    }

    /// Reduce `(epoch_a, epoch_b)` cell pairs
    pub fn aggregate_cells(&self, cells: impl Iterator<Item = (Option<f64>, Option<f64>)>) -> Aggregate {
        let mut compared = 0usize;
        let mut significant = 0usize;
        let mut sum = 0.0;
        let mut max = 0.0f64;

        for (a, b) in cells {
            let (Some(a), Some(b)) = (a, b) else {
                continue;
            };

            let diff = (b - a).abs();
            compared += 1;
            sum += diff;
            max = max.max(diff);
            if diff > self.significance_threshold {
                significant += 1;
            }
        }

        if compared == 0 {
            return Aggregate::Incomparable(Incomparable::NoValidOverlap);
        }

        Aggregate::Statistics(ChangeStatistics {
            mean_diff: sum / compared as f64,
            max_diff: max,
            significant_fraction: significant as f64 / compared as f64,
            significant_count: significant,
            sum_diff: sum,
            compared_cells: compared,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
