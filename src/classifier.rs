// 🏷️ Change Classifier - decision policy as data
// Metric threshold tests combined by an explicit mode: all / any / weighted.

use crate::aggregator::{Aggregate, ChangeStatistics, Incomparable};
use crate::error::{ChangeError, Result};
use crate::grid::BuildingId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean absolute difference (m)
    Mean,

    /// Maximum absolute difference (m)
    Max,

    /// Share of compared cells above the significance threshold
    SignificantFraction,

    /// Sum of absolute differences (m)
    Sum,

    /// Number of compared cells above the significance threshold
    SignificantCount,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Mean => "mean",
            Metric::Max => "max",
            Metric::SignificantFraction => "significant_fraction",
            Metric::Sum => "sum",
            Metric::SignificantCount => "significant_count",
        }
    }

    pub fn value(&self, stats: &ChangeStatistics) -> f64 {
        match self {
            Metric::Mean => stats.mean_diff,
            Metric::Max => stats.max_diff,
            Metric::SignificantFraction => stats.significant_fraction,
            Metric::Sum => stats.sum_diff,
            Metric::SignificantCount => stats.significant_count as f64,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DECISION POLICY
// ============================================================================

/// How individual metric tests combine into one verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CombineMode {
    /// Every configured test must pass
    All,

    /// At least one configured test must pass
    Any,

    /// Changed when the weight share of passing tests reaches `quorum`
    Weighted {
        weights: BTreeMap<Metric, f64>,
        quorum: f64,
    },
}

/// Metrics taking part in the decision, each with its own threshold.
/// A test passes when the metric is strictly greater than its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub thresholds: BTreeMap<Metric, f64>,
    pub combine: CombineMode,
}

impl DecisionPolicy {
    pub fn new(thresholds: BTreeMap<Metric, f64>, combine: CombineMode) -> Self {
        DecisionPolicy { thresholds, combine }
    }

    /// Reject policies that would silently skew every verdict
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.is_empty() {
            return Err(ChangeError::Config(
                "decision policy needs at least one metric".to_string(),
            ));
        }

        for (metric, threshold) in &self.thresholds {
            if !threshold.is_finite() || *threshold < 0.0 {
                return Err(ChangeError::Config(format!(
                    "threshold for {} must be a non-negative number, got {}",
                    metric, threshold
                )));
            }
            if *metric == Metric::SignificantFraction && *threshold > 1.0 {
                return Err(ChangeError::Config(format!(
                    "significant_fraction threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }

        if let CombineMode::Weighted { weights, quorum } = &self.combine {
            if !(quorum.is_finite() && *quorum > 0.0 && *quorum <= 1.0) {
                return Err(ChangeError::Config(format!(
                    "weighted quorum must be within (0, 1], got {}",
                    quorum
                )));
            }

            for metric in self.thresholds.keys() {
                if !weights.contains_key(metric) {
                    return Err(ChangeError::Config(format!("no weight for metric {}", metric)));
                }
            }

            for (metric, weight) in weights {
                if !self.thresholds.contains_key(metric) {
                    return Err(ChangeError::Config(format!(
                        "weight given for unused metric {}",
                        metric
                    )));
                }
                if !weight.is_finite() || *weight <= 0.0 {
                    return Err(ChangeError::Config(format!(
                        "weight for {} must be positive, got {}",
                        metric, weight
                    )));
                }
            }
        }

        Ok(())
    }

    /// Run every configured test against the statistics
    pub fn evaluate(&self, stats: &ChangeStatistics) -> Vec<MetricTest> {
        self.thresholds
            .iter()
            .map(|(metric, threshold)| {
                let value = metric.value(stats);
                MetricTest {
                    metric: *metric,
                    value,
                    threshold: *threshold,
                    passed: value > *threshold,
                }
            })
            .collect()
    }

    /// Combine test outcomes according to the combine mode
    pub fn combine(&self, tests: &[MetricTest]) -> bool {
        match &self.combine {
            CombineMode::All => !tests.is_empty() && tests.iter().all(|t| t.passed),
            CombineMode::Any => tests.iter().any(|t| t.passed),
            CombineMode::Weighted { weights, quorum } => {
                let weight = |t: &MetricTest| weights.get(&t.metric).copied().unwrap_or(0.0);
                let total: f64 = tests.iter().map(weight).sum();
                if total <= 0.0 {
                    return false;
                }
                let passed: f64 = tests.iter().filter(|t| t.passed).map(weight).sum();
                passed / total >= *quorum
            }
        }
    }

    /// Compact human-readable form, e.g. `all(significant_fraction > 0.1)`
    pub fn summary(&self) -> String {
        let tests = |with_weights: Option<&BTreeMap<Metric, f64>>| {
            self.thresholds
                .iter()
                .map(|(metric, threshold)| match with_weights.and_then(|w| w.get(metric)) {
                    Some(weight) => format!("{} > {} (w {})", metric, threshold, weight),
                    None => format!("{} > {}", metric, threshold),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        match &self.combine {
            CombineMode::All => format!("all({})", tests(None)),
            CombineMode::Any => format!("any({})", tests(None)),
            CombineMode::Weighted { weights, quorum } => {
                format!("weighted[quorum {}]({})", quorum, tests(Some(weights)))
            }
        }
    }
}

/// Outcome of one metric threshold test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTest {
    pub metric: Metric,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
}

// ============================================================================
// POLICY SNAPSHOT
// ============================================================================

/// What every verdict records about the policy that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub significance_threshold: f64,
    pub summary: String,

    /// SHA-256 over the serialized threshold + policy; equal fingerprints replay identically
    pub fingerprint: String,
}

impl PolicySnapshot {
    pub fn capture(significance_threshold: f64, policy: &DecisionPolicy) -> Self {
        let canonical = serde_json::json!({
            "significance_threshold": significance_threshold,
            "policy": policy,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string());

        PolicySnapshot {
            significance_threshold,
            summary: policy.summary(),
            fingerprint: format!("{:x}", hasher.finalize()),
        }
    }
}

// ============================================================================
// VERDICT
// ============================================================================

/// What a verdict rests on
#[derive(Debug, Clone, PartialEq)]
pub enum VerdictBasis {
    Statistics {
        statistics: ChangeStatistics,
        tests: Vec<MetricTest>,
    },
    Incomparable(Incomparable),
}

impl VerdictBasis {
    pub fn is_incomparable(&self) -> bool {
        matches!(self, VerdictBasis::Incomparable(_))
    }

    pub fn statistics(&self) -> Option<&ChangeStatistics> {
        match self {
            VerdictBasis::Statistics { statistics, .. } => Some(statistics),
            VerdictBasis::Incomparable(_) => None,
        }
    }
}

/// Changed/unchanged decision for one building. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeVerdict {
    pub building_id: BuildingId,
    pub changed: bool,
    pub basis: VerdictBasis,
    pub policy: Arc<PolicySnapshot>,
}

impl ChangeVerdict {
    /// `changed`, `unchanged` or `incomparable`
    pub fn status(&self) -> &'static str {
        match (&self.basis, self.changed) {
            (VerdictBasis::Incomparable(_), _) => "incomparable",
            (_, true) => "changed",
            (_, false) => "unchanged",
        }
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct ChangeClassifier {
    policy: DecisionPolicy,
    snapshot: Arc<PolicySnapshot>,
}

impl ChangeClassifier {
    /// Validates the policy; an invalid policy never classifies anything
    pub fn new(policy: DecisionPolicy, significance_threshold: f64) -> Result<Self> {
        policy.validate()?;
        let snapshot = Arc::new(PolicySnapshot::capture(significance_threshold, &policy));
        Ok(ChangeClassifier { policy, snapshot })
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> &Arc<PolicySnapshot> {
        &self.snapshot
    }

    pub fn classify(&self, building_id: BuildingId, aggregate: Aggregate) -> ChangeVerdict {
        match aggregate {
            Aggregate::Statistics(statistics) => {
                let tests = self.policy.evaluate(&statistics);
                let changed = self.policy.combine(&tests);
                ChangeVerdict {
                    building_id,
                    changed,
                    basis: VerdictBasis::Statistics { statistics, tests },
                    policy: Arc::clone(&self.snapshot),
                }
            }
            Aggregate::Incomparable(reason) => self.incomparable(building_id, reason),
        }
    }

    /// Incomparable buildings are never reported as changed
    pub fn incomparable(&self, building_id: BuildingId, reason: Incomparable) -> ChangeVerdict {
        ChangeVerdict {
            building_id,
            changed: false,
            basis: VerdictBasis::Incomparable(reason),
            policy: Arc::clone(&self.snapshot),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
