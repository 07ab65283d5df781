// 📋 Verdict Table - write-once per building, persisted as CSV

use crate::aggregator::{ChangeStatistics, Incomparable};
use crate::classifier::{ChangeVerdict, MetricTest, PolicySnapshot, VerdictBasis};
use crate::error::{ChangeError, Result};
use crate::grid::{BuildingId, Epoch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type Verdicts = BTreeMap<BuildingId, ChangeVerdict>;

// ============================================================================
// CONCURRENT ACCUMULATOR
// ============================================================================

/// Accumulator shared by detection workers. Each identifier is written once.
#[derive(Debug, Default)]
pub struct VerdictTable {
    entries: Mutex<Verdicts>,
}

impl VerdictTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, verdict: ChangeVerdict) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&verdict.building_id) {
            return Err(ChangeError::DuplicateVerdict(verdict.building_id.to_string()));
        }
        entries.insert(verdict.building_id.clone(), verdict);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_verdicts(self) -> Verdicts {
        self.entries.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerdictSummary {
    pub total: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub incomparable: usize,
}

impl VerdictSummary {
    pub fn from_verdicts(verdicts: &Verdicts) -> Self {
        let mut summary = VerdictSummary::default();
        for verdict in verdicts.values() {
            summary.total += 1;
            match verdict.status() {
                "changed" => summary.changed += 1,
                "incomparable" => summary.incomparable += 1,
                _ => summary.unchanged += 1,
            }
        }
        summary
    }
}

// ============================================================================
// CSV PERSISTENCE
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct VerdictRow {
    building_id: String,
    status: String,
    changed: bool,
    mean_diff: Option<f64>,
    max_diff: Option<f64>,
    significant_fraction: Option<f64>,
    significant_count: Option<usize>,
    sum_diff: Option<f64>,
    compared_cells: Option<usize>,
    incomparable_reason: Option<String>,
    incomparable_detail: Option<String>,
    /// JSON list of the individual metric tests
    tests: Option<String>,
    significance_threshold: f64,
    policy: String,
    policy_fingerprint: String,
}

impl VerdictRow {
    fn from_verdict(verdict: &ChangeVerdict) -> Result<Self> {
        let mut row = VerdictRow {
            building_id: verdict.building_id.to_string(),
            status: verdict.status().to_string(),
            changed: verdict.changed,
            mean_diff: None,
            max_diff: None,
            significant_fraction: None,
            significant_count: None,
            sum_diff: None,
            compared_cells: None,
            incomparable_reason: None,
            incomparable_detail: None,
            tests: None,
            significance_threshold: verdict.policy.significance_threshold,
            policy: verdict.policy.summary.clone(),
            policy_fingerprint: verdict.policy.fingerprint.clone(),
        };

        match &verdict.basis {
            VerdictBasis::Statistics { statistics, tests } => {
                row.mean_diff = Some(statistics.mean_diff);
                row.max_diff = Some(statistics.max_diff);
                row.significant_fraction = Some(statistics.significant_fraction);
                row.significant_count = Some(statistics.significant_count);
                row.sum_diff = Some(statistics.sum_diff);
                row.compared_cells = Some(statistics.compared_cells);
                row.tests = Some(serde_json::to_string(tests)?);
            }
            VerdictBasis::Incomparable(reason) => {
                row.incomparable_reason = Some(reason.code().to_string());
                row.incomparable_detail = incomparable_detail(reason);
            }
        }

        Ok(row)
    }

    fn into_verdict(self, policies: &mut HashMap<String, Arc<PolicySnapshot>>) -> Result<ChangeVerdict> {
        let invalid = |what: &str| {
            ChangeError::Config(format!("verdict row {}: {}", self.building_id, what))
        };

        let basis = match self.incomparable_reason.as_deref() {
            Some(code) => VerdictBasis::Incomparable(
                incomparable_from_parts(code, self.incomparable_detail.as_deref())
                    .ok_or_else(|| invalid("unknown incomparable reason"))?,
            ),
            None => {
                let statistics = ChangeStatistics {
                    mean_diff: self.mean_diff.ok_or_else(|| invalid("missing mean_diff"))?,
                    max_diff: self.max_diff.ok_or_else(|| invalid("missing max_diff"))?,
                    significant_fraction: self
                        .significant_fraction
                        .ok_or_else(|| invalid("missing significant_fraction"))?,
                    significant_count: self
                        .significant_count
                        .ok_or_else(|| invalid("missing significant_count"))?,
                    sum_diff: self.sum_diff.ok_or_else(|| invalid("missing sum_diff"))?,
                    compared_cells: self
                        .compared_cells
                        .ok_or_else(|| invalid("missing compared_cells"))?,
                };
                let tests: Vec<MetricTest> = match self.tests.as_deref() {
                    Some(json) if !json.is_empty() => serde_json::from_str(json)?,
                    _ => Vec::new(),
                };
                VerdictBasis::Statistics { statistics, tests }
            }
        };

        if basis.is_incomparable() && self.changed {
            return Err(invalid("incomparable building marked changed"));
        }

        let policy = policies
            .entry(self.policy_fingerprint.clone())
            .or_insert_with(|| {
                Arc::new(PolicySnapshot {
                    significance_threshold: self.significance_threshold,
                    summary: self.policy.clone(),
                    fingerprint: self.policy_fingerprint.clone(),
                })
            })
            .clone();

        Ok(ChangeVerdict {
            building_id: BuildingId::new(self.building_id),
            changed: self.changed,
            basis,
            policy,
        })
    }
}

fn incomparable_detail(reason: &Incomparable) -> Option<String> {
    match reason {
        Incomparable::NoValidOverlap => None,
        Incomparable::MissingEpoch { epoch } => Some(epoch.to_string()),
        Incomparable::IncompatibleGeometry { detail } | Incomparable::Unreadable { detail } => {
            Some(detail.clone())
        }
    }
}

fn incomparable_from_parts(code: &str, detail: Option<&str>) -> Option<Incomparable> {
    let detail = detail.unwrap_or_default().to_string();
    match code {
        "no_valid_overlap" => Some(Incomparable::NoValidOverlap),
        "missing_epoch" => match detail.as_str() {
            "epochA" => Some(Incomparable::MissingEpoch { epoch: Epoch::A }),
            "epochB" => Some(Incomparable::MissingEpoch { epoch: Epoch::B }),
            _ => None,
        },
        "incompatible_geometry" => Some(Incomparable::IncompatibleGeometry { detail }),
        "unreadable" => Some(Incomparable::Unreadable { detail }),
        _ => None,
    }
}

/// Write the verdict table, one row per building in identifier order
pub fn write_verdicts_csv(path: &Path, verdicts: &Verdicts) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for verdict in verdicts.values() {
        writer.serialize(VerdictRow::from_verdict(verdict)?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a verdict table written by `write_verdicts_csv`
pub fn read_verdicts_csv(path: &Path) -> Result<Verdicts> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut policies = HashMap::new();
    let mut verdicts = Verdicts::new();

    for row in reader.deserialize::<VerdictRow>() {
        let verdict = row?.into_verdict(&mut policies)?;
        if verdicts.contains_key(&verdict.building_id) {
            return Err(ChangeError::DuplicateVerdict(verdict.building_id.to_string()));
        }
        verdicts.insert(verdict.building_id.clone(), verdict);
    }

    Ok(verdicts)
}

/// Plain list of changed identifiers, one per line
pub fn write_changed_list(path: &Path, verdicts: &Verdicts) -> Result<usize> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut count = 0;
    for verdict in verdicts.values().filter(|v| v.changed) {
        writeln!(out, "{}", verdict.building_id)?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================
