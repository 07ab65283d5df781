// 🧩 Model Merger - one representative building per identifier
//
// Changed buildings come from the later epoch, unchanged ones from the retain
// epoch (falling back to whichever epoch has them). Every identifier seen in
// the verdict table or in either model gets exactly one provenance entry.

use crate::citymodel::{CityModel, CityModelBuilding};
use crate::error::{ChangeError, Result};
use crate::grid::{BuildingId, Epoch};
use crate::verdict::Verdicts;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

// ============================================================================
// MERGE POLICY
// ============================================================================

/// Which epoch supplies buildings judged unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainEpoch {
    #[default]
    Earlier,
    Later,
}

impl RetainEpoch {
    pub fn epoch(&self) -> Epoch {
        match self {
            RetainEpoch::Earlier => Epoch::A,
            RetainEpoch::Later => Epoch::B,
        }
    }
}

// ============================================================================
// PROVENANCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProvenanceTag {
    #[serde(rename = "changed-replaced")]
    ChangedReplaced,

    #[serde(rename = "unchanged-retained")]
    UnchangedRetained,

    #[serde(rename = "present-in-one-source-only")]
    PresentInOneSourceOnly,

    #[serde(rename = "droppedNoGeometry")]
    DroppedNoGeometry,

    #[serde(rename = "droppedNoVerdict")]
    DroppedNoVerdict,
}

impl ProvenanceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvenanceTag::ChangedReplaced => "changed-replaced",
            ProvenanceTag::UnchangedRetained => "unchanged-retained",
            ProvenanceTag::PresentInOneSourceOnly => "present-in-one-source-only",
            ProvenanceTag::DroppedNoGeometry => "droppedNoGeometry",
            ProvenanceTag::DroppedNoVerdict => "droppedNoVerdict",
        }
    }

    pub fn is_emitted(&self) -> bool {
        matches!(
            self,
            ProvenanceTag::ChangedReplaced
                | ProvenanceTag::UnchangedRetained
                | ProvenanceTag::PresentInOneSourceOnly
        )
    }
}

impl fmt::Display for ProvenanceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Non-fatal problem found while merging one building
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeIssue {
    /// Verdict says changed but the later epoch has no building
    MissingRepresentation,
}

impl MergeIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeIssue::MissingRepresentation => "missing_representation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub building_id: BuildingId,
    pub tag: ProvenanceTag,

    /// Epoch whose building was emitted; None when nothing was emitted
    pub source_epoch: Option<Epoch>,

    /// Verdict status (`changed`/`unchanged`/`incomparable`), None without a verdict
    pub verdict: Option<String>,

    pub issue: Option<MergeIssue>,
}

impl ProvenanceEntry {
    /// The per-building error this entry stands for, if any
    pub fn error(&self) -> Option<ChangeError> {
        match self.issue {
            Some(MergeIssue::MissingRepresentation) => Some(ChangeError::MissingRepresentation {
                building_id: self.building_id.to_string(),
            }),
            None => None,
        }
    }
}

// ============================================================================
// MERGED MODEL
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergedCityModel {
    pub model: CityModel,

    /// Sorted by building id, one entry per identifier
    pub provenance: Vec<ProvenanceEntry>,
}

impl MergedCityModel {
    pub fn count(&self, tag: ProvenanceTag) -> usize {
        self.provenance.iter().filter(|e| e.tag == tag).count()
    }

    pub fn counts(&self) -> BTreeMap<ProvenanceTag, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.provenance {
            *counts.entry(entry.tag).or_insert(0) += 1;
        }
        counts
    }

    pub fn entry(&self, id: &BuildingId) -> Option<&ProvenanceEntry> {
        self.provenance
            .binary_search_by(|e| e.building_id.cmp(id))
            .ok()
            .map(|i| &self.provenance[i])
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine {
    pub retain_epoch: RetainEpoch,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(RetainEpoch::default())
    }
}

impl MergeEngine {
    pub fn new(retain_epoch: RetainEpoch) -> Self {
        MergeEngine { retain_epoch }
    }

    /// Merge two epoch models under a (possibly partial) verdict table.
    /// Inputs are not modified.
    pub fn merge(
        &self,
        verdicts: &Verdicts,
        model_a: &CityModel,
        model_b: &CityModel,
    ) -> Result<MergedCityModel> {
        check_reference_systems(model_a, model_b)?;

        let ids: BTreeSet<&BuildingId> = verdicts
            .keys()
            .chain(model_a.building_ids())
            .chain(model_b.building_ids())
            .collect();

        let mut model = CityModel::empty_like(model_b);
        let mut provenance = Vec::with_capacity(ids.len());

        for id in ids {
            let in_a = model_a.get(id);
            let in_b = model_b.get(id);
            let verdict = verdicts.get(id);

            let (tag, source, issue) = match verdict {
                Some(v) if v.changed => match in_b {
                    Some(b) => (ProvenanceTag::ChangedReplaced, Some((Epoch::B, b)), None),
                    None => (ProvenanceTag::DroppedNoGeometry, None, Some(MergeIssue::MissingRepresentation)),
                },
                Some(_) => match self.pick_retained(in_a, in_b) {
                    Some(found) => (ProvenanceTag::UnchangedRetained, Some(found), None),
                    None => (ProvenanceTag::DroppedNoGeometry, None, None),
                },
                None => match (in_a, in_b) {
                    (Some(a), None) => (ProvenanceTag::PresentInOneSourceOnly, Some((Epoch::A, a)), None),
                    (None, Some(b)) => (ProvenanceTag::PresentInOneSourceOnly, Some((Epoch::B, b)), None),
                    (Some(_), Some(_)) => (ProvenanceTag::DroppedNoVerdict, None, None),
                    (None, None) => (ProvenanceTag::DroppedNoGeometry, None, None),
                },
            };

            if let Some((epoch, building)) = source {
                let mut building = building.clone();
                building.set_attribute("change_provenance", json!(tag.as_str()));
                building.set_attribute("change_source_epoch", json!(epoch.as_str()));
                model.insert(building);
            }

            let entry = ProvenanceEntry {
                building_id: id.clone(),
                tag,
                source_epoch: source.map(|(epoch, _)| epoch),
                verdict: verdict.map(|v| v.status().to_string()),
                issue,
            };

            match entry.issue {
                Some(issue) => warn!(
                    building = %entry.building_id,
                    issue = issue.as_str(),
                    "changed building has no later-epoch representation"
                ),
                None => debug!(
                    building = %entry.building_id,
                    provenance = tag.as_str(),
                    source_epoch = entry.source_epoch.map(|e| e.as_str()),
                    "merged building"
                ),
            }

            provenance.push(entry);
        }

        let merged = MergedCityModel { model, provenance };
        info!(
            emitted = merged.model.len(),
            identifiers = merged.provenance.len(),
            "merge complete"
        );
        Ok(merged)
    }

    /// Retain epoch first, then whichever epoch has the building
    fn pick_retained<'m>(
        &self,
        in_a: Option<&'m CityModelBuilding>,
        in_b: Option<&'m CityModelBuilding>,
    ) -> Option<(Epoch, &'m CityModelBuilding)> {
        let a = in_a.map(|b| (Epoch::A, b));
        let b = in_b.map(|b| (Epoch::B, b));
        match self.retain_epoch {
            RetainEpoch::Earlier => a.or(b),
            RetainEpoch::Later => b.or(a),
        }
    }
}

fn check_reference_systems(model_a: &CityModel, model_b: &CityModel) -> Result<()> {
    match (model_a.epsg(), model_b.epsg()) {
        (Some(a), Some(b)) if a != b => Err(ChangeError::IncompatibleModels(format!(
            "epochA uses EPSG:{} but epochB uses EPSG:{}",
            a, b
        ))),
        (Some(_), None) | (None, Some(_)) => {
            warn!("only one city model declares a reference system");
            Ok(())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// PROVENANCE CSV
// ============================================================================

#[derive(Debug, Serialize)]
struct ProvenanceRow<'a> {
    building_id: &'a str,
    provenance: &'static str,
    source_epoch: Option<&'static str>,
    verdict: Option<&'a str>,
    issue: Option<&'static str>,
}

pub fn write_provenance_csv(path: &Path, provenance: &[ProvenanceEntry]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for entry in provenance {
        writer.serialize(ProvenanceRow {
            building_id: entry.building_id.as_str(),
            provenance: entry.tag.as_str(),
            source_epoch: entry.source_epoch.map(|e| e.as_str()),
            verdict: entry.verdict.as_deref(),
            issue: entry.issue.map(|i| i.as_str()),
        })?;
    }
    writer.flush()?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
