// 🚦 Detection Pipeline - load → aggregate → classify for every building
//
// Buildings are independent, so detection fans out on a bounded rayon pool
// into a write-once verdict table. Merging only starts after every worker has
// returned. A cancelled run still hands back the partial table.

use crate::aggregator::{DifferenceAggregator, Incomparable};
use crate::citymodel::CityModel;
use crate::classifier::{ChangeClassifier, ChangeVerdict};
use crate::error::{ChangeError, Result};
use crate::grid::BuildingId;
use crate::loader::{RasterPairLoader, RasterSource};
use crate::merger::{MergeEngine, MergedCityModel};
use crate::verdict::{VerdictSummary, VerdictTable, Verdicts};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one detection phase
#[derive(Debug)]
pub struct DetectionOutcome {
    pub verdicts: Verdicts,

    /// Identifiers requested
    pub requested: usize,

    /// True when the cancel flag stopped the run before every building was visited
    pub cancelled: bool,
}

impl DetectionOutcome {
    pub fn summary(&self) -> VerdictSummary {
        VerdictSummary::from_verdicts(&self.verdicts)
    }

    pub fn skipped(&self) -> usize {
        self.requested - self.verdicts.len()
    }
}

pub struct DetectionPipeline<S: RasterSource> {
    loader: RasterPairLoader<S>,
    aggregator: DifferenceAggregator,
    classifier: ChangeClassifier,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl<S: RasterSource> DetectionPipeline<S> {
    pub fn new(
        loader: RasterPairLoader<S>,
        aggregator: DifferenceAggregator,
        classifier: ChangeClassifier,
        workers: usize,
    ) -> Self {
        DetectionPipeline {
            loader,
            aggregator,
            classifier,
            workers: workers.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the returned flag stops workers from starting new buildings
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Share an externally owned cancel flag (e.g. a signal handler's)
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn classifier(&self) -> &ChangeClassifier {
        &self.classifier
    }

    /// Detect every identifier known to the raster source
    pub fn detect_all(&self) -> Result<DetectionOutcome> {
        let ids = self.loader.source().building_ids();
        self.detect(&ids)
    }

    pub fn detect(&self, ids: &BTreeSet<BuildingId>) -> Result<DetectionOutcome> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| ChangeError::Config(format!("cannot start {} workers: {}", self.workers, e)))?;

        info!(buildings = ids.len(), workers = self.workers, "detection started");

        let table = VerdictTable::new();
        pool.install(|| {
            ids.par_iter().try_for_each(|id| {
                if self.cancel.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let verdict = self.detect_one(id)?;
                table.insert(verdict)
            })
        })?;

        // Barrier: every worker has returned here
        let verdicts = table.into_verdicts();
        let outcome = DetectionOutcome {
            requested: ids.len(),
            cancelled: self.cancel.load(Ordering::Relaxed) && verdicts.len() < ids.len(),
            verdicts,
        };

        let summary = outcome.summary();
        info!(
            changed = summary.changed,
            unchanged = summary.unchanged,
            incomparable = summary.incomparable,
            skipped = outcome.skipped(),
            cancelled = outcome.cancelled,
            "detection finished"
        );

        Ok(outcome)
    }

    /// One building; per-building failures become Incomparable verdicts
    pub fn detect_one(&self, id: &BuildingId) -> Result<ChangeVerdict> {
        let reason = match self.loader.load_pair(id) {
            Ok(pair) => {
                let aggregate = self.aggregator.aggregate(&pair);
                let verdict = self.classifier.classify(id.clone(), aggregate);
                debug!(building = %id, status = verdict.status(), "classified");
                return Ok(verdict);
            }
            Err(ChangeError::MissingEpoch { epoch, .. }) => Incomparable::MissingEpoch { epoch },
            Err(ChangeError::IncompatibleGeometry { detail, .. }) => Incomparable::IncompatibleGeometry { detail },
            Err(e @ (ChangeError::Raster { .. } | ChangeError::InvalidGrid(_))) => {
                Incomparable::Unreadable { detail: e.to_string() }
            }
            Err(fatal) => return Err(fatal),
        };

        warn!(building = %id, reason = reason.code(), "building is incomparable: {}", reason);
        Ok(self.classifier.incomparable(id.clone(), reason))
    }

    /// Detection, then (after the barrier) merge of the two epoch models
    pub fn detect_and_merge(
        &self,
        ids: &BTreeSet<BuildingId>,
        engine: &MergeEngine,
        model_a: &CityModel,
        model_b: &CityModel,
    ) -> Result<(DetectionOutcome, MergedCityModel)> {
        let outcome = self.detect(ids)?;
        let merged = engine.merge(&outcome.verdicts, model_a, model_b)?;
        Ok((outcome, merged))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{CombineMode, DecisionPolicy, Metric};
    use crate::grid::{Epoch, GridGeometry, HeightGrid, ResampleMethod};
    use crate::merger::ProvenanceTag;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// In-memory rasters; ids in `broken` fail to decode, ids in `misshapen` decode to a
    /// bad grid shape, `trigger` sets the cancel flag on load
    #[derive(Default)]
    struct MemorySource {
        grids: HashMap<(BuildingId, Epoch), Vec<Option<f64>>>,
        broken: BTreeSet<BuildingId>,
        misshapen: BTreeSet<BuildingId>,
        trigger: Option<(BuildingId, Arc<AtomicBool>)>,
        loads: Mutex<usize>,
    }

    impl MemorySource {
        fn with(mut self, id: &str, epoch: Epoch, cells: Vec<Option<f64>>) -> Self {
            self.grids.insert((BuildingId::new(id), epoch), cells);
            self
        }
    }

    impl RasterSource for MemorySource {
        fn load(&self, id: &BuildingId, epoch: Epoch) -> Result<Option<HeightGrid>> {
            *self.loads.lock().unwrap() += 1;
            if let Some((trigger, flag)) = &self.trigger {
                if trigger == id {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            if self.broken.contains(id) {
                return Err(ChangeError::Raster {
                    path: format!("{}.tif", id),
                    detail: "truncated strip".to_string(),
                });
            }
            if self.misshapen.contains(id) {
                let geometry = GridGeometry {
                    origin_x: 0.0,
                    origin_y: 2.0,
                    cell_size: 1.0,
                    width: 2,
                    height: 2,
                    crs: Some(28992),
                };
                return HeightGrid::new(geometry, vec![Some(1.0); 3], epoch).map(Some);
            }
            let Some(cells) = self.grids.get(&(id.clone(), epoch)) else {
                return Ok(None);
            };
            let geometry = GridGeometry {
                origin_x: 0.0,
                origin_y: 1.0,
                cell_size: 1.0,
                width: cells.len(),
                height: 1,
                crs: Some(28992),
            };
            HeightGrid::new(geometry, cells.clone(), epoch).map(Some)
        }

        fn building_ids(&self) -> BTreeSet<BuildingId> {
            self.grids
                .keys()
                .map(|(id, _)| id.clone())
                .chain(self.broken.iter().cloned())
                .chain(self.misshapen.iter().cloned())
                .collect()
        }
    }

    fn classifier() -> ChangeClassifier {
        let policy = DecisionPolicy::new(
            BTreeMap::from([(Metric::SignificantFraction, 0.1)]),
            CombineMode::All,
        );
        ChangeClassifier::new(policy, 0.5).unwrap()
    }

    fn pipeline(source: MemorySource, workers: usize) -> DetectionPipeline<MemorySource> {
        DetectionPipeline::new(
            RasterPairLoader::new(source, ResampleMethod::Nearest),
            DifferenceAggregator::new(0.5),
            classifier(),
            workers,
        )
    }

    fn mixed_source() -> MemorySource {
        let flat = vec![Some(10.0); 10];
        let mut raised = flat.clone();
        for cell in raised.iter_mut().take(3) {
            *cell = Some(12.0);
        }

        let mut source = MemorySource::default()
            .with("changed", Epoch::A, flat.clone())
            .with("changed", Epoch::B, raised)
            .with("same", Epoch::A, flat.clone())
            .with("same", Epoch::B, flat.clone())
            .with("no-b", Epoch::A, flat.clone())
            .with("empty", Epoch::A, vec![None; 10])
            .with("empty", Epoch::B, flat);
        source.broken.insert(BuildingId::new("broken"));
        source
    }

    #[test]
    fn test_every_building_gets_an_explicit_status() {
        let outcome = pipeline(mixed_source(), 2).detect_all().unwrap();
        let status = |id: &str| outcome.verdicts[&BuildingId::new(id)].status();

        assert_eq!(outcome.verdicts.len(), 5);
        assert!(!outcome.cancelled);
        assert_eq!(status("changed"), "changed");
        assert_eq!(status("same"), "unchanged");
        assert_eq!(status("no-b"), "incomparable");
        assert_eq!(status("empty"), "incomparable");
        assert_eq!(status("broken"), "incomparable");

        let summary = outcome.summary();
        assert_eq!((summary.changed, summary.unchanged, summary.incomparable), (1, 1, 3));
    }

    #[test]
    fn test_incomparable_reasons() {
        let p = pipeline(mixed_source(), 1);
        let basis = |id: &str| p.detect_one(&BuildingId::new(id)).unwrap().basis;

        use crate::classifier::VerdictBasis::Incomparable as Inc;
        assert_eq!(basis("no-b"), Inc(Incomparable::MissingEpoch { epoch: Epoch::B }));
        assert_eq!(basis("empty"), Inc(Incomparable::NoValidOverlap));
        assert!(matches!(basis("broken"), Inc(Incomparable::Unreadable { .. })));
    }

    #[test]
    fn test_bad_grid_shape_is_unreadable_not_fatal() {
        let mut source = mixed_source();
        source.misshapen.insert(BuildingId::new("misshapen"));

        let outcome = pipeline(source, 2).detect_all().unwrap();
        assert_eq!(outcome.verdicts.len(), 6);
        assert!(matches!(
            outcome.verdicts[&BuildingId::new("misshapen")].basis,
            crate::classifier::VerdictBasis::Incomparable(Incomparable::Unreadable { .. })
        ));
    }

    #[test]
    fn test_worker_count_does_not_change_verdicts() {
        let one = pipeline(mixed_source(), 1).detect_all().unwrap();
        let many = pipeline(mixed_source(), 8).detect_all().unwrap();
        assert_eq!(one.verdicts, many.verdicts);
    }

    #[test]
    fn test_cancel_before_start_returns_empty_table() {
        let p = pipeline(mixed_source(), 4);
        p.cancel_flag().store(true, Ordering::Relaxed);

        let outcome = p.detect_all().unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.verdicts.is_empty());
        assert_eq!(outcome.skipped(), 5);
        assert_eq!(*p.loader.source().loads.lock().unwrap(), 0);
    }

    #[test]
    fn test_external_cancel_flag_is_honoured() {
        // the CLI hands its Ctrl-C flag to the pipeline the same way
        let interrupt = Arc::new(AtomicBool::new(false));
        let p = pipeline(mixed_source(), 2).with_cancel_flag(Arc::clone(&interrupt));
        interrupt.store(true, Ordering::SeqCst);

        let outcome = p.detect_all().unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.verdicts.is_empty());
        assert!(p.cancel_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_mid_run_keeps_partial_table_for_merge() {
        let flat = vec![Some(1.0); 4];
        let mut source = MemorySource::default();
        for i in 0..6 {
            let id = format!("b{:02}", i);
            source = source.with(&id, Epoch::A, flat.clone()).with(&id, Epoch::B, flat.clone());
        }

        let flag = Arc::new(AtomicBool::new(false));
        source.trigger = Some((BuildingId::new("b00"), Arc::clone(&flag)));
        let p = pipeline(source, 1).with_cancel_flag(flag);

        let outcome = p.detect_all().unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.verdicts.contains_key(&BuildingId::new("b00")));
        assert!(outcome.verdicts.len() < 6);

        // Every building exists in both models; unverdicted ones are dropped, not guessed
        let ids: Vec<String> = (0..6).map(|i| format!("b{:02}", i)).collect();
        let model = city_model(&ids);
        let merged = MergeEngine::default().merge(&outcome.verdicts, &model, &model).unwrap();

        assert_eq!(merged.provenance.len(), 6);
        assert_eq!(merged.count(ProvenanceTag::DroppedNoVerdict), 6 - outcome.verdicts.len());
        assert_eq!(merged.count(ProvenanceTag::UnchangedRetained), outcome.verdicts.len());
    }

    #[test]
    fn test_detect_and_merge() {
        let model_a = city_model(&["changed".to_string(), "same".to_string()]);
        let model_b = city_model(&["changed".to_string(), "same".to_string(), "new".to_string()]);
        let p = pipeline(mixed_source(), 2);
        let ids = p.loader.source().building_ids();

        let (outcome, merged) = p
            .detect_and_merge(&ids, &MergeEngine::default(), &model_a, &model_b)
            .unwrap();

        assert_eq!(outcome.verdicts.len(), 5);
        let tag = |id: &str| merged.entry(&BuildingId::new(id)).unwrap().tag;
        assert_eq!(tag("changed"), ProvenanceTag::ChangedReplaced);
        assert_eq!(tag("same"), ProvenanceTag::UnchangedRetained);
        assert_eq!(tag("new"), ProvenanceTag::PresentInOneSourceOnly);
        assert_eq!(tag("no-b"), ProvenanceTag::DroppedNoGeometry);
    }

    fn city_model(ids: &[String]) -> CityModel {
        let mut objects = serde_json::Map::new();
        for id in ids {
            objects.insert(
                id.clone(),
                json!({ "type": "Building", "geometry": [{ "type": "MultiPoint", "lod": "0", "boundaries": [0] }] }),
            );
        }
        CityModel::from_value(json!({
            "type": "CityJSON",
            "version": "1.1",
            "transform": { "scale": [0.001, 0.001, 0.001], "translate": [0.0, 0.0, 0.0] },
            "CityObjects": serde_json::Value::Object(objects),
            "vertices": [[0, 0, 0]]
        }))
        .unwrap()
    }
}
