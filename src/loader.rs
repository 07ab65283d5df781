// 📂 Raster Pair Loader
// Finds both epochs' rasters for a building and aligns them to a common grid.

use crate::error::{ChangeError, Result};
use crate::grid::{align, AlignedPair, BuildingId, Epoch, HeightGrid, ResampleMethod};
use crate::raster::{detect_format, read_raster};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

// ============================================================================
// RASTER SOURCE
// ============================================================================

/// Where height grids come from. `Ok(None)` means the epoch has no raster for the id.
pub trait RasterSource: Send + Sync {
    fn load(&self, id: &BuildingId, epoch: Epoch) -> Result<Option<HeightGrid>>;

    /// Every identifier with a raster in at least one epoch
    fn building_ids(&self) -> BTreeSet<BuildingId>;
}

/// Two directory trees (one per epoch), rasters named `<building id>.<ext>`.
/// Both trees are indexed once up front.
#[derive(Debug, Clone)]
pub struct DirectoryRasterSource {
    index_a: BTreeMap<BuildingId, PathBuf>,
    index_b: BTreeMap<BuildingId, PathBuf>,
}

impl DirectoryRasterSource {
    pub fn scan(dir_a: &Path, dir_b: &Path) -> Result<Self> {
        let index_a = index_directory(dir_a, Epoch::A)?;
        let index_b = index_directory(dir_b, Epoch::B)?;

        debug!(
            epoch_a = index_a.len(),
            epoch_b = index_b.len(),
            "indexed raster directories"
        );

        Ok(DirectoryRasterSource { index_a, index_b })
    }

    pub fn path(&self, id: &BuildingId, epoch: Epoch) -> Option<&Path> {
        let index = match epoch {
            Epoch::A => &self.index_a,
            Epoch::B => &self.index_b,
        };
        index.get(id).map(PathBuf::as_path)
    }
}

impl RasterSource for DirectoryRasterSource {
    fn load(&self, id: &BuildingId, epoch: Epoch) -> Result<Option<HeightGrid>> {
        match self.path(id, epoch) {
            Some(path) => read_raster(path, epoch).map(Some),
            None => Ok(None),
        }
    }

    fn building_ids(&self) -> BTreeSet<BuildingId> {
        self.index_a
            .keys()
            .chain(self.index_b.keys())
            .cloned()
            .collect()
    }
}

fn index_directory(dir: &Path, epoch: Epoch) -> Result<BTreeMap<BuildingId, PathBuf>> {
    let mut index = BTreeMap::new();

    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || detect_format(entry.path()).is_none() {
            continue;
        }

        let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let id = BuildingId::new(stem);
        if index.contains_key(&id) {
            return Err(ChangeError::DuplicateIdentifier {
                building_id: id.to_string(),
                epoch,
            });
        }
        index.insert(id, entry.into_path());
    }

    Ok(index)
}

// ============================================================================
// PAIR LOADER
// ============================================================================

pub struct RasterPairLoader<S: RasterSource> {
    source: S,
    resample: ResampleMethod,
}

impl<S: RasterSource> RasterPairLoader<S> {
    pub fn new(source: S, resample: ResampleMethod) -> Self {
        RasterPairLoader { source, resample }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Load both epochs for `id` on a common grid.
    ///
    /// Fails with `MissingEpoch` if either raster is absent and with
    /// `IncompatibleGeometry` if the rasters cannot share a grid.
    pub fn load_pair(&self, id: &BuildingId) -> Result<AlignedPair> {
        let a = self.require(id, Epoch::A)?;
        let b = self.require(id, Epoch::B)?;

        align(&a, &b, self.resample).map_err(|e| ChangeError::IncompatibleGeometry {
            building_id: id.to_string(),
            detail: e.to_string(),
        })
    }

    fn require(&self, id: &BuildingId, epoch: Epoch) -> Result<HeightGrid> {
        self.source
            .load(id, epoch)?
            .ok_or_else(|| ChangeError::MissingEpoch {
                building_id: id.to_string(),
                epoch,
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
