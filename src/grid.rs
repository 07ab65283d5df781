// 🗺️ Height Grids - Epoch-tagged rasters + common-grid alignment
//
// Georeference convention (north-up, like GeoTIFF):
//   origin = upper-left corner of cell (0, 0)
//   cell (col, row) centre = (origin_x + (col + 0.5) * size, origin_y - (row + 0.5) * size)

use crate::error::{ChangeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Survey epoch. A is the earlier survey, B the later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Epoch {
    #[serde(rename = "epochA")]
    A,
    #[serde(rename = "epochB")]
    B,
}

impl Epoch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Epoch::A => "epochA",
            Epoch::B => "epochB",
        }
    }

    pub fn other(&self) -> Epoch {
        match self {
            Epoch::A => Epoch::B,
            Epoch::B => Epoch::A,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key shared by a raster pair and the city-model records of one building
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildingId(String);

impl BuildingId {
    pub fn new(id: impl Into<String>) -> Self {
        BuildingId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BuildingId {
    fn from(id: &str) -> Self {
        BuildingId::new(id)
    }
}

// ============================================================================
// GRID GEOMETRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// X of the left edge
    pub origin_x: f64,

    /// Y of the top edge
    pub origin_y: f64,

    /// Square cell edge length in CRS units
    pub cell_size: f64,

    /// Cell count along X
    pub width: usize,

    /// Cell count along Y
    pub height: usize,

    /// EPSG code, when the source declares one
    pub crs: Option<u32>,
}

impl GridGeometry {
    /// `width * height`, or `None` when the product does not fit in `usize`
    pub fn cell_count(&self) -> Option<usize> {
        self.width.checked_mul(self.height)
    }

    pub fn min_x(&self) -> f64 {
        self.origin_x
    }

    pub fn max_x(&self) -> f64 {
        self.origin_x + self.width as f64 * self.cell_size
    }

    pub fn min_y(&self) -> f64 {
        self.origin_y - self.height as f64 * self.cell_size
    }

    pub fn max_y(&self) -> f64 {
        self.origin_y
    }

    pub fn cell_centre(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.cell_size,
            self.origin_y - (row as f64 + 0.5) * self.cell_size,
        )
    }

    /// Cell containing a point, if the point lies inside the grid
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.cell_size).floor();
        let row = ((self.origin_y - y) / self.cell_size).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (col, row) = (col as usize, row as usize);
        if col >= self.width || row >= self.height {
            return None;
        }
        Some((col, row))
    }
}

// ============================================================================
// HEIGHT GRID
// ============================================================================

/// Height raster for one building and one epoch. `None` is no-data.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightGrid {
    geometry: GridGeometry,
    cells: Vec<Option<f64>>,
    epoch: Epoch,
}

impl HeightGrid {
    /// Build a grid, enforcing `width * height == cells.len()` and a positive cell size.
    /// Non-finite heights are stored as no-data.
    pub fn new(geometry: GridGeometry, cells: Vec<Option<f64>>, epoch: Epoch) -> Result<Self> {
        if !(geometry.cell_size.is_finite() && geometry.cell_size > 0.0) {
            return Err(ChangeError::InvalidGrid(format!(
                "cell size must be positive, got {}",
                geometry.cell_size
            )));
        }

        if geometry.cell_count() != Some(cells.len()) {
            return Err(ChangeError::InvalidGrid(format!(
                "{}x{} grid backed by {} cells",
                geometry.width,
                geometry.height,
                cells.len()
            )));
        }

        let cells = cells
            .into_iter()
            .map(|c| c.filter(|v| v.is_finite()))
            .collect();

        Ok(HeightGrid {
            geometry,
            cells,
            epoch,
        })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn cells(&self) -> &[Option<f64>] {
        &self.cells
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.geometry.width || row >= self.geometry.height {
            return None;
        }
        self.cells[row * self.geometry.width + col]
    }

    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }
}

// ============================================================================
// ALIGNMENT
// ============================================================================

/// How the coarser grid is propagated onto the finer grid's cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    /// Take the coarse cell containing the fine cell's centre
    #[default]
    Nearest,

    /// Area-weighted mean of overlapping coarse cells; no-data if any of them is no-data
    AreaWeighted,
}

/// Two grids on an identical cell layout
#[derive(Debug, Clone)]
pub struct AlignedPair {
    pub geometry: GridGeometry,
    pub epoch_a: HeightGrid,
    pub epoch_b: HeightGrid,
}

impl AlignedPair {
    /// Iterate `(epoch_a, epoch_b)` cell pairs over the common layout
    pub fn cell_pairs(&self) -> impl Iterator<Item = (Option<f64>, Option<f64>)> + '_ {
        self.epoch_a
            .cells()
            .iter()
            .copied()
            .zip(self.epoch_b.cells().iter().copied())
    }
}

/// Why two grids could not be brought onto a common layout
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentError {
    CrsMismatch { a: u32, b: u32 },
    NoOverlap,
}

impl fmt::Display for AlignmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentError::CrsMismatch { a, b } => {
                write!(f, "coordinate references differ (EPSG:{} vs EPSG:{})", a, b)
            }
            AlignmentError::NoOverlap => write!(f, "grid extents do not overlap"),
        }
    }
}

/// Bring both epochs onto the finer grid's cell layout, restricted to the shared extent.
///
/// The finer grid keeps its own values; the coarser one is resampled. With equal
/// cell sizes epoch A's layout is the reference. Extents that overlap without
/// sharing a single fine-cell centre give an empty pair rather than an error.
pub fn align(
    a: &HeightGrid,
    b: &HeightGrid,
    method: ResampleMethod,
) -> std::result::Result<AlignedPair, AlignmentError> {
    if let (Some(crs_a), Some(crs_b)) = (a.geometry.crs, b.geometry.crs) {
        if crs_a != crs_b {
            return Err(AlignmentError::CrsMismatch { a: crs_a, b: crs_b });
        }
    }

    let (fine, coarse) = if b.geometry.cell_size < a.geometry.cell_size {
        (b, a)
    } else {
        (a, b)
    };

    let window = overlap_window(&fine.geometry, &coarse.geometry).ok_or(AlignmentError::NoOverlap)?;
    let (col_start, col_end, row_start, row_end) = window;
    let fg = &fine.geometry;

    let geometry = GridGeometry {
        origin_x: fg.origin_x + col_start as f64 * fg.cell_size,
        origin_y: fg.origin_y - row_start as f64 * fg.cell_size,
        cell_size: fg.cell_size,
        width: col_end - col_start,
        height: row_end - row_start,
        crs: fg.crs.or(coarse.geometry.crs),
    };

    // window lies inside the fine grid, so the product is bounded by its cell count
    let capacity = geometry.cell_count().unwrap_or(0);
    let mut fine_cells = Vec::with_capacity(capacity);
    let mut coarse_cells = Vec::with_capacity(capacity);

    for row in row_start..row_end {
        for col in col_start..col_end {
            fine_cells.push(fine.get(col, row));

            let value = match method {
                ResampleMethod::Nearest => {
                    let (x, y) = fg.cell_centre(col, row);
                    coarse
                        .geometry
                        .locate(x, y)
                        .and_then(|(c, r)| coarse.get(c, r))
                }
                ResampleMethod::AreaWeighted => area_weighted(coarse, fg, col, row),
            };
            coarse_cells.push(value);
        }
    }

    let fine_grid = HeightGrid {
        geometry: geometry.clone(),
        cells: fine_cells,
        epoch: fine.epoch,
    };
    let coarse_grid = HeightGrid {
        geometry: geometry.clone(),
        cells: coarse_cells,
        epoch: coarse.epoch,
    };

    let (epoch_a, epoch_b) = if fine.epoch == Epoch::A {
        (fine_grid, coarse_grid)
    } else {
        (coarse_grid, fine_grid)
    };

    Ok(AlignedPair {
        geometry,
        epoch_a,
        epoch_b,
    })
}

/// Fine-grid cell window `(col_start, col_end, row_start, row_end)` whose centres
/// fall inside the coarse extent. Ends are exclusive and the window may be empty.
/// `None` only when the two extents share no area at all.
fn overlap_window(fine: &GridGeometry, coarse: &GridGeometry) -> Option<(usize, usize, usize, usize)> {
    if !extents_intersect(fine, coarse) {
        return None;
    }

    let size = fine.cell_size;

    let first = |v: f64, limit: usize| -> usize { (v.ceil().max(0.0) as usize).min(limit) };

    let col_start = first((coarse.min_x() - fine.origin_x) / size - 0.5, fine.width);
    let col_end = first((coarse.max_x() - fine.origin_x) / size - 0.5, fine.width).max(col_start);
    let row_start = first((fine.origin_y - coarse.max_y()) / size - 0.5, fine.height);
    let row_end = first((fine.origin_y - coarse.min_y()) / size - 0.5, fine.height).max(row_start);

    Some((col_start, col_end, row_start, row_end))
}

/// Open-rectangle intersection; extents that only touch along an edge do not intersect
fn extents_intersect(a: &GridGeometry, b: &GridGeometry) -> bool {
    a.min_x() < b.max_x() && b.min_x() < a.max_x() && a.min_y() < b.max_y() && b.min_y() < a.max_y()
}

fn area_weighted(coarse: &HeightGrid, fine: &GridGeometry, col: usize, row: usize) -> Option<f64> {
    let cg = &coarse.geometry;
    let x0 = fine.origin_x + col as f64 * fine.cell_size;
    let x1 = x0 + fine.cell_size;
    let y1 = fine.origin_y - row as f64 * fine.cell_size;
    let y0 = y1 - fine.cell_size;

    let c_first = ((x0 - cg.origin_x) / cg.cell_size).floor().max(0.0) as usize;
    let c_last = (((x1 - cg.origin_x) / cg.cell_size).ceil().max(0.0) as usize).min(cg.width);
    let r_first = ((cg.origin_y - y1) / cg.cell_size).floor().max(0.0) as usize;
    let r_last = (((cg.origin_y - y0) / cg.cell_size).ceil().max(0.0) as usize).min(cg.height);

    let mut weighted = 0.0;
    let mut total_area = 0.0;

    for r in r_first..r_last {
        for c in c_first..c_last {
            let cx0 = cg.origin_x + c as f64 * cg.cell_size;
            let cy1 = cg.origin_y - r as f64 * cg.cell_size;
            let overlap_x = (x1.min(cx0 + cg.cell_size) - x0.max(cx0)).max(0.0);
            let overlap_y = (y1.min(cy1) - y0.max(cy1 - cg.cell_size)).max(0.0);
            let area = overlap_x * overlap_y;
            if area <= 0.0 {
                continue;
            }

            // no-data anywhere under the cell keeps it no-data
            let height = coarse.get(c, r)?;
            weighted += height * area;
            total_area += area;
        }
    }

    if total_area > 0.0 {
        Some(weighted / total_area)
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(origin_x: f64, origin_y: f64, cell_size: f64, width: usize, height: usize) -> GridGeometry {
        GridGeometry {
            origin_x,
            origin_y,
            cell_size,
            width,
            height,
            crs: Some(28992),
        }
    }

    #[test]
    fn test_grid_rejects_shape_mismatch() {
        let err = HeightGrid::new(geometry(0.0, 2.0, 1.0, 2, 2), vec![Some(1.0); 3], Epoch::A);
        assert!(matches!(err, Err(ChangeError::InvalidGrid(_))));
    }

    #[test]
    fn test_grid_rejects_overflowing_shape() {
        let huge = geometry(0.0, 2.0, 1.0, usize::MAX / 2 + 1, 2);
        assert_eq!(huge.cell_count(), None);

        let err = HeightGrid::new(huge, vec![Some(1.0); 4], Epoch::A);
        assert!(matches!(err, Err(ChangeError::InvalidGrid(_))));
    }

    #[test]
    fn test_grid_rejects_non_positive_cell_size() {
        let err = HeightGrid::new(geometry(0.0, 2.0, 0.0, 2, 2), vec![Some(1.0); 4], Epoch::A);
        assert!(matches!(err, Err(ChangeError::InvalidGrid(_))));

        let err = HeightGrid::new(geometry(0.0, 2.0, -0.5, 2, 2), vec![Some(1.0); 4], Epoch::A);
        assert!(matches!(err, Err(ChangeError::InvalidGrid(_))));
    }

    #[test]
    fn test_nan_becomes_no_data() {
        let grid = HeightGrid::new(
            geometry(0.0, 1.0, 1.0, 2, 1),
            vec![Some(f64::NAN), Some(3.0)],
            Epoch::B,
        )
        .unwrap();
        assert_eq!(grid.get(0, 0), None);
        assert_eq!(grid.get(1, 0), Some(3.0));
        assert_eq!(grid.valid_count(), 1);
    }

    #[test]
    fn test_align_identical_layout_is_identity() {
        let cells = vec![Some(1.0), None, Some(3.0), Some(4.0)];
        let a = HeightGrid::new(geometry(10.0, 20.0, 0.5, 2, 2), cells.clone(), Epoch::A).unwrap();
        let b = HeightGrid::new(geometry(10.0, 20.0, 0.5, 2, 2), cells.clone(), Epoch::B).unwrap();

        let pair = align(&a, &b, ResampleMethod::Nearest).unwrap();
        assert_eq!(pair.geometry.width, 2);
        assert_eq!(pair.geometry.height, 2);
        assert_eq!(pair.epoch_a.cells(), &cells[..]);
        assert_eq!(pair.epoch_b.cells(), &cells[..]);
    }

    #[test]
    fn test_align_resamples_coarse_onto_fine() {
        // A: 1 m cells, 2x2. B: 0.5 m cells, 4x4 over the same extent.
        let a = HeightGrid::new(
            geometry(0.0, 2.0, 1.0, 2, 2),
            vec![Some(1.0), Some(2.0), None, Some(4.0)],
            Epoch::A,
        )
        .unwrap();
        let b = HeightGrid::new(geometry(0.0, 2.0, 0.5, 4, 4), vec![Some(9.0); 16], Epoch::B).unwrap();

        let pair = align(&a, &b, ResampleMethod::Nearest).unwrap();
        assert_eq!(pair.geometry.cell_size, 0.5);
        assert_eq!(pair.geometry.cell_count(), Some(16));
        assert_eq!(pair.epoch_a.epoch(), Epoch::A);
        assert_eq!(pair.epoch_b.epoch(), Epoch::B);

        // Upper-left quadrant of A = 1.0, lower-left quadrant is no-data
        assert_eq!(pair.epoch_a.get(0, 0), Some(1.0));
        assert_eq!(pair.epoch_a.get(1, 1), Some(1.0));
        assert_eq!(pair.epoch_a.get(3, 0), Some(2.0));
        assert_eq!(pair.epoch_a.get(0, 3), None);
        assert_eq!(pair.epoch_a.get(1, 2), None);
        assert_eq!(pair.epoch_a.get(3, 3), Some(4.0));
        assert_eq!(pair.epoch_b.get(2, 2), Some(9.0));
    }

    #[test]
    fn test_area_weighted_never_fills_no_data() {
        // Coarse 1 m grid shifted by half a cell so fine cells straddle coarse cells
        let coarse = HeightGrid::new(
            geometry(0.0, 1.0, 1.0, 2, 1),
            vec![Some(2.0), None],
            Epoch::A,
        )
        .unwrap();
        let fine = HeightGrid::new(geometry(0.25, 1.0, 0.5, 3, 2), vec![Some(0.0); 6], Epoch::B).unwrap();

        let pair = align(&coarse, &fine, ResampleMethod::AreaWeighted).unwrap();
        // Fine col 0 spans [0.25, 0.75] inside the valid coarse cell
        assert_eq!(pair.epoch_a.get(0, 0), Some(2.0));
        // Fine col 1 spans [0.75, 1.25], touching the no-data coarse cell
        assert_eq!(pair.epoch_a.get(1, 0), None);
        // Fine col 2 lies entirely in the no-data cell
        assert_eq!(pair.epoch_a.get(2, 0), None);
    }

    #[test]
    fn test_area_weighted_mean_of_valid_cells() {
        let coarse = HeightGrid::new(
            geometry(0.0, 1.0, 1.0, 2, 1),
            vec![Some(2.0), Some(4.0)],
            Epoch::A,
        )
        .unwrap();
        let fine = HeightGrid::new(geometry(0.75, 1.0, 0.5, 1, 2), vec![Some(0.0); 2], Epoch::B).unwrap();

        let pair = align(&coarse, &fine, ResampleMethod::AreaWeighted).unwrap();
        // [0.75, 1.25] is half in each coarse cell
        let value = pair.epoch_a.get(0, 0).unwrap();
        assert!((value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_align_crops_to_shared_extent() {
        let a = HeightGrid::new(geometry(0.0, 4.0, 1.0, 4, 4), vec![Some(1.0); 16], Epoch::A).unwrap();
        let b = HeightGrid::new(geometry(2.0, 4.0, 1.0, 4, 2), vec![Some(1.0); 8], Epoch::B).unwrap();

        let pair = align(&a, &b, ResampleMethod::Nearest).unwrap();
        assert_eq!(pair.geometry.origin_x, 2.0);
        assert_eq!(pair.geometry.origin_y, 4.0);
        assert_eq!(pair.geometry.width, 2);
        assert_eq!(pair.geometry.height, 2);
    }

    #[test]
    fn test_align_disjoint_extents() {
        let a = HeightGrid::new(geometry(0.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::A).unwrap();
        let b = HeightGrid::new(geometry(50.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::B).unwrap();

        assert_eq!(align(&a, &b, ResampleMethod::Nearest).unwrap_err(), AlignmentError::NoOverlap);
    }

    #[test]
    fn test_align_touching_edges_do_not_overlap() {
        let a = HeightGrid::new(geometry(0.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::A).unwrap();
        let b = HeightGrid::new(geometry(1.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::B).unwrap();

        assert_eq!(align(&a, &b, ResampleMethod::Nearest).unwrap_err(), AlignmentError::NoOverlap);
    }

    #[test]
    fn test_align_sliver_overlap_gives_empty_pair() {
        // extents share a 0.1 wide strip that holds no fine-cell centre
        let a = HeightGrid::new(geometry(0.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::A).unwrap();
        let b = HeightGrid::new(geometry(0.9, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::B).unwrap();

        let pair = align(&a, &b, ResampleMethod::Nearest).unwrap();
        assert_eq!(pair.geometry.width, 0);
        assert_eq!(pair.geometry.cell_count(), Some(0));
        assert_eq!(pair.cell_pairs().count(), 0);
    }

    #[test]
    fn test_align_crs_mismatch() {
        let a = HeightGrid::new(geometry(0.0, 1.0, 1.0, 1, 1), vec![Some(1.0)], Epoch::A).unwrap();
        let mut other = geometry(0.0, 1.0, 1.0, 1, 1);
        other.crs = Some(4326);
        let b = HeightGrid::new(other, vec![Some(1.0)], Epoch::B).unwrap();

        assert!(matches!(
            align(&a, &b, ResampleMethod::Nearest),
            Err(AlignmentError::CrsMismatch { a: 28992, b: 4326 })
        ));
    }
}
