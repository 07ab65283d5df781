// ⚠️ Error taxonomy
// Per-building failures (recorded, run continues) vs fatal failures (abort
// before any building is processed).

use crate::grid::Epoch;
use thiserror::Error;

/// Result type for library operations
pub type Result<T> = std::result::Result<T, ChangeError>;

#[derive(Error, Debug)]
pub enum ChangeError {
    // ========================================================================
    // PER-BUILDING (never abort the run)
    // ========================================================================
    /// One epoch has no raster for the identifier
    #[error("Missing {epoch} raster for building {building_id}")]
    MissingEpoch { building_id: String, epoch: Epoch },

    /// The two rasters share no spatial extent or disagree on CRS
    #[error("Incompatible geometry for building {building_id}: {detail}")]
    IncompatibleGeometry { building_id: String, detail: String },

    /// A change was detected but the later epoch has no replacement geometry
    #[error("Building {building_id} changed but has no later-epoch representation")]
    MissingRepresentation { building_id: String },

    /// A raster exists but could not be decoded
    #[error("Unreadable raster {path}: {detail}")]
    Raster { path: String, detail: String },

    /// A decoded raster violates the grid shape invariants
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    // ========================================================================
    // FATAL (startup / input integrity)
    // ========================================================================
    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The same identifier appeared twice in one epoch's raster tree
    #[error("Duplicate building identifier {building_id} in {epoch} rasters")]
    DuplicateIdentifier { building_id: String, epoch: Epoch },

    /// A second verdict was written for the same identifier
    #[error("Verdict for building {0} already recorded")]
    DuplicateVerdict(String),

    /// City model document is structurally broken
    #[error("Invalid city model: {0}")]
    CityModel(String),

    /// The two city models cannot be merged (e.g. different CRS)
    #[error("Incompatible city models: {0}")]
    IncompatibleModels(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ChangeError {
    /// Per-building errors are recorded as explicit statuses instead of aborting
    pub fn is_per_building(&self) -> bool {
        matches!(
            self,
            ChangeError::MissingEpoch { .. }
                | ChangeError::IncompatibleGeometry { .. }
                | ChangeError::MissingRepresentation { .. }
                | ChangeError::Raster { .. }
                | ChangeError::InvalidGrid(_)
        )
    }
}
