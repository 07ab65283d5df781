// Building Change - Core Library
// Raster change detection per building + merge of two CityJSON epochs

pub mod error;
pub mod grid;           // Height grids, epochs, common-grid alignment
pub mod raster;         // GeoTIFF / ESRI ASCII readers
pub mod loader;         // Raster Pair Loader
pub mod aggregator;     // Difference Aggregator
pub mod classifier;     // Change Classifier + decision policy
pub mod verdict;        // Write-once verdict table + CSV
pub mod citymodel;      // CityJSON building records
pub mod merger;         // Model Merger + provenance
pub mod config;         // TOML run configuration
pub mod pipeline;       // Parallel detection + merge barrier
pub mod audit;          // SQLite event log

// Re-export commonly used types
pub use error::{ChangeError, Result};
pub use grid::{
    align, AlignedPair, AlignmentError, BuildingId, Epoch, GridGeometry, HeightGrid,
    ResampleMethod,
};
pub use raster::{
    detect_format, get_reader, read_raster, AsciiGridReader, GeoTiffReader, RasterFormat,
    RasterReader,
};
pub use loader::{DirectoryRasterSource, RasterPairLoader, RasterSource};
pub use aggregator::{Aggregate, ChangeStatistics, DifferenceAggregator, Incomparable};
pub use classifier::{
    ChangeClassifier, ChangeVerdict, CombineMode, DecisionPolicy, Metric, MetricTest,
    PolicySnapshot, VerdictBasis,
};
pub use verdict::{
    read_verdicts_csv, write_changed_list, write_verdicts_csv, VerdictSummary, VerdictTable,
    Verdicts,
};
pub use citymodel::{CityModel, CityModelBuilding};
pub use merger::{
    write_provenance_csv, MergeEngine, MergeIssue, MergedCityModel, ProvenanceEntry,
    ProvenanceTag, RetainEpoch,
};
pub use config::{Config, DetectionConfig, MergeConfig, PathsConfig};
pub use pipeline::{DetectionOutcome, DetectionPipeline};
pub use audit::{
    get_events_for_building, get_events_for_run, insert_event, new_run_id, open_audit_store,
    record_merge_started, record_provenance, record_run_finished, record_run_started,
    record_verdicts,
    setup_audit_store, AuditEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
