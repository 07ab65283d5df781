// ⚙️ Run Configuration - TOML file → validated, explicit values
//
// Significance threshold and metric thresholds have no defaults; detection
// refuses to start without them. A merge-only config may omit both sections.

use crate::aggregator::DifferenceAggregator;
use crate::classifier::{ChangeClassifier, DecisionPolicy};
use crate::error::{ChangeError, Result};
use crate::grid::ResampleMethod;
use crate::merger::{MergeEngine, RetainEpoch};
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub detection: Option<DetectionConfig>,

    #[serde(default)]
    pub policy: Option<DecisionPolicy>,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Height delta (m) above which a cell pair counts as significant
    pub significance_threshold: f64,

    /// Detection threads; defaults to the available parallelism
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub resample: ResampleMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub retain_epoch: RetainEpoch,
}

/// Input/output locations. Relative paths resolve against the config file's directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub rasters_a: Option<PathBuf>,
    pub rasters_b: Option<PathBuf>,
    pub model_a: Option<PathBuf>,
    pub model_b: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,

    /// SQLite audit log; no audit trail when unset
    pub audit_db: Option<PathBuf>,
}

impl PathsConfig {
    fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.rasters_a,
            &mut self.rasters_b,
            &mut self.model_a,
            &mut self.model_b,
            &mut self.output_dir,
            &mut self.audit_db,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

// ============================================================================
// LOADING + VALIDATION
// ============================================================================

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ChangeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(base) = path.parent() {
            config.paths.resolve_against(base);
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| ChangeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check whichever sections are present
    pub fn validate(&self) -> Result<()> {
        if let Some(detection) = &self.detection {
            let threshold = detection.significance_threshold;
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(ChangeError::Config(format!(
                    "significance_threshold must be a finite value >= 0, got {}",
                    threshold
                )));
            }

            if detection.workers == Some(0) {
                return Err(ChangeError::Config("workers must be at least 1".to_string()));
            }
        }

        match &self.policy {
            Some(policy) => policy.validate(),
            None => Ok(()),
        }
    }

    /// `[detection]`, required by every command that reads rasters
    pub fn detection(&self) -> Result<&DetectionConfig> {
        self.detection
            .as_ref()
            .ok_or_else(|| ChangeError::Config("missing [detection] section".to_string()))
    }

    /// `[policy]`, required by every command that classifies
    pub fn policy(&self) -> Result<&DecisionPolicy> {
        self.policy
            .as_ref()
            .ok_or_else(|| ChangeError::Config("missing [policy] section".to_string()))
    }

    pub fn worker_count(&self) -> Result<usize> {
        Ok(self.detection()?.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        }))
    }

    pub fn aggregator(&self) -> Result<DifferenceAggregator> {
        Ok(DifferenceAggregator::new(self.detection()?.significance_threshold))
    }

    pub fn classifier(&self) -> Result<ChangeClassifier> {
        ChangeClassifier::new(self.policy()?.clone(), self.detection()?.significance_threshold)
    }

    pub fn merge_engine(&self) -> MergeEngine {
        MergeEngine::new(self.merge.retain_epoch)
    }
}

// ============================================================================
// TESTS
// ============================================================================
