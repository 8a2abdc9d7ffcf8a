//! Engine configuration.
//!
//! Plain-text `KEY = VALUE` files with `#` comments; all whitespace is
//! stripped before parsing. Unknown keys emit a diagnostic and are ignored,
//! malformed lines are parse errors, and out-of-range values are rejected
//! at validation.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detector::{DistanceDetector, OutlierDetector, StdevDetector};
use crate::dual::StagingHeap;
use crate::error::{EngineError, Result};

/// Which outlier detector the coordinator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetectorType {
    /// No outlier detection
    #[default]
    None,
    /// Running-average-gap detector
    Distance,
    /// Gap-stdev detector
    Stdev,
}

/// Tuning knobs for the dual coordinator and its trees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Page-cache capacity, split between the two trees
    pub blocks_in_memory: usize,
    /// Split fraction of the primary tree
    pub sorted_tree_split_frac: f32,
    /// Split fraction of the outlier tree
    pub unsorted_tree_split_frac: f32,
    /// Swap an in-range key with the full tail leaf's maximum
    pub enable_lazy_move: bool,
    /// Staging heap capacity; 0 disables the buffer
    pub heap_size: usize,
    /// Outlier detector selection
    pub outlier_detector_type: DetectorType,
    /// Distance detector: initial tolerance factor
    pub init_tolerance_factor: f64,
    /// Distance detector: tolerance floor
    pub min_tolerance_factor: f64,
    /// Distance detector: expected average gap of the input
    pub expected_avg_distance: f64,
    /// Stdev detector: flagged beyond this many standard deviations
    pub num_stdev: f64,
    /// Stdev detector: window over the last k leaves; 0 disables
    pub last_k_stdev: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blocks_in_memory: 15000,
            sorted_tree_split_frac: 0.8,
            unsorted_tree_split_frac: 0.5,
            enable_lazy_move: true,
            heap_size: 0,
            outlier_detector_type: DetectorType::None,
            init_tolerance_factor: 100.0,
            min_tolerance_factor: 20.0,
            expected_avg_distance: 2.5,
            num_stdev: 3.0,
            last_k_stdev: 0,
        }
    }
}

impl EngineConfig {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| EngineError::config_parse(line_no, "expected KEY = VALUE"))?;
            config.apply(key, value, line_no)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        fn parse<T: std::str::FromStr>(value: &str, line: usize, key: &str) -> Result<T> {
            value.parse().map_err(|_| {
                EngineError::config_parse(line, format!("bad value {value:?} for {key}"))
            })
        }

        match key {
            "BLOCKS_IN_MEMORY" => self.blocks_in_memory = parse(value, line, key)?,
            "SORTED_TREE_SPLIT_FRAC" => self.sorted_tree_split_frac = parse(value, line, key)?,
            "UNSORTED_TREE_SPLIT_FRAC" => self.unsorted_tree_split_frac = parse(value, line, key)?,
            "ENABLE_LAZY_MOVE" => {
                self.enable_lazy_move = value.eq_ignore_ascii_case("true");
            }
            "HEAP_SIZE" => self.heap_size = parse(value, line, key)?,
            "OUTLIER_DETECTOR_TYPE" => {
                self.outlier_detector_type = match value.trim_matches('"') {
                    "DIST" => DetectorType::Distance,
                    "STDEV" => DetectorType::Stdev,
                    other => {
                        warn!(value = other, "invalid OUTLIER_DETECTOR_TYPE, detector disabled");
                        DetectorType::None
                    }
                };
            }
            "INIT_TOLERANCE_FACTOR" => self.init_tolerance_factor = parse(value, line, key)?,
            "MIN_TOLERANCE_FACTOR" => self.min_tolerance_factor = parse(value, line, key)?,
            "EXPECTED_AVG_DISTANCE" => self.expected_avg_distance = parse(value, line, key)?,
            "NUM_STDEV" => self.num_stdev = parse(value, line, key)?,
            "LAST_K_STDEV" => self.last_k_stdev = parse(value, line, key)?,
            other => warn!(key = other, "unknown configuration knob ignored"),
        }
        Ok(())
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<()> {
        for (name, frac) in [
            ("SORTED_TREE_SPLIT_FRAC", self.sorted_tree_split_frac),
            ("UNSORTED_TREE_SPLIT_FRAC", self.unsorted_tree_split_frac),
        ] {
            if !(frac > 0.0 && frac <= 1.0) {
                return Err(EngineError::invalid_argument(format!(
                    "{name} must be in (0, 1], got {frac}"
                )));
            }
        }
        Ok(())
    }

    /// Construct the configured detector, if any
    pub fn build_detector(&self) -> Option<Arc<Mutex<dyn OutlierDetector>>> {
        match self.outlier_detector_type {
            DetectorType::None => None,
            DetectorType::Distance => Some(Arc::new(Mutex::new(DistanceDetector::new(
                self.init_tolerance_factor,
                self.min_tolerance_factor,
                self.expected_avg_distance,
            )))),
            DetectorType::Stdev => Some(Arc::new(Mutex::new(StdevDetector::new(
                self.num_stdev,
                self.last_k_stdev,
            )))),
        }
    }

    /// Construct the staging heap, if enabled
    pub fn build_heap(&self) -> Option<StagingHeap> {
        (self.heap_size > 0).then(|| StagingHeap::new(self.heap_size))
    }
}
