//! Distance-based outlier detection.
//!
//! Tracks the running average gap between consecutive accepted keys. A key
//! whose gap to its predecessor exceeds `avg_gap * tolerance` is an outlier.
//! After every accepted key the tolerance adapts toward the configured
//! expected average gap, never dropping below the configured minimum.

use crate::detector::{LeafSummary, OutlierDetector};
use crate::types::Key;

/// Acceptable excess of the observed average over the expected one before
/// the tolerance factor starts shrinking
const MAX_ERROR: f64 = 0.5;

/// Running-average-gap outlier detector
pub struct DistanceDetector {
    init_tolerance: f64,
    min_tolerance: f64,
    expected_avg: f64,
    tolerance: f64,
    avg_gap: Option<f64>,
    previous_key: Key,
    accepted: u64,
}

impl DistanceDetector {
    /// Create a detector with the given initial and minimum tolerance
    /// factors and the expected average gap of the input stream
    pub fn new(init_tolerance: f64, min_tolerance: f64, expected_avg: f64) -> Self {
        Self {
            init_tolerance,
            min_tolerance,
            expected_avg,
            tolerance: init_tolerance,
            avg_gap: None,
            previous_key: 0,
            accepted: 0,
        }
    }

    fn adapt_tolerance(&mut self, avg: f64) {
        if avg < self.expected_avg + MAX_ERROR {
            self.tolerance = self.init_tolerance;
        } else {
            self.tolerance *= self.expected_avg / avg;
        }
        self.tolerance = self.tolerance.max(self.min_tolerance);
    }
}

impl OutlierDetector for DistanceDetector {
    fn prime(&mut self, key: Key) {
        self.previous_key = key;
        self.accepted = 1;
    }

    fn is_outlier(&mut self, key: Key) -> bool {
        if self.accepted == 0 {
            self.prime(key);
            return false;
        }

        let gap = key.saturating_sub(self.previous_key) as f64;
        match self.avg_gap {
            None => self.avg_gap = Some(gap),
            Some(avg) => {
                if gap > avg * self.tolerance {
                    return true;
                }
                let avg = (avg * (self.accepted - 1) as f64 + gap) / self.accepted as f64;
                self.avg_gap = Some(avg);
                if self.expected_avg > 1.0 {
                    self.adapt_tolerance(avg);
                }
            }
        }
        self.previous_key = self.previous_key.max(key);
        self.accepted += 1;
        false
    }

    fn record_split(&mut self, _summary: LeafSummary) {}
}
