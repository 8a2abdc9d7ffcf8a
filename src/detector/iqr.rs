//! IQR-style admissibility bound for split decisions.
//!
//! Consulted only when a fast-path leaf splits or soft-advances, never on
//! the plain insert path. Given the distance `d_prev` between the two prior
//! leaves' minimum keys and their sizes, `upper_bound` returns the largest
//! span a non-outlier successor leaf may take: the previous leaf's per-key
//! gap density, scaled to the current leaf's size, times 5/2 (the
//! `Q3 + 1.5 * IQR` analogue with the observed spread standing in for the
//! interquartile range).

use crate::types::Key;

/// Largest plausible non-outlier distance for the current leaf.
///
/// Monotone non-decreasing in `d_prev` and `n_curr`. Callers guarantee
/// `n_prev > 0`; a zero previous size admits everything.
pub fn upper_bound(d_prev: Key, n_prev: usize, n_curr: usize) -> Key {
    if n_prev == 0 {
        return Key::MAX;
    }
    let scaled = d_prev as u128 * n_curr as u128 * 5 / (2 * n_prev as u128);
    scaled.min(Key::MAX as u128) as Key
}
