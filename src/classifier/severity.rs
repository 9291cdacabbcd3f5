//! Severity scoring for content-only changes

use crate::config::ClassifierConfig;

/// Scores a content change by its relative size
///
/// The relative length delta is weighted and clamped into
/// `[minor_floor, content_ceiling]`, so even a byte-neutral rewrite scores
/// the floor and no text edit outranks a structural change.
pub fn content_severity(config: &ClassifierConfig, old_len: u64, new_len: u64) -> f64 {
    let delta = old_len.abs_diff(new_len) as f64;
    let base = old_len.max(1) as f64;
    let raw = config.content_weight * delta / base;

    if raw.is_nan() {
        return config.minor_floor;
    }
    raw.clamp(config.minor_floor, config.content_ceiling)
}
