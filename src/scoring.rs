//! Deterministic document scoring.
//!
//! Both scores are pure functions of the document and are recomputed on
//! every write; stored values exist only so search can filter on them.
//!
//! - completeness = non-empty required sections / 6
//! - quality = 0.4 × length + 0.3 × sources + 0.3 × confidence, where each
//!   component is normalized to [0, 1] against a fixed ceiling
//!
//! Changing the weights or ceilings changes every score in the store, so
//! they live here as named constants rather than configuration.

use crate::models::ResearchOutput;

/// Weight of total section length in the quality score.
pub const LENGTH_WEIGHT: f64 = 0.4;
/// Weight of the source count in the quality score.
pub const SOURCE_WEIGHT: f64 = 0.3;
/// Weight of the caller-supplied confidence in the quality score.
pub const CONFIDENCE_WEIGHT: f64 = 0.3;

/// Section length (chars, summed over all sections) at which the length
/// component saturates.
pub const LENGTH_CEILING: usize = 6000;
/// Source count at which the source component saturates.
pub const SOURCE_CEILING: usize = 10;
/// Upper bound of the confidence scale.
pub const CONFIDENCE_CEILING: f64 = 10.0;

/// Fraction of required sections that are non-empty (after trimming),
/// clamped to [0, 1].
pub fn completeness_score(output: &ResearchOutput) -> f64 {
    let sections = output.sections();
    let filled = sections
        .iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .count();
    (filled as f64 / sections.len() as f64).clamp(0.0, 1.0)
}

/// Weighted quality score in [0, 1].
pub fn quality_score(output: &ResearchOutput) -> f64 {
    let total_chars: usize = output.sections().iter().map(|(_, text)| text.len()).sum();

    let length_norm = total_chars.min(LENGTH_CEILING) as f64 / LENGTH_CEILING as f64;
    let source_norm = output.sources.len().min(SOURCE_CEILING) as f64 / SOURCE_CEILING as f64;
    let confidence_norm = output.confidence_score.clamp(0.0, CONFIDENCE_CEILING) / CONFIDENCE_CEILING;

    let score = LENGTH_WEIGHT * length_norm
        + SOURCE_WEIGHT * source_norm
        + CONFIDENCE_WEIGHT * confidence_norm;

    score.clamp(0.0, 1.0)
}
