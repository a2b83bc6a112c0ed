//! Confidence for the keyword classifier.
//!
//! Three normalized signals in [0,1]:
//! - `source_score`   : source credibility
//! - `strength_score` : how many taxonomy keywords matched
//! - `margin_score`   : lead of the winning industry over the runner-up
//!
//! Confidence = weighted average, clamped to [0,1].

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Weights {
    pub w_source: f64,
    pub w_strength: f64,
    pub w_margin: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            w_source: 0.2,
            w_strength: 0.5,
            w_margin: 0.3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreInputs {
    pub source_score: f64,
    pub strength_score: f64,
    pub margin_score: f64,
}

impl ScoreInputs {
    /// Safe constructor with clamping.
    pub fn new(source: f64, strength: f64, margin: f64) -> Self {
        fn c(x: f64) -> f64 {
            if x.is_finite() {
                x.clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
        Self {
            source_score: c(source),
            strength_score: c(strength),
            margin_score: c(margin),
        }
    }
}

pub fn base_confidence(inputs: &ScoreInputs, w: &Weights) -> f64 {
    let raw = inputs.source_score * w.w_source
        + inputs.strength_score * w.w_strength
        + inputs.margin_score * w.w_margin;
    let denom = (w.w_source + w.w_strength + w.w_margin).max(1e-6);
    (raw / denom).clamp(0.0, 1.0)
}

/// Saturating keyword strength: 0 hits → 0, 4+ hits → 1.
pub fn strength_from_hits(hits: usize) -> f64 {
    (hits as f64 / 4.0).min(1.0)
}

/// Lead of `best` over `second`, relative to `best`.
pub fn margin(best: usize, second: usize) -> f64 {
    if best == 0 {
        0.0
    } else {
        best.saturating_sub(second) as f64 / best as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_average_is_clamped() {
        let w = Weights::default();
        assert_eq!(base_confidence(&ScoreInputs::new(1.0, 1.0, 1.0), &w), 1.0);
        assert_eq!(base_confidence(&ScoreInputs::new(-3.0, 0.0, f64::NAN), &w), 0.0);
        let mid = base_confidence(&ScoreInputs::new(0.5, 0.5, 0.5), &w);
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn margin_and_strength() {
        assert_eq!(margin(0, 0), 0.0);
        assert_eq!(margin(4, 1), 0.75);
        assert_eq!(strength_from_hits(2), 0.5);
        assert_eq!(strength_from_hits(9), 1.0);
    }
}
