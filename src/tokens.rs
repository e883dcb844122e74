//! Token Estimation
//!
//! Heuristic token counting for budget decisions. Characters inside a dense
//! script range (CJK ideographs by default) cost more per character than the
//! rest. The weights are calibrated against one provider's tokenizer, so they
//! are configuration rather than constants.

use crate::config::EstimatorConfig;

/// Two-weight character-class token estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    dense_chars_per_token: f64,
    other_chars_per_token: f64,
    dense_start: u32,
    dense_end: u32,
}

impl TokenEstimator {
    pub fn new(
        dense_chars_per_token: f64,
        other_chars_per_token: f64,
        dense_start: u32,
        dense_end: u32,
    ) -> Self {
        Self {
            dense_chars_per_token,
            other_chars_per_token,
            dense_start,
            dense_end,
        }
    }

    /// Approximate token count of `text`, truncated toward zero.
    pub fn estimate(&self, text: &str) -> usize {
        let (dense, other) = text.chars().fold((0usize, 0usize), |(dense, other), c| {
            let cp = c as u32;
            if cp >= self.dense_start && cp <= self.dense_end {
                (dense + 1, other)
            } else {
                (dense, other + 1)
            }
        });
        (dense as f64 / self.dense_chars_per_token + other as f64 / self.other_chars_per_token)
            as usize
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::from(&EstimatorConfig::default())
    }
}

impl From<&EstimatorConfig> for TokenEstimator {
    fn from(config: &EstimatorConfig) -> Self {
        Self::new(
            config.dense_chars_per_token,
            config.other_chars_per_token,
            config.dense_range_start,
            config.dense_range_end,
        )
    }
}

/// Estimate with the default weights.
pub fn estimate(text: &str) -> usize {
    TokenEstimator::default().estimate(text)
}
