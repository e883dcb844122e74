//! Output budget estimation
//!
//! Sizes `max_tokens` for a generation request from a measured
//! tokens-per-record table, and shrinks the requested record count when the
//! estimate would exceed the model variant's output cap.

use std::collections::BTreeMap;

use super::ModelVariant;
use crate::config::BudgetConfig;

/// Record count at which the buffer ratio bottoms out
const BUFFER_FLOOR_AT: usize = 50;
const BUFFER_MAX: f64 = 1.5;
const BUFFER_MIN: f64 = 1.3;
const BUFFER_SPAN: f64 = 0.2;

/// Token budget constants for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBudget {
    pub max_context_tokens: usize,
    pub max_output_standard: usize,
    pub max_output_reasoner: usize,
    pub reasoning_buffer: usize,
    pub default_tokens_per_item: usize,
    pub shrink_factor: f64,
    pub tokens_per_item: BTreeMap<u32, usize>,
}

/// A sized request: how many records to ask for and the output cap to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPlan {
    pub needed: usize,
    pub max_tokens: usize,
    /// `needed` was reduced to fit the variant's output cap
    pub shrunk: bool,
}

impl TokenBudget {
    /// Tokens one record of `round_count` rounds is expected to cost
    pub fn tokens_per_item(&self, round_count: u32) -> usize {
        self.tokens_per_item
            .get(&round_count)
            .copied()
            .unwrap_or(self.default_tokens_per_item)
    }

    /// Hard output cap for a model variant
    pub fn output_cap(&self, variant: ModelVariant) -> usize {
        match variant {
            ModelVariant::Standard => self.max_output_standard,
            ModelVariant::Reasoner => self.max_output_reasoner,
        }
    }

    /// Safety margin: 1.5x for a single record falling linearly to 1.3x at
    /// fifty records and beyond.
    pub fn buffer_ratio(needed: usize) -> f64 {
        if needed >= BUFFER_FLOOR_AT {
            BUFFER_MIN
        } else {
            BUFFER_MAX - BUFFER_SPAN * (needed as f64 / BUFFER_FLOOR_AT as f64)
        }
    }

    /// Estimated output tokens for `needed` records. Not capped.
    pub fn estimate_output_budget(
        &self,
        round_count: u32,
        needed: usize,
        variant: ModelVariant,
    ) -> usize {
        let per_item = self.tokens_per_item(round_count) as f64;
        let base = (per_item * needed as f64 * Self::buffer_ratio(needed)) as usize;
        if variant.performs_reasoning() {
            base + self.reasoning_buffer
        } else {
            base
        }
    }

    /// Largest record count the cap can hold: `max(1, floor(cap / (tpi * factor)))`
    pub fn shrink_needed(&self, round_count: u32, variant: ModelVariant) -> usize {
        let per_item = self.tokens_per_item(round_count) as f64 * self.shrink_factor;
        if per_item <= 0.0 {
            return 1;
        }
        ((self.output_cap(variant) as f64 / per_item) as usize).max(1)
    }

    /// Size a request for `needed` records, shrinking when over the cap.
    /// The returned `max_tokens` never exceeds the cap.
    pub fn plan(&self, round_count: u32, needed: usize, variant: ModelVariant) -> OutputPlan {
        let cap = self.output_cap(variant);
        let estimate = self.estimate_output_budget(round_count, needed, variant);
        if estimate <= cap {
            return OutputPlan {
                needed,
                max_tokens: estimate,
                shrunk: false,
            };
        }
        let adjusted = self.shrink_needed(round_count, variant).min(needed.max(1));
        let estimate = self.estimate_output_budget(round_count, adjusted, variant);
        OutputPlan {
            needed: adjusted,
            max_tokens: estimate.min(cap),
            shrunk: adjusted < needed,
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::from(&BudgetConfig::default())
    }
}

impl From<&BudgetConfig> for TokenBudget {
    fn from(config: &BudgetConfig) -> Self {
        let tokens_per_item = config
            .tokens_per_item
            .iter()
            .filter_map(|(round, tokens)| round.trim().parse::<u32>().ok().map(|r| (r, *tokens)))
            .collect();
        Self {
            max_context_tokens: config.max_context_tokens,
            max_output_standard: config.max_output_standard,
            max_output_reasoner: config.max_output_reasoner,
            reasoning_buffer: config.reasoning_buffer,
            default_tokens_per_item: config.default_tokens_per_item,
            shrink_factor: config.shrink_factor,
            tokens_per_item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_budget(per_item: usize) -> TokenBudget {
        TokenBudget {
            tokens_per_item: BTreeMap::new(),
            default_tokens_per_item: per_item,
            ..TokenBudget::default()
        }
    }

    #[test]
    fn test_table_lookup_and_default() {
        let budget = TokenBudget::default();
        assert_eq!(budget.tokens_per_item(1), 365);
        assert_eq!(budget.tokens_per_item(4), 481);
        assert_eq!(budget.tokens_per_item(9), 1000);
    }

    #[test]
    fn test_buffer_ratio_endpoints() {
        assert!((TokenBudget::buffer_ratio(0) - 1.5).abs() < 1e-9);
        assert!((TokenBudget::buffer_ratio(25) - 1.4).abs() < 1e-9);
        assert!((TokenBudget::buffer_ratio(50) - 1.3).abs() < 1e-9);
        assert!((TokenBudget::buffer_ratio(500) - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_standard_and_reasoner() {
        let budget = flat_budget(1000);
        // 1000 * 50 * 1.3
        assert_eq!(
            budget.estimate_output_budget(3, 50, ModelVariant::Standard),
            65_000
        );
        assert_eq!(
            budget.estimate_output_budget(3, 50, ModelVariant::Reasoner),
            70_000
        );
        // 1000 * 10 * 1.46
        assert_eq!(
            budget.estimate_output_budget(3, 10, ModelVariant::Standard),
            14_600
        );
    }

    #[test]
    fn test_shrink_determinism() {
        let budget = TokenBudget {
            max_output_standard: 8_000,
            ..flat_budget(1000)
        };
        assert_eq!(budget.shrink_needed(2, ModelVariant::Standard), 6);
        let plan = budget.plan(2, 50, ModelVariant::Standard);
        assert_eq!(plan.needed, 6);
        assert!(plan.shrunk);
        assert_eq!(plan.max_tokens, 8_000);
        // same inputs, same answer
        assert_eq!(budget.plan(2, 50, ModelVariant::Standard), plan);
    }

    #[test]
    fn test_shrink_floor_is_one() {
        let budget = TokenBudget {
            max_output_standard: 500,
            ..flat_budget(1000)
        };
        let plan = budget.plan(1, 5, ModelVariant::Standard);
        assert_eq!(plan.needed, 1);
        assert_eq!(plan.max_tokens, 500);
    }

    #[test]
    fn test_plan_within_cap_is_untouched() {
        let budget = TokenBudget::default();
        let plan = budget.plan(3, 10, ModelVariant::Reasoner);
        assert!(!plan.shrunk);
        assert_eq!(plan.needed, 10);
        // 354 * 10 * 1.46 = 5168.4 -> 5168, plus 5000
        assert_eq!(plan.max_tokens, 10_168);
    }

    #[test]
    fn test_from_config_skips_bad_keys() {
        let mut config = BudgetConfig::default();
        config.tokens_per_item.insert("three".to_string(), 1);
        let budget = TokenBudget::from(&config);
        assert_eq!(budget.tokens_per_item.len(), 5);
    }
}
