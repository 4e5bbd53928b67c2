//! Token cost estimation.
//!
//! USD prices per 1K tokens, keyed by model prefix so dated model
//! variants inherit the base price. Unknown models fall back to a
//! conservative default; the static and crisis responders cost nothing.

use crate::message::TokenUsage;

/// (model prefix, prompt $/1K, completion $/1K)
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000_15, 0.000_60),
    ("gpt-4o", 0.002_50, 0.010_00),
    ("gpt-4-turbo", 0.010_00, 0.030_00),
    ("llama-3.3-70b", 0.000_59, 0.000_79),
    ("llama-3.1-8b", 0.000_05, 0.000_08),
    ("mixtral", 0.000_24, 0.000_24),
];

/// Default prices for unknown models.
const DEFAULT_PROMPT_PRICE: f64 = 0.001;
const DEFAULT_COMPLETION_PRICE: f64 = 0.002;

/// Estimate the USD cost of one completion.
///
/// Responses without usage data (static fallback, crisis) cost zero.
#[must_use]
pub fn estimate_cost(model: &str, usage: Option<&TokenUsage>) -> f64 {
    let Some(usage) = usage else {
        return 0.0;
    };

    let (prompt_price, completion_price) = PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, p, c)| (*p, *c))
        .unwrap_or((DEFAULT_PROMPT_PRICE, DEFAULT_COMPLETION_PRICE));

    (f64::from(usage.prompt_tokens) / 1000.0) * prompt_price
        + (f64::from(usage.completion_tokens) / 1000.0) * completion_price
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn test_known_model() {
        let cost = estimate_cost("gpt-4o-mini", Some(&usage(1000, 1000)));
        assert!((cost - 0.000_75).abs() < 1e-9);
    }

    #[test]
    fn test_dated_variant_matches_prefix() {
        let base = estimate_cost("gpt-4o", Some(&usage(1000, 0)));
        let dated = estimate_cost("gpt-4o-2024-08-06", Some(&usage(1000, 0)));
        assert_eq!(base, dated);
    }

    #[test]
    fn test_mini_not_shadowed_by_base_prefix() {
        // "gpt-4o-mini" must match its own row, not "gpt-4o"
        let cost = estimate_cost("gpt-4o-mini", Some(&usage(1000, 0)));
        assert!((cost - 0.000_15).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let cost = estimate_cost("mystery-model", Some(&usage(1000, 1000)));
        assert!((cost - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_no_usage_costs_nothing() {
        assert_eq!(estimate_cost("gpt-4o", None), 0.0);
    }
}
