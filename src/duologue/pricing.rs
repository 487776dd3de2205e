//! Model pricing and per-turn cost calculation.
//!
//! A static price table maps model identifiers to USD prices per million
//! tokens. [`calculate_cost`] is a pure function of (model, token usage); an
//! unrecognized model falls back to the designated default entry rather than
//! failing, so cost accounting never aborts a turn.

use crate::client_wrapper::TokenUsage;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Input/output price for one model, in USD per one million tokens.
#[derive(Clone, Copy, Debug)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// Price-table entry used when a model identifier is not recognized.
pub const DEFAULT_PRICING_MODEL: &str = "grok-4-fast-reasoning-latest";

lazy_static! {
    /// Static price table (per 1M tokens).
    pub static ref MODEL_PRICING: HashMap<&'static str, ModelPricing> = {
        let mut m = HashMap::new();
        // xAI Grok
        m.insert("grok-4-fast-reasoning-latest", ModelPricing { input: 2.0, output: 10.0 });
        m.insert("grok-4-fast-reasoning", ModelPricing { input: 2.0, output: 10.0 });
        m.insert("grok-4-fast-non-reasoning-latest", ModelPricing { input: 1.0, output: 5.0 });
        m.insert("grok-4-fast-non-reasoning", ModelPricing { input: 1.0, output: 5.0 });
        m.insert("grok-code-fast-1", ModelPricing { input: 3.0, output: 15.0 });
        m.insert("grok-2-vision-latest", ModelPricing { input: 2.0, output: 10.0 });
        m.insert("grok-2-image-latest", ModelPricing { input: 5.0, output: 20.0 });
        // Anthropic Claude
        m.insert("claude-3-opus-20240229", ModelPricing { input: 15.0, output: 75.0 });
        m.insert("claude-3-sonnet-20240229", ModelPricing { input: 3.0, output: 15.0 });
        m.insert("claude-3-haiku-20240307", ModelPricing { input: 0.25, output: 1.25 });
        m
    };
}

/// Calculate the cost of a turn from its model and token usage.
///
/// Cost = `prompt/1M * input_price + completion/1M * output_price`, rounded to
/// six decimal places. Unknown models log a warning and are priced as
/// [`DEFAULT_PRICING_MODEL`].
pub fn calculate_cost(model: &str, tokens: &TokenUsage) -> f64 {
    let pricing = match MODEL_PRICING.get(model) {
        Some(pricing) => *pricing,
        None => {
            log::warn!(
                "Model {} not in pricing table, using default ({})",
                model,
                DEFAULT_PRICING_MODEL
            );
            MODEL_PRICING[DEFAULT_PRICING_MODEL]
        }
    };

    let input_cost = (tokens.prompt as f64 / 1_000_000.0) * pricing.input;
    let output_cost = (tokens.completion as f64 / 1_000_000.0) * pricing.output;

    round_to_micros(input_cost + output_cost)
}

fn round_to_micros(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_table_prices() {
        let tokens = TokenUsage::new(1_000_000, 1_000_000);
        let cost = calculate_cost("claude-3-sonnet-20240229", &tokens);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn cost_is_linear_in_tokens() {
        let tokens = TokenUsage::new(1_000, 500);
        let cost = calculate_cost("grok-4-fast-reasoning-latest", &tokens);
        // 1000/1M * 2.0 + 500/1M * 10.0
        assert!((cost - 0.007).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let tokens = TokenUsage::new(1_000, 500);
        let unknown = calculate_cost("some-unknown-model", &tokens);
        let default = calculate_cost(DEFAULT_PRICING_MODEL, &tokens);
        assert_eq!(unknown, default);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(calculate_cost("claude-3-opus-20240229", &TokenUsage::zero()), 0.0);
    }

    #[test]
    fn rounding_is_stable_at_six_decimals() {
        let tokens = TokenUsage::new(1, 1);
        // 1/1M * 0.25 + 1/1M * 1.25 = 0.0000015 -> rounds to 0.000002
        assert_eq!(calculate_cost("claude-3-haiku-20240307", &tokens), 0.000002);
    }
}
