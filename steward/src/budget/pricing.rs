//! Model pricing table.
//!
//! Costs are computed only when the provider does not report one. Prices
//! are dollars per million tokens; lookup is longest-prefix match so dated
//! model ids (`claude-sonnet-4-20250514`) resolve to their family entry.

/// Dollars per million input / output tokens for a model-id prefix.
#[derive(Debug, Clone, Copy)]
struct ModelPrice {
    prefix: &'static str,
    input_per_mtok: f64,
    output_per_mtok: f64,
}

const PRICES: &[ModelPrice] = &[
    ModelPrice { prefix: "claude-opus-4", input_per_mtok: 15.0, output_per_mtok: 75.0 },
    ModelPrice { prefix: "claude-sonnet-4", input_per_mtok: 3.0, output_per_mtok: 15.0 },
    ModelPrice { prefix: "claude-3-5-haiku", input_per_mtok: 0.80, output_per_mtok: 4.0 },
    ModelPrice { prefix: "claude-3-5-sonnet", input_per_mtok: 3.0, output_per_mtok: 15.0 },
    ModelPrice { prefix: "gpt-4o-mini", input_per_mtok: 0.15, output_per_mtok: 0.60 },
    ModelPrice { prefix: "gpt-4o", input_per_mtok: 2.50, output_per_mtok: 10.0 },
    ModelPrice { prefix: "gpt-4.1-mini", input_per_mtok: 0.40, output_per_mtok: 1.60 },
    ModelPrice { prefix: "gpt-4.1", input_per_mtok: 2.0, output_per_mtok: 8.0 },
    ModelPrice { prefix: "o3-mini", input_per_mtok: 1.10, output_per_mtok: 4.40 },
    ModelPrice { prefix: "o3", input_per_mtok: 2.0, output_per_mtok: 8.0 },
    ModelPrice { prefix: "gemini-2.5-pro", input_per_mtok: 1.25, output_per_mtok: 10.0 },
    ModelPrice { prefix: "gemini-2.5-flash", input_per_mtok: 0.30, output_per_mtok: 2.50 },
];

/// Compute the cost of a call, or `None` for an unknown model.
#[must_use]
pub fn cost_for(model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    let price = PRICES
        .iter()
        .filter(|p| model.starts_with(p.prefix))
        .max_by_key(|p| p.prefix.len())?;

    #[allow(clippy::cast_precision_loss)]
    let cost = (input_tokens as f64) * price.input_per_mtok / 1_000_000.0
        + (output_tokens as f64) * price.output_per_mtok / 1_000_000.0;
    Some(cost)
}
