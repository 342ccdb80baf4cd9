/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const INPUT_SHARE: f64 = 0.8;

const PRICES: &[(&str, ModelPrice)] = &[
    (
        "gemini-2.0-flash-lite",
        ModelPrice {
            input_per_million: 0.075,
            output_per_million: 0.30,
        },
    ),
    (
        "gemini-2.0-flash",
        ModelPrice {
            input_per_million: 0.10,
            output_per_million: 0.40,
        },
    ),
    (
        "gemini-1.5-flash",
        ModelPrice {
            input_per_million: 0.075,
            output_per_million: 0.30,
        },
    ),
    (
        "gemini-1.5-pro",
        ModelPrice {
            input_per_million: 1.25,
            output_per_million: 5.00,
        },
    ),
    (
        "gemini-2.5-pro",
        ModelPrice {
            input_per_million: 1.25,
            output_per_million: 10.00,
        },
    ),
];

const FREE: ModelPrice = ModelPrice {
    input_per_million: 0.0,
    output_per_million: 0.0,
};

/// Longest matching model-name prefix wins; local and mock models are free.
pub fn price_for(model: &str) -> ModelPrice {
    PRICES
        .iter()
        .filter(|(name, _)| model.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, price)| *price)
        .unwrap_or(FREE)
}

/// Cost of a known token split.
pub fn response_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let price = price_for(model);
    (input_tokens as f64 * price.input_per_million
        + output_tokens as f64 * price.output_per_million)
        / 1_000_000.0
}

/// Cost of a token total, assuming 80% input and 20% output.
pub fn estimate_cost(model: &str, total_tokens: u64) -> f64 {
    let price = price_for(model);
    let total = total_tokens as f64;
    (total * INPUT_SHARE * price.input_per_million
        + total * (1.0 - INPUT_SHARE) * price.output_per_million)
        / 1_000_000.0
}

/// Rough count for providers that report no usage: four characters a token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_selects_the_price() {
        assert_eq!(price_for("gemini-2.0-flash-lite-001").input_per_million, 0.075);
        assert_eq!(price_for("gemini-2.0-flash-001").input_per_million, 0.10);
        assert_eq!(price_for("qwen2.5-coder:7b"), FREE);
    }

    #[test]
    fn estimate_uses_eighty_twenty_split() {
        let cost = estimate_cost("gemini-2.0-flash", 1_000_000);
        assert!((cost - (0.8 * 0.10 + 0.2 * 0.40)).abs() < 1e-9);
        assert_eq!(estimate_cost("mock", 1_000_000), 0.0);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
