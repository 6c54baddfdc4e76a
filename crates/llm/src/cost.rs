//! Token-based cost accounting per model.

/// USD per 1M tokens: (input, output). Unknown models fall back to the flash
/// tier so cost tracking degrades gracefully rather than panicking mid-run.
fn price_per_million(model: &str) -> (f64, f64) {
    if model.contains("2.5-pro") {
        (1.25, 10.0)
    } else if model.contains("2.0-flash") {
        (0.10, 0.40)
    } else {
        // gemini-2.5-flash and friends
        (0.30, 2.50)
    }
}

pub fn cost_usd(model: &str, prompt_tokens: u64, output_tokens: u64) -> f64 {
    let (input, output) = price_per_million(model);
    (prompt_tokens as f64 * input + output_tokens as f64 * output) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_pricing() {
        let c = cost_usd("gemini-2.5-flash", 1_000_000, 1_000_000);
        assert!((c - 2.80).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_flash_tier() {
        assert_eq!(
            cost_usd("gemini-9.9-mystery", 1000, 1000),
            cost_usd("gemini-2.5-flash", 1000, 1000)
        );
    }
}
