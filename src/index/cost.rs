//! Embedding cost estimate and the confirmation gate in front of it.

use std::io::{self, BufRead, Write};

use tracing::{info, warn};

use crate::tokens::{TokenCounter, total_tokens};
use crate::types::Document;
use crate::vector::{EmbeddingBackend, ModelSpec};

/// Price per input token of hosted embedding models, in dollars.
const OPENAI_PRICES: &[(&str, f64)] = &[
    ("text-embedding-3-small", 2e-8),
    ("text-embedding-3-large", 1.3e-7),
    ("text-embedding-ada-002", 1e-7),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub tokens: usize,
    pub price_per_token: f64,
    pub dollars: f64,
}

impl CostEstimate {
    pub fn display(&self) -> String {
        format!(
            "Total cost to embed {} tokens is ${:.6}",
            self.tokens, self.dollars
        )
    }
}

/// Token count of `docs` times the per-token price.
pub fn estimate_cost(docs: &[Document], counter: &dyn TokenCounter, price_per_token: f64) -> CostEstimate {
    let tokens = total_tokens(counter, docs.iter().map(|d| d.page_content.as_str()));
    CostEstimate {
        tokens,
        price_per_token,
        dollars: tokens as f64 * price_per_token,
    }
}

/// Resolves the per-token price of `model` (a `backend/model` string).
///
/// Local backends and private mode are free; an explicit override wins over
/// the built-in table; unknown hosted models are assumed free with a warning.
pub fn price_per_token(model: &str, private: bool, override_price: Option<f64>) -> f64 {
    if let Some(price) = override_price {
        return price;
    }
    let spec = match ModelSpec::parse(model) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(target: "ragshard::index", "Cannot price model '{model}': {e}");
            return 0.0;
        }
    };
    if spec.backend.is_local() {
        info!(target: "ragshard::index", "Local embedding model detected, setting the price to 0");
        return 0.0;
    }
    if private {
        info!(target: "ragshard::index", "Not checking token price because private is set");
        return 0.0;
    }

    match spec.backend {
        EmbeddingBackend::OpenAi => OPENAI_PRICES
            .iter()
            .find(|(name, _)| *name == spec.model)
            .map(|(_, price)| *price)
            .unwrap_or_else(|| {
                warn!(
                    target: "ragshard::index",
                    "Couldn't find the price of embedding model {model}. Assuming the cost is zero"
                );
                0.0
            }),
        EmbeddingBackend::FastEmbed | EmbeddingBackend::Ollama => 0.0,
    }
}

/// Asks whether an over-limit embedding cost may be paid.
pub trait Confirmation: Send + Sync {
    fn confirm(&self, estimate: &CostEstimate) -> bool;
}

/// Interactive prompt on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirmation;

impl StdinConfirmation {
    fn accepts(answer: &str) -> bool {
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

impl Confirmation for StdinConfirmation {
    fn confirm(&self, estimate: &CostEstimate) -> bool {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{}", estimate.display());
        let _ = write!(stdout, "Do you confirm you are okay to pay this? (y/n)\n>");
        let _ = stdout.flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => Self::accepts(&answer),
            Err(e) => {
                warn!(target: "ragshard::index", "Could not read confirmation: {e}");
                false
            }
        }
    }
}

/// Accepts every cost, for non-interactive runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl Confirmation for AlwaysConfirm {
    fn confirm(&self, _estimate: &CostEstimate) -> bool {
        true
    }
}

/// Declines every cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverConfirm;

impl Confirmation for NeverConfirm {
    fn confirm(&self, _estimate: &CostEstimate) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;

    #[test]
    fn test_local_and_private_are_free() {
        assert_eq!(price_per_token("fastembed/AllMiniLML6V2", false, None), 0.0);
        assert_eq!(price_per_token("ollama/nomic-embed-text", false, None), 0.0);
        assert_eq!(price_per_token("openai/text-embedding-3-large", true, None), 0.0);
    }

    #[test]
    fn test_hosted_prices() {
        assert_eq!(price_per_token("openai/text-embedding-3-small", false, None), 2e-8);
        assert_eq!(price_per_token("openai/some-future-model", false, None), 0.0);
        assert_eq!(price_per_token("openai/text-embedding-3-small", false, Some(1e-3)), 1e-3);
        assert_eq!(price_per_token("fastembed/AllMiniLML6V2", false, Some(0.5)), 0.5);
    }

    #[test]
    fn test_estimate_cost() {
        let docs = vec![Document::new("x".repeat(400)), Document::new("y".repeat(400))];
        let estimate = estimate_cost(&docs, &HeuristicTokenCounter, 0.5);

        assert_eq!(estimate.tokens, 200);
        assert_eq!(estimate.dollars, 100.0);
        assert!(estimate.display().contains("$100.000000"));
    }

    #[test]
    fn test_confirmation_answers() {
        assert!(StdinConfirmation::accepts("y\n"));
        assert!(StdinConfirmation::accepts(" YES "));
        assert!(!StdinConfirmation::accepts("no"));
        assert!(!StdinConfirmation::accepts(""));

        let estimate = CostEstimate {
            tokens: 1,
            price_per_token: 1.0,
            dollars: 1.0,
        };
        assert!(AlwaysConfirm.confirm(&estimate));
        assert!(!NeverConfirm.confirm(&estimate));
    }
}
