use std::collections::HashMap;

use crate::models::ModelId;

/**
 * \brief Cost model of one model.
 *
 * `Flat` is the legacy shape: one price applied to prompt and completion
 * tokens combined, quoted per 1000 tokens. `Split` prices input, output and
 * optional reasoning tokens separately, quoted per token.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingSchedule {
    Flat {
        request_price: f64,
        price_per_thousand_tokens: f64,
    },
    Split {
        request_price: f64,
        input_token_price: f64,
        output_token_price: f64,
        reasoning_token_price: Option<f64>,
    },
}

impl PricingSchedule {
    pub fn flat(request_price: f64, price_per_thousand_tokens: f64) -> Self {
        PricingSchedule::Flat {
            request_price,
            price_per_thousand_tokens,
        }
    }

    pub fn split(request_price: f64, input_token_price: f64, output_token_price: f64) -> Self {
        PricingSchedule::Split {
            request_price,
            input_token_price,
            output_token_price,
            reasoning_token_price: None,
        }
    }

    pub fn with_reasoning(self, price: f64) -> Self {
        match self {
            PricingSchedule::Split {
                request_price,
                input_token_price,
                output_token_price,
                ..
            } => PricingSchedule::Split {
                request_price,
                input_token_price,
                output_token_price,
                reasoning_token_price: Some(price),
            },
            flat => flat,
        }
    }

    /**
     * \brief Human-readable token price, e.g. `$0.003/1k in • $0.015/1k out`.
     */
    pub fn describe(&self) -> String {
        match *self {
            PricingSchedule::Flat {
                price_per_thousand_tokens,
                ..
            } => format!("${}/1k tokens", trim_price(price_per_thousand_tokens)),
            PricingSchedule::Split {
                input_token_price,
                output_token_price,
                ..
            } => {
                let input = trim_price(input_token_price * 1000.0);
                let output = trim_price(output_token_price * 1000.0);
                if input == output {
                    format!("${}/1k tokens", input)
                } else {
                    format!("${}/1k in • ${}/1k out", input, output)
                }
            }
        }
    }
}

fn trim_price(value: f64) -> String {
    let s = format!("{:.6}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/**
 * \brief Static mapping from model identifier to its pricing schedule.
 */
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    schedules: HashMap<ModelId, PricingSchedule>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, schedule: PricingSchedule) -> Self {
        self.schedules.insert(ModelId::new(id), schedule);
        self
    }

    /**
     * \brief Published Perplexity prices for the default catalog.
     */
    pub fn perplexity_default() -> Self {
        Self::new()
            .with(
                "sonar-pro",
                PricingSchedule::split(0.005, 0.000003, 0.000015),
            )
            .with("sonar", PricingSchedule::split(0.005, 0.000001, 0.000001))
            .with(
                "llama-3.1-sonar-small-128k-online",
                PricingSchedule::flat(0.005, 0.0002),
            )
            .with(
                "llama-3.1-sonar-large-128k-online",
                PricingSchedule::flat(0.005, 0.001),
            )
            .with(
                "llama-3.1-sonar-huge-128k-online",
                PricingSchedule::flat(0.005, 0.005),
            )
    }

    pub fn lookup(&self, id: &ModelId) -> Option<&PricingSchedule> {
        self.schedules.get(id)
    }

    pub fn describe(&self, id: &ModelId) -> String {
        self.lookup(id)
            .map(PricingSchedule::describe)
            .unwrap_or_else(|| "--".to_string())
    }
}
