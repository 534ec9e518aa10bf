use serde::Serialize;

use crate::models::TokenUsage;
use crate::pricing::PricingSchedule;

/** \brief Rendered in every field when no schedule is known for a model. */
pub const UNAVAILABLE: &str = "--";

/**
 * \brief Full-precision cost components, before formatting.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostAmounts {
    pub request_cost: f64,
    pub token_cost: f64,
}

impl CostAmounts {
    pub fn total(&self) -> f64 {
        self.request_cost + self.token_cost
    }
}

/**
 * \brief Currency-formatted cost of one result. Always recomputed, never stored.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub request_cost: String,
    pub token_cost: String,
    pub total: String,
}

impl CostBreakdown {
    pub fn unavailable() -> Self {
        Self {
            request_cost: UNAVAILABLE.to_string(),
            token_cost: UNAVAILABLE.to_string(),
            total: UNAVAILABLE.to_string(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.total != UNAVAILABLE
    }
}

pub fn compute_amounts(schedule: &PricingSchedule, tokens: &TokenUsage) -> CostAmounts {
    let prompt = tokens.prompt as f64;
    let completion = tokens.completion as f64;
    match *schedule {
        PricingSchedule::Flat {
            request_price,
            price_per_thousand_tokens,
        } => CostAmounts {
            request_cost: request_price,
            token_cost: (prompt + completion) * price_per_thousand_tokens / 1000.0,
        },
        PricingSchedule::Split {
            request_price,
            input_token_price,
            output_token_price,
            reasoning_token_price,
        } => {
            let input_cost = prompt * input_token_price;
            let output_cost = completion * output_token_price;
            let reasoning_cost = reasoning_token_price
                .map(|price| completion * price)
                .unwrap_or(0.0);
            CostAmounts {
                request_cost: request_price,
                token_cost: input_cost + output_cost + reasoning_cost,
            }
        }
    }
}

/**
 * \brief Cost breakdown for one result; a missing schedule yields `--` everywhere.
 *
 * Request cost is rendered with 3 decimals, token cost and total with 6.
 */
pub fn compute_breakdown(schedule: Option<&PricingSchedule>, tokens: &TokenUsage) -> CostBreakdown {
    let Some(schedule) = schedule else {
        return CostBreakdown::unavailable();
    };
    let amounts = compute_amounts(schedule, tokens);
    CostBreakdown {
        request_cost: format!("${:.3}", amounts.request_cost),
        token_cost: format!("${:.6}", amounts.token_cost),
        total: format!("${:.6}", amounts.total()),
    }
}
