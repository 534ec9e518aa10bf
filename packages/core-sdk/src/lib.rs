pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod cost;
pub mod db;
pub mod error;
pub mod export;
pub mod llm;
pub mod models;
pub mod pricing;
pub mod server;
pub mod telemetry;
pub mod validation;

/**
 * \brief Commonly used types, for `use sonarbench_core_sdk::prelude::*`.
 */
pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::config::AppConfig;
    pub use crate::coordinator::{RunCoordinator, RunState};
    pub use crate::cost::{compute_breakdown, CostBreakdown};
    pub use crate::error::{DispatchError, ValidationError};
    pub use crate::export::ExportDocument;
    pub use crate::llm::{Dispatcher, PerplexityDispatcher};
    pub use crate::models::{ModelId, ModelResult, ModelStatus, RunParameters, TokenUsage};
    pub use crate::pricing::{PricingSchedule, PricingTable};
}
