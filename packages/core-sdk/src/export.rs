use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Serialize;
use time::{macros::format_description, OffsetDateTime};

use crate::coordinator::RunState;
use crate::cost::{compute_breakdown, CostBreakdown};
use crate::models::ModelResult;
use crate::pricing::PricingTable;

const FILE_PREFIX: &str = "perplexity-comparison";

/**
 * \brief One exported result: the raw fields plus a freshly computed cost.
 */
#[derive(Debug, Clone, Serialize)]
pub struct ExportedResponse {
    #[serde(flatten)]
    pub result: ModelResult,
    pub costs: CostBreakdown,
}

/**
 * \brief Self-contained snapshot of a run.
 *
 * Only settled-successful models appear in `responses`; loading and failed
 * models are left out rather than written as nulls.
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timestamp: String,
    pub responses: Vec<ExportedResponse>,
}

impl ExportDocument {
    /**
     * \brief Builds the document for `state`, stamped with `at`.
     */
    pub fn build(state: &RunState, pricing: &PricingTable, at: OffsetDateTime) -> Result<Self> {
        let settings = state
            .settings()
            .ok_or_else(|| anyhow!("no run to export"))?;
        let responses = state
            .results()
            .into_iter()
            .map(|result| ExportedResponse {
                costs: compute_breakdown(pricing.lookup(&result.model_id), &result.token_usage),
                result: result.clone(),
            })
            .collect();
        Ok(Self {
            prompt: settings.prompt.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            timestamp: iso_timestamp(at)?,
            responses,
        })
    }

    pub fn now(state: &RunState, pricing: &PricingTable) -> Result<Self> {
        Self::build(state, pricing, OffsetDateTime::now_utc())
    }

    /** \brief Pretty-printed UTF-8 JSON. */
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /**
     * \brief On-disk name. `:` in the timestamp becomes `-` so the name is valid on every platform.
     */
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", FILE_PREFIX, self.timestamp.replace(':', "-"))
    }

    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.to_bytes()?)?;
        Ok(path)
    }
}

/**
 * \brief UTC ISO-8601 with millisecond precision, e.g. `2024-05-01T09:30:00.250Z`.
 */
pub fn iso_timestamp(at: OffsetDateTime) -> Result<String> {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    Ok(at.to_offset(time::UtcOffset::UTC).format(format)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogEntry};
    use crate::coordinator::RunCoordinator;
    use crate::error::DispatchError;
    use crate::llm::Dispatcher;
    use crate::models::{ModelId, RunParameters, RunSettings, TokenUsage};
    use crate::pricing::PricingSchedule;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use time::macros::datetime;

    /// Settles each model after a model-specific delay; `fail` models error out.
    struct ScriptedDispatcher {
        delays_ms: Vec<(&'static str, u64)>,
        fail: &'static str,
    }

    #[async_trait]
    impl Dispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            model: &ModelId,
            _settings: &RunSettings,
            _credential: &str,
        ) -> Result<ModelResult, DispatchError> {
            let delay = self
                .delays_ms
                .iter()
                .find(|(id, _)| *id == model.as_str())
                .map(|(_, d)| *d)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if model.as_str() == self.fail {
                return Err(DispatchError::Malformed("bad body".into()));
            }
            Ok(ModelResult {
                model_id: model.clone(),
                response_text: format!("answer from {}", model),
                elapsed_millis: delay,
                token_usage: TokenUsage {
                    completion: 200,
                    prompt: 1000,
                    total: 1200,
                },
                citations: vec!["https://example.com".into()],
            })
        }
    }

    fn pricing() -> PricingTable {
        PricingTable::new()
            .with("one", PricingSchedule::split(0.01, 0.000003, 0.000015))
            .with("three", PricingSchedule::flat(0.005, 0.0002))
    }

    async fn settled_run() -> RunState {
        let catalog = Catalog::new(vec![
            CatalogEntry::new("one", "1k"),
            CatalogEntry::new("two", "1k"),
            CatalogEntry::new("three", "1k"),
        ]);
        // "three" settles first, "one" last: arrival order is reversed.
        let dispatcher = Arc::new(ScriptedDispatcher {
            delays_ms: vec![("one", 60), ("two", 30), ("three", 0)],
            fail: "two",
        });
        let coordinator = RunCoordinator::new(dispatcher, catalog);
        let mut params = RunParameters::new("Compare these", format!("pplx-{}", "x".repeat(48)));
        params.temperature = 0.2;
        params.max_tokens = 256;
        coordinator.start(params).expect("valid params");
        coordinator.wait_settled().await
    }

    #[test]
    fn test_iso_timestamp_format() {
        let at = datetime!(2024-05-01 09:30:00.25 UTC);
        assert_eq!(iso_timestamp(at).unwrap(), "2024-05-01T09:30:00.250Z");
    }

    #[tokio::test]
    async fn test_export_contains_only_completed_models_in_catalog_order() {
        let state = settled_run().await;
        let at = datetime!(2024-05-01 09:30:00 UTC);
        let doc = ExportDocument::build(&state, &pricing(), at).unwrap();

        assert_eq!(doc.prompt, "Compare these");
        assert_eq!(doc.temperature, 0.2);
        assert_eq!(doc.max_tokens, 256);
        assert_eq!(doc.timestamp, "2024-05-01T09:30:00.000Z");
        assert_eq!(
            doc.file_name(),
            "perplexity-comparison-2024-05-01T09-30-00.000Z.json"
        );

        let ids: Vec<&str> = doc
            .responses
            .iter()
            .map(|r| r.result.model_id.as_str())
            .collect();
        assert_eq!(ids, vec!["one", "three"]);

        for response in &doc.responses {
            let direct = compute_breakdown(
                pricing().lookup(&response.result.model_id),
                &response.result.token_usage,
            );
            assert_eq!(response.costs, direct);
        }
        assert_eq!(doc.responses[0].costs.total, "$0.016000");
    }

    #[tokio::test]
    async fn test_export_json_shape() {
        let state = settled_run().await;
        let doc = ExportDocument::build(&state, &pricing(), datetime!(2024-01-02 03:04:05 UTC))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&doc.to_bytes().unwrap()).unwrap();

        assert_eq!(value["maxTokens"], 256);
        let first = &value["responses"][0];
        assert_eq!(first["modelId"], "one");
        assert_eq!(first["response"], "answer from one");
        assert_eq!(first["responseTime"], 60);
        assert_eq!(first["tokens"]["prompt"], 1000);
        assert_eq!(first["citations"][0], "https://example.com");
        assert_eq!(first["costs"]["requestCost"], "$0.010");
        assert_eq!(first["costs"]["tokenCost"], "$0.006000");
        assert_eq!(value["responses"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_export_reports_unpriced_models_as_unavailable() {
        let state = settled_run().await;
        let doc = ExportDocument::build(&state, &PricingTable::new(), OffsetDateTime::now_utc())
            .unwrap();
        assert!(doc.responses.iter().all(|r| !r.costs.is_available()));
    }

    #[tokio::test]
    async fn test_write_to_dir() {
        let state = settled_run().await;
        let doc = ExportDocument::now(&state, &pricing()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = doc.write_to_dir(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("perplexity-comparison-"));
        assert!(!name.contains(':'));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, doc.to_bytes().unwrap());
    }

    #[test]
    fn test_export_requires_a_run() {
        let coordinator = RunCoordinator::new(
            Arc::new(ScriptedDispatcher {
                delays_ms: vec![],
                fail: "",
            }),
            Catalog::perplexity_default(),
        );
        let err = ExportDocument::now(&coordinator.snapshot(), &pricing()).unwrap_err();
        assert_eq!(err.to_string(), "no run to export");
    }
}
