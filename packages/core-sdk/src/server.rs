use std::{convert::Infallible, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;
use tower_http::services::ServeDir;

use crate::{
    catalog::Catalog,
    config::AppConfig,
    coordinator::{RunCoordinator, RunState},
    cost::{compute_breakdown, CostBreakdown},
    db::{self, SqliteStore},
    export::ExportDocument,
    llm::PerplexityDispatcher,
    models::{
        format_elapsed, ModelId, ModelResult, ModelStatus, RunParameters, RunSettings,
        DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
    },
    pricing::PricingTable,
    telemetry,
};

type ApiError = (StatusCode, String);

/**
 * \brief Shared handler state: one coordinator per server process.
 */
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<RunCoordinator>,
    pricing: Arc<PricingTable>,
    db_path: PathBuf,
    has_env_key: bool,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>, pricing: PricingTable, db_path: PathBuf) -> Self {
        Self {
            coordinator,
            pricing: Arc::new(pricing),
            db_path,
            has_env_key: false,
        }
    }

    pub fn with_env_key(mut self, present: bool) -> Self {
        self.has_env_key = present;
        self
    }

    fn store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }
}

/**
 * \brief Starts the local HTTP API plus the static UI, e.g. on "127.0.0.1:5173".
 */
pub async fn run(addr: &str, config: &AppConfig) -> Result<()> {
    let dispatcher = Arc::new(PerplexityDispatcher::new(&config.api_base)?);
    let coordinator = RunCoordinator::new(dispatcher, Catalog::perplexity_default())
        .with_fallback_credential(config.fallback_api_key.clone())
        .with_dispatch_timeout(config.dispatch_timeout);
    let state = AppState::new(
        Arc::new(coordinator),
        PricingTable::perplexity_default(),
        config.db_path.clone(),
    )
    .with_env_key(config.fallback_api_key.is_some());

    let static_service =
        get_service(ServeDir::new(&config.ui_dir).append_index_html_on_directories(true));
    let app = router(state).fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening addr={}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/models", get(list_models))
        .route(
            "/api/credential",
            get(get_credential).put(put_credential).delete(delete_credential),
        )
        .route("/api/runs", post(start_run))
        .route("/api/runs/current", get(current_run))
        .route("/api/runs/current/export", get(export_run))
        .route("/api/runs/events", get(run_events))
        .with_state(state)
}

#[derive(Serialize, Debug)]
struct ModelInfoDto {
    id: ModelId,
    cost: String,
    context: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CredentialStateDto {
    has_key: bool,
    masked: Option<String>,
    env_fallback: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialInput {
    api_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRunRequest {
    prompt: String,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    /** \brief Overrides the stored credential for this run. */
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StatusDto {
    model_id: ModelId,
    #[serde(flatten)]
    status: ModelStatus,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResultDto {
    #[serde(flatten)]
    result: ModelResult,
    elapsed: String,
    costs: CostBreakdown,
}

/**
 * \brief Presentation view of a RunState: everything in catalog order, costs attached.
 */
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RunView {
    run_id: u64,
    settings: Option<RunSettings>,
    headline_error: Option<String>,
    settled: bool,
    statuses: Vec<StatusDto>,
    results: Vec<ResultDto>,
}

impl RunView {
    fn build(state: &RunState, pricing: &PricingTable) -> Self {
        Self {
            run_id: state.run_id(),
            settings: state.settings().cloned(),
            headline_error: state.headline_error().map(str::to_string),
            settled: state.is_settled(),
            statuses: state
                .statuses()
                .into_iter()
                .map(|(id, status)| StatusDto {
                    model_id: id.clone(),
                    status: status.clone(),
                })
                .collect(),
            results: state
                .results()
                .into_iter()
                .map(|r| ResultDto {
                    elapsed: format_elapsed(r.elapsed_millis),
                    costs: compute_breakdown(pricing.lookup(&r.model_id), &r.token_usage),
                    result: r.clone(),
                })
                .collect(),
        }
    }
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let catalog = state.coordinator.catalog();
    let models: Vec<ModelInfoDto> = catalog
        .ids()
        .map(|id| ModelInfoDto {
            id: id.clone(),
            cost: state.pricing.describe(id),
            context: catalog.context_window(id).to_string(),
        })
        .collect();
    Json(serde_json::json!({ "models": models }))
}

fn credential_state(state: &AppState) -> Result<CredentialStateDto> {
    let store = state.store()?;
    let stored = db::stored_credential(&store)?;
    Ok(CredentialStateDto {
        has_key: stored.is_some(),
        masked: stored.as_deref().map(db::mask_credential),
        env_fallback: state.has_env_key,
    })
}

async fn get_credential(
    State(state): State<AppState>,
) -> Result<Json<CredentialStateDto>, ApiError> {
    Ok(Json(credential_state(&state).map_err(internal_err)?))
}

async fn put_credential(
    State(state): State<AppState>,
    Json(input): Json<CredentialInput>,
) -> Result<Json<CredentialStateDto>, ApiError> {
    let store = state.store().map_err(internal_err)?;
    db::remember_credential(&store, &input.api_key).map_err(internal_err)?;
    telemetry::log_event("server.credential", "updated");
    Ok(Json(credential_state(&state).map_err(internal_err)?))
}

async fn delete_credential(
    State(state): State<AppState>,
) -> Result<Json<CredentialStateDto>, ApiError> {
    let store = state.store().map_err(internal_err)?;
    db::remember_credential(&store, "").map_err(internal_err)?;
    telemetry::log_event("server.credential", "cleared");
    Ok(Json(credential_state(&state).map_err(internal_err)?))
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let credential = match req.api_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => key,
        None => {
            let store = state.store().map_err(internal_err)?;
            db::stored_credential(&store)
                .map_err(internal_err)?
                .unwrap_or_default()
        }
    };
    let params = RunParameters {
        prompt: req.prompt,
        temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        credential,
    };
    let run_id = state
        .coordinator
        .start(params)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "runId": run_id })),
    ))
}

async fn current_run(State(state): State<AppState>) -> Json<RunView> {
    let snapshot = state.coordinator.snapshot();
    Json(RunView::build(&snapshot, &state.pricing))
}

async fn export_run(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.coordinator.snapshot();
    let doc = ExportDocument::now(&snapshot, &state.pricing)
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    let bytes = doc.to_bytes().map_err(internal_err)?;
    let disposition = format!("attachment; filename=\"{}\"", doc.file_name());
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/**
 * \brief SSE stream with one `state` event per published run state.
 */
async fn run_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let pricing = state.pricing.clone();
    let stream = WatchStream::new(state.coordinator.subscribe()).map(move |run| {
        let view = RunView::build(&run, &pricing);
        let data = serde_json::to_string(&view).unwrap_or_else(|e| {
            serde_json::json!({ "error": e.to_string() }).to_string()
        });
        Ok(Event::default().event("state").data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::error::DispatchError;
    use crate::llm::Dispatcher;
    use crate::models::TokenUsage;
    use async_trait::async_trait;
    use serde_json::Value;

    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            model: &ModelId,
            settings: &RunSettings,
            _credential: &str,
        ) -> Result<ModelResult, DispatchError> {
            if model.as_str() == "broken" {
                return Err(DispatchError::Malformed("no choices".into()));
            }
            Ok(ModelResult {
                model_id: model.clone(),
                response_text: settings.prompt.to_uppercase(),
                elapsed_millis: 1500,
                token_usage: TokenUsage {
                    completion: 10,
                    prompt: 20,
                    total: 30,
                },
                citations: vec![],
            })
        }
    }

    async fn spawn_app(dir: &tempfile::TempDir) -> (String, Arc<RunCoordinator>) {
        let catalog = Catalog::new(vec![
            CatalogEntry::new("sonar", "127k"),
            CatalogEntry::new("broken", "1k"),
        ]);
        let coordinator = Arc::new(RunCoordinator::new(Arc::new(EchoDispatcher), catalog));
        let state = AppState::new(
            coordinator.clone(),
            PricingTable::perplexity_default(),
            dir.path().join("test.db"),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        (format!("http://{}", addr), coordinator)
    }

    fn key() -> String {
        format!("pplx-{}", "z".repeat(48))
    }

    #[tokio::test]
    async fn test_models_endpoint_lists_catalog_with_pricing() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = spawn_app(&dir).await;
        let v: Value = reqwest::get(format!("{}/api/models", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["models"][0]["id"], "sonar");
        assert_eq!(v["models"][0]["cost"], "$0.001/1k tokens");
        assert_eq!(v["models"][0]["context"], "127k");
        assert_eq!(v["models"][1]["cost"], "--");
    }

    #[tokio::test]
    async fn test_run_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let (base, coordinator) = spawn_app(&dir).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "prompt": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.text().await.unwrap(), "Please enter a prompt");

        let resp = client
            .get(format!("{}/api/runs/current/export", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = client
            .put(format!("{}/api/credential", base))
            .json(&serde_json::json!({ "apiKey": key() }))
            .send()
            .await
            .unwrap();
        let cred: Value = resp.json().await.unwrap();
        assert_eq!(cred["hasKey"], true);
        assert_eq!(cred["envFallback"], false);

        let resp = client
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "prompt": "hello", "maxTokens": 50 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let started: Value = resp.json().await.unwrap();
        assert_eq!(started["runId"], 1);
        coordinator.wait_settled().await;

        let view: Value = client
            .get(format!("{}/api/runs/current", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["settled"], true);
        assert_eq!(view["settings"]["maxTokens"], 50);
        assert_eq!(view["statuses"][0]["status"], "complete");
        assert_eq!(view["statuses"][1]["status"], "error");
        assert_eq!(
            view["headlineError"],
            "Error with broken: malformed response: no choices"
        );
        assert_eq!(view["results"][0]["response"], "HELLO");
        assert_eq!(view["results"][0]["elapsed"], "1.50s");
        assert_eq!(view["results"][0]["costs"]["requestCost"], "$0.005");

        let resp = client
            .get(format!("{}/api/runs/current/export", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(disposition.contains("perplexity-comparison-"));
        let doc: Value = resp.json().await.unwrap();
        assert_eq!(doc["responses"].as_array().unwrap().len(), 1);

        let resp = client
            .delete(format!("{}/api/credential", base))
            .send()
            .await
            .unwrap();
        let cred: Value = resp.json().await.unwrap();
        assert_eq!(cred["hasKey"], false);
    }

    #[tokio::test]
    async fn test_events_stream_publishes_run_state() {
        let dir = tempfile::tempdir().unwrap();
        let (base, coordinator) = spawn_app(&dir).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/runs", base))
            .json(&serde_json::json!({ "prompt": "ping", "apiKey": key() }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        coordinator.wait_settled().await;

        let mut resp = client
            .get(format!("{}/api/runs/events", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut buffer = String::new();
        while !buffer.contains("\n\n") {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), resp.chunk())
                .await
                .expect("first event arrives")
                .unwrap()
                .expect("stream open");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }

        let event = buffer.split("\n\n").next().unwrap();
        assert!(event.lines().any(|l| l == "event: state"));
        let data = event
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("data line");
        let view: Value = serde_json::from_str(data).unwrap();
        assert_eq!(view["runId"], 1);
        assert_eq!(view["settled"], true);
        assert_eq!(view["results"][0]["response"], "PING");
    }
}
