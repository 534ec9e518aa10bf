use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::DispatchError;
use crate::models::{Message, ModelId, ModelResult, RunSettings, TokenUsage};

pub const DEFAULT_API_BASE: &str = "https://api.perplexity.ai";

const SYSTEM_PROMPT: &str = "Be precise and concise.";
const SEARCH_DOMAIN_FILTER: &[&str] = &["perplexity.ai"];
const SEARCH_RECENCY_FILTER: &str = "month";
const TOP_P: f64 = 0.9;
const TOP_K: u32 = 0;
const PRESENCE_PENALTY: f64 = 0.0;
const FREQUENCY_PENALTY: f64 = 1.0;

/**
 * \brief One request/response cycle against one model.
 *
 * Implementations settle exactly once and never retry.
 */
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        model: &ModelId,
        settings: &RunSettings,
        credential: &str,
    ) -> Result<ModelResult, DispatchError>;
}

/**
 * \brief Dispatcher for Perplexity's chat-completion endpoint.
 */
#[derive(Debug, Clone)]
pub struct PerplexityDispatcher {
    client: reqwest::Client,
    api_base: String,
}

impl PerplexityDispatcher {
    pub fn new(api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl Dispatcher for PerplexityDispatcher {
    async fn dispatch(
        &self,
        model: &ModelId,
        settings: &RunSettings,
        credential: &str,
    ) -> Result<ModelResult, DispatchError> {
        let body = build_request_body(model, settings);
        let started = Instant::now();

        let resp = self
            .client
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body: text });
        }
        let text = resp.text().await?;
        let elapsed_millis = started.elapsed().as_millis() as u64;

        let completion = parse_completion(&text)?;
        Ok(completion.into_result(model.clone(), elapsed_millis))
    }
}

/**
 * \brief Request body with the fixed generation policy of every comparison run.
 */
pub fn build_request_body(model: &ModelId, settings: &RunSettings) -> Value {
    let messages = [
        Message::system(SYSTEM_PROMPT),
        Message::user(settings.prompt.as_str()),
    ];
    json!({
        "model": model,
        "messages": messages,
        "temperature": settings.temperature,
        "max_tokens": settings.max_tokens,
        "top_p": TOP_P,
        "search_domain_filter": SEARCH_DOMAIN_FILTER,
        "return_images": false,
        "return_related_questions": false,
        "return_citations": true,
        "search_recency_filter": SEARCH_RECENCY_FILTER,
        "top_k": TOP_K,
        "stream": false,
        "presence_penalty": PRESENCE_PENALTY,
        "frequency_penalty": FREQUENCY_PENALTY
    })
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Usage,
    #[serde(default)]
    citations: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/**
 * \brief Decoded completion, minus timing.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub citations: Vec<String>,
}

impl Completion {
    pub fn into_result(self, model_id: ModelId, elapsed_millis: u64) -> ModelResult {
        ModelResult {
            model_id,
            response_text: self.content,
            elapsed_millis,
            token_usage: self.usage,
            citations: self.citations,
        }
    }
}

pub fn parse_completion(body: &str) -> Result<Completion, DispatchError> {
    let parsed: CompletionResponse =
        serde_json::from_str(body).map_err(|e| DispatchError::Malformed(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| DispatchError::Malformed("response has no choices".to_string()))?;
    Ok(Completion {
        content,
        usage: TokenUsage {
            completion: parsed.usage.completion_tokens,
            prompt: parsed.usage.prompt_tokens,
            total: parsed.usage.total_tokens,
        },
        citations: parsed.citations.unwrap_or_default(),
    })
}
