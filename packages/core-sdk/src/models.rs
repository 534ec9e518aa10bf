use std::fmt;

use serde::{Deserialize, Serialize};

/**
 * \brief Opaque name of one requestable model configuration.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/**
 * \brief Input of one run as supplied by the presentation layer.
 *
 * `credential` may be blank, in which case the coordinator falls back to the
 * configured default before validating.
 */
#[derive(Clone, Deserialize)]
pub struct RunParameters {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub credential: String,
}

impl RunParameters {
    pub fn new(prompt: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            credential: credential.into(),
        }
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            prompt: self.prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

// Hand-written so the credential never ends up in logs.
impl fmt::Debug for RunParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunParameters")
            .field("prompt", &self.prompt)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/**
 * \brief Run parameters without the credential; what a RunState and an export keep.
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSettings {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/**
 * \brief Token counts reported by the provider for one completion.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub completion: u64,
    pub prompt: u64,
    pub total: u64,
}

/**
 * \brief Outcome of one successful dispatch. Never mutated after creation.
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResult {
    pub model_id: ModelId,
    #[serde(rename = "response")]
    pub response_text: String,
    #[serde(rename = "responseTime")]
    pub elapsed_millis: u64,
    #[serde(rename = "tokens")]
    pub token_usage: TokenUsage,
    pub citations: Vec<String>,
}

/**
 * \brief Per-model lifecycle: idle -> loading -> complete | error.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ModelStatus {
    Idle,
    Loading,
    Complete,
    Error { error: String },
}

impl ModelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelStatus::Complete | ModelStatus::Error { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelStatus::Idle => "idle",
            ModelStatus::Loading => "loading",
            ModelStatus::Complete => "complete",
            ModelStatus::Error { .. } => "error",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ModelStatus::Error { error } => Some(error),
            _ => None,
        }
    }
}

/**
 * \brief Chat message in the provider's wire format.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief system / user / assistant */
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief Renders elapsed milliseconds as seconds with two decimals, e.g. `1.23s`.
 */
pub fn format_elapsed(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}
