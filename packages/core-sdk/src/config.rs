use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};

use crate::llm::DEFAULT_API_BASE;

pub const ENV_API_BASE: &str = "PERPLEXITY_API_BASE";
pub const ENV_API_KEY: &str = "PERPLEXITY_API_KEY";
pub const ENV_DISPATCH_TIMEOUT: &str = "SONARBENCH_DISPATCH_TIMEOUT_SECS";
pub const ENV_DB_PATH: &str = "SONARBENCH_DB";
pub const ENV_LOG_DIR: &str = "SONARBENCH_LOG_DIR";
pub const ENV_UI_DIR: &str = "SONARBENCH_UI_DIR";

/**
 * \brief Process-level settings, read once at startup and passed down explicitly.
 */
#[derive(Clone, PartialEq)]
pub struct AppConfig {
    /** \brief Provider base URL, without the `/chat/completions` suffix. */
    pub api_base: String,
    /** \brief Credential used when none is supplied for a run. */
    pub fallback_api_key: Option<String>,
    /** \brief `None` keeps a silent model loading indefinitely. */
    pub dispatch_timeout: Option<Duration>,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /** \brief Static files served by `serve` for paths outside `/api`. */
    pub ui_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            fallback_api_key: None,
            dispatch_timeout: None,
            db_path: PathBuf::from("sonarbench.db"),
            log_dir: PathBuf::from("logs"),
            ui_dir: PathBuf::from("web"),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_base", &self.api_base)
            .field("fallback_api_key", &self.fallback_api_key.as_ref().map(|_| "<set>"))
            .field("dispatch_timeout", &self.dispatch_timeout)
            .field("db_path", &self.db_path)
            .field("log_dir", &self.log_dir)
            .field("ui_dir", &self.ui_dir)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief Builds the config from an arbitrary variable source. Blank values count as unset.
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let dispatch_timeout = match get(ENV_DISPATCH_TIMEOUT) {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("{} must be a whole number of seconds, got {:?}", ENV_DISPATCH_TIMEOUT, raw))?;
                if secs == 0 {
                    return Err(anyhow!("{} must be greater than zero", ENV_DISPATCH_TIMEOUT));
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            api_base: get(ENV_API_BASE).unwrap_or(defaults.api_base),
            fallback_api_key: get(ENV_API_KEY),
            dispatch_timeout,
            db_path: get(ENV_DB_PATH).map(PathBuf::from).unwrap_or(defaults.db_path),
            log_dir: get(ENV_LOG_DIR).map(PathBuf::from).unwrap_or(defaults.log_dir),
            ui_dir: get(ENV_UI_DIR).map(PathBuf::from).unwrap_or(defaults.ui_dir),
        })
    }
}
