//! Runtime configuration
//!
//! Values come from the environment (a `.env` file is loaded by the binary
//! before this runs) and may be overridden by command-line flags.

use crate::error::{PipelineError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_DB_PATH: &str = "adaptation_mission.db";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Token budget for SQL drafting; summaries use half of it.
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    pub db_timeout: Duration,
    /// Re-prompts allowed after a guard rejection.
    pub max_retries: u32,
    /// Row bound appended to unaggregated statements without a LIMIT.
    pub max_rows: u64,
    /// Number of distinct values listed in diagnostic hints.
    pub diagnostics_top_n: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            llm: LlmConfig {
                api_key: None,
                model: DEFAULT_MODEL.to_string(),
                base_url: DEFAULT_BASE_URL.to_string(),
                timeout: Duration::from_secs(30),
                max_tokens: 512,
            },
            db_timeout: Duration::from_secs(5),
            max_retries: 2,
            max_rows: 200,
            diagnostics_top_n: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let timeout_secs = parse_or(&lookup, "LLM_TIMEOUT_SECS", defaults.llm.timeout.as_secs())?;
        let db_timeout_secs = parse_or(&lookup, "DB_TIMEOUT_SECS", defaults.db_timeout.as_secs())?;

        Ok(Self {
            db_path: lookup("MISSION_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            llm: LlmConfig {
                api_key: lookup("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty()),
                model: lookup("LLM_MODEL").unwrap_or(defaults.llm.model),
                base_url: lookup("LLM_BASE_URL").unwrap_or(defaults.llm.base_url),
                timeout: Duration::from_secs(timeout_secs),
                max_tokens: parse_or(&lookup, "LLM_MAX_TOKENS", defaults.llm.max_tokens)?,
            },
            db_timeout: Duration::from_secs(db_timeout_secs),
            max_retries: parse_or(&lookup, "MISSION_MAX_RETRIES", defaults.max_retries)?,
            max_rows: parse_or(&lookup, "MISSION_MAX_ROWS", defaults.max_rows)?,
            diagnostics_top_n: parse_or(&lookup, "MISSION_TOP_N", defaults.diagnostics_top_n)?,
        })
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.llm.api_key.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "Missing API key: set the OPENROUTER_API_KEY environment variable".to_string(),
            )
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_rows, 200);
        assert_eq!(config.llm.base_url, DEFAULT_BASE_URL);
        assert!(config.llm.api_key.is_none());
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("MISSION_DB_PATH", "/tmp/mission.db"),
            ("MISSION_MAX_RETRIES", "4"),
            ("DB_TIMEOUT_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.require_api_key().unwrap(), "sk-test");
        assert_eq!(config.db_path, PathBuf::from("/tmp/mission.db"));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.db_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = AppConfig::from_lookup(lookup_from(&[("MISSION_MAX_ROWS", "lots")])).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_blank_api_key_is_missing() {
        let config = AppConfig::from_lookup(lookup_from(&[("OPENROUTER_API_KEY", "  ")])).unwrap();
        assert!(config.llm.api_key.is_none());
    }
}
