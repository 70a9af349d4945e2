//! Typed environment configuration for the run orchestrator.
//!
//! Reads the variables named in the external-interfaces section of the
//! orchestrator spec, applying defaults for anything unset and failing fast
//! on anything set but malformed — unlike a `.env`/XDG loader, there is no
//! multi-source precedence to resolve here, just `std::env::var` plus
//! defaults.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {key} has invalid value {value:?}: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("environment variable LEGACY_MODEL_MAP is not valid JSON: {0}")]
    InvalidLegacyModelMap(String),
}

/// Maps a legacy/deprecated model id to the id the provider currently accepts.
pub type LegacyModelMap = HashMap<String, String>;

/// Process-wide settings, read once at startup and shared as `Arc<Settings>`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fallback API key used when a run request does not supply one.
    pub llm_default_key: Option<String>,
    /// Maximum recursion depth for delegation (`spec.md` §4.5).
    pub max_depth: u32,
    /// Bounded worker-pool size for concurrent child execution within one run.
    pub max_parallel_per_run: usize,
    /// Process-wide cap on in-flight LLM calls.
    pub global_llm_concurrency: usize,
    /// Whole-run wall-clock deadline.
    pub run_timeout: Duration,
    /// Per-agent wall-clock deadline (includes its children).
    pub agent_timeout: Duration,
    /// Bounded capacity of the executor-to-coordinator event channel.
    pub channel_capacity: usize,
    /// Legacy model id substitutions applied before dispatch to C1.
    pub legacy_model_map: LegacyModelMap,
}

impl std::fmt::Debug for Settings {
    /// Never prints `llm_default_key`: API keys must not be logged.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("llm_default_key", &self.llm_default_key.as_ref().map(|_| "<redacted>"))
            .field("max_depth", &self.max_depth)
            .field("max_parallel_per_run", &self.max_parallel_per_run)
            .field("global_llm_concurrency", &self.global_llm_concurrency)
            .field("run_timeout", &self.run_timeout)
            .field("agent_timeout", &self.agent_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("legacy_model_map", &self.legacy_model_map)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_default_key: None,
            max_depth: 10,
            max_parallel_per_run: 4,
            global_llm_concurrency: 32,
            run_timeout: Duration::from_secs(600),
            agent_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            legacy_model_map: HashMap::new(),
        }
    }
}

impl Settings {
    /// Reads settings from the process environment, applying defaults for unset
    /// variables. Fails on a variable that is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        settings.llm_default_key = non_empty_env("LLM_DEFAULT_KEY");

        if let Some(raw) = non_empty_env("MAX_DEPTH") {
            settings.max_depth = parse_env("MAX_DEPTH", &raw, "a positive integer")?;
        }
        if let Some(raw) = non_empty_env("MAX_PARALLEL_PER_RUN") {
            settings.max_parallel_per_run =
                parse_env("MAX_PARALLEL_PER_RUN", &raw, "a positive integer")?;
        }
        if let Some(raw) = non_empty_env("GLOBAL_LLM_CONCURRENCY") {
            settings.global_llm_concurrency =
                parse_env("GLOBAL_LLM_CONCURRENCY", &raw, "a positive integer")?;
        }
        if let Some(raw) = non_empty_env("RUN_TIMEOUT_SECONDS") {
            settings.run_timeout =
                Duration::from_secs(parse_env("RUN_TIMEOUT_SECONDS", &raw, "a positive integer")?);
        }
        if let Some(raw) = non_empty_env("AGENT_TIMEOUT_SECONDS") {
            settings.agent_timeout = Duration::from_secs(parse_env(
                "AGENT_TIMEOUT_SECONDS",
                &raw,
                "a positive integer",
            )?);
        }
        if let Some(raw) = non_empty_env("CHANNEL_CAPACITY") {
            settings.channel_capacity = parse_env("CHANNEL_CAPACITY", &raw, "a positive integer")?;
        }
        if let Some(raw) = non_empty_env("LEGACY_MODEL_MAP") {
            settings.legacy_model_map = serde_json::from_str(&raw)
                .map_err(|e| ConfigError::InvalidLegacyModelMap(e.to_string()))?;
        }

        Ok(settings)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    raw: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "LLM_DEFAULT_KEY",
            "MAX_DEPTH",
            "MAX_PARALLEL_PER_RUN",
            "GLOBAL_LLM_CONCURRENCY",
            "RUN_TIMEOUT_SECONDS",
            "AGENT_TIMEOUT_SECONDS",
            "CHANNEL_CAPACITY",
            "LEGACY_MODEL_MAP",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_spec_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.max_depth, 10);
        assert_eq!(settings.max_parallel_per_run, 4);
        assert_eq!(settings.global_llm_concurrency, 32);
        assert_eq!(settings.run_timeout, Duration::from_secs(600));
        assert_eq!(settings.agent_timeout, Duration::from_secs(30));
        assert_eq!(settings.channel_capacity, 256);
        assert!(settings.llm_default_key.is_none());
        assert!(settings.legacy_model_map.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("MAX_DEPTH", "3");
        env::set_var("AGENT_TIMEOUT_SECONDS", "1");
        env::set_var(
            "LEGACY_MODEL_MAP",
            r#"{"gpt-4-0314": "gpt-4o"}"#,
        );
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.max_depth, 3);
        assert_eq!(settings.agent_timeout, Duration::from_secs(1));
        assert_eq!(
            settings.legacy_model_map.get("gpt-4-0314").map(String::as_str),
            Some("gpt-4o")
        );
        clear_all();
    }

    #[test]
    fn malformed_numeric_value_is_an_error_not_a_silent_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("MAX_DEPTH", "not-a-number");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "MAX_DEPTH", .. }));
        clear_all();
    }

    #[test]
    fn malformed_legacy_model_map_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("LEGACY_MODEL_MAP", "not json");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLegacyModelMap(_)));
        clear_all();
    }

    #[test]
    fn debug_impl_redacts_api_key() {
        let mut settings = Settings::default();
        settings.llm_default_key = Some("sk-super-secret".to_string());
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("sk-super-secret"));
        assert!(debug.contains("redacted"));
    }
}
