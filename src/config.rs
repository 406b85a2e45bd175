//! Environment configuration
//!
//! Read once at startup after `.env` is loaded.

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::error::WorkflowError;
use crate::orchestrator::WorkflowSettings;
use crate::Result;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Rules,
    Llm,
}

impl FromStr for PolicyKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rules" | "rule" => Ok(PolicyKind::Rules),
            "llm" | "gemini" => Ok(PolicyKind::Llm),
            other => Err(WorkflowError::ConfigError(format!(
                "AGENT_POLICY must be 'rules' or 'llm', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub policy: PolicyKind,
    pub settings: WorkflowSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let port = parse_or(var(&["PORT", "API_PORT"]), "PORT", 8080u16)?;
        let database_url = var(&["DATABASE_URL", "POSTGRES_URL"]);
        let gemini_api_key = var(&["GEMINI_API_KEY"]);

        // An API key alone selects the LLM policies.
        let policy = match var(&["AGENT_POLICY"]) {
            Some(raw) => raw.parse()?,
            None if gemini_api_key.is_some() => PolicyKind::Llm,
            None => PolicyKind::Rules,
        };
        if policy == PolicyKind::Llm && gemini_api_key.is_none() {
            return Err(WorkflowError::ConfigError(
                "AGENT_POLICY=llm requires GEMINI_API_KEY".to_string(),
            ));
        }

        let timeout_secs = parse_or(var(&["AGENT_TIMEOUT_SECS"]), "AGENT_TIMEOUT_SECS", 60u64)?;
        if timeout_secs == 0 {
            return Err(WorkflowError::ConfigError(
                "AGENT_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let settings = WorkflowSettings {
            agent_timeout: Duration::from_secs(timeout_secs),
            resubmission_tolerance: parse_or(
                var(&["RESUBMISSION_TOLERANCE"]),
                "RESUBMISSION_TOLERANCE",
                Decimal::ZERO,
            )?,
            max_revision_attempts: parse_or(
                var(&["MAX_REVISION_ATTEMPTS"]),
                "MAX_REVISION_ATTEMPTS",
                2u32,
            )?,
            audit_capacity: parse_or(
                var(&["AUDIT_CAPACITY"]),
                "AUDIT_CAPACITY",
                DEFAULT_AUDIT_CAPACITY,
            )?,
        };

        Ok(Self {
            port,
            database_url,
            gemini_api_key,
            policy,
            settings,
        })
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| WorkflowError::ConfigError(format!("{} has invalid value '{}'", key, raw))),
    }
}
