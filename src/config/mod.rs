//! Runtime configuration read from the environment

pub mod definitions;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::strategies::EvaluationOptions;

pub use definitions::{apply_definitions, load_definitions, StrategyDefinitions};

/// Deployment environment name (`ENVIRONMENT`), `sandbox` when unset.
pub fn get_environment() -> String {
    env::var("ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub http_port: u16,
    pub ws_port: u16,
    /// Upper bound on instances evaluated at the same time.
    pub max_concurrent_evaluations: usize,
    pub publish_buffer: usize,
    pub feed_buffer: usize,
    /// Events queued per push client before they start being dropped.
    pub push_client_buffer: usize,
    pub evaluate_irrelevant_groups: bool,
    /// 0 disables the terminal-instance reaper.
    pub reap_interval_seconds: u64,
    pub terminal_retention_seconds: u64,
    pub strategies_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            ws_port: 8081,
            max_concurrent_evaluations: 64,
            publish_buffer: 1024,
            feed_buffer: 1024,
            push_client_buffer: 256,
            evaluate_irrelevant_groups: true,
            reap_interval_seconds: 60,
            terminal_retention_seconds: 3600,
            strategies_file: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            http_port: parse_or(&lookup, "PORT", defaults.http_port),
            ws_port: parse_or(&lookup, "WS_PORT", defaults.ws_port),
            max_concurrent_evaluations: parse_or(
                &lookup,
                "MAX_CONCURRENT_EVALUATIONS",
                defaults.max_concurrent_evaluations,
            )
            .max(1),
            publish_buffer: parse_or(&lookup, "PUBLISH_BUFFER", defaults.publish_buffer).max(1),
            feed_buffer: parse_or(&lookup, "FEED_BUFFER", defaults.feed_buffer).max(1),
            push_client_buffer: parse_or(&lookup, "PUSH_CLIENT_BUFFER", defaults.push_client_buffer)
                .max(1),
            evaluate_irrelevant_groups: parse_or(
                &lookup,
                "EVALUATE_IRRELEVANT_GROUPS",
                defaults.evaluate_irrelevant_groups,
            ),
            reap_interval_seconds: parse_or(
                &lookup,
                "REAP_INTERVAL_SECONDS",
                defaults.reap_interval_seconds,
            ),
            terminal_retention_seconds: parse_or(
                &lookup,
                "TERMINAL_RETENTION_SECONDS",
                defaults.terminal_retention_seconds,
            ),
            strategies_file: lookup("STRATEGIES_FILE")
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn evaluation_options(&self) -> EvaluationOptions {
        EvaluationOptions {
            evaluate_irrelevant_groups: self.evaluate_irrelevant_groups,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = %raw, "Invalid configuration value, using default");
                default
            }
        },
        None => default,
    }
}
