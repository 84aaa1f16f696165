//! Core configuration: a plain snapshot the shell persists as JSON. A
//! rejected config leaves the previous one in force.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("proxy_port must be non-zero")]
    InvalidPort,
    #[error("invalid bypass pattern {pattern:?}: {reason}")]
    InvalidBypassPattern { pattern: String, reason: &'static str },
    #[error("cache_leaf_max must be at least 1")]
    InvalidLeafCacheMax,
    #[error("duplicate rule source id {0:?}")]
    DuplicateRuleSourceId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSourceConfig {
    pub id: String,
    pub enabled: bool,
    pub text_blob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy_port: u16,
    pub bypass_patterns: Vec<String>,
    pub rule_sources: Vec<RuleSourceConfig>,
    pub cache_leaf_ttl_secs: u32,
    pub cache_leaf_max: u32,
    pub origin_verify_system_trust: bool,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: 8899,
            bypass_patterns: Vec::new(),
            rule_sources: Vec::new(),
            cache_leaf_ttl_secs: 86_400,
            cache_leaf_max: 1000,
            origin_verify_system_trust: true,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.cache_leaf_max == 0 {
            return Err(ConfigError::InvalidLeafCacheMax);
        }
        for pattern in &self.bypass_patterns {
            guard_index::normalize_domain(pattern).map_err(|error| {
                ConfigError::InvalidBypassPattern {
                    pattern: pattern.clone(),
                    reason: error.reason(),
                }
            })?;
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.rule_sources {
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::DuplicateRuleSourceId(source.id.clone()));
            }
        }
        Ok(())
    }
}
