//! Configuration validation utilities.

use std::collections::BTreeMap;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BotConfig, IbotsConfig, ResourceConfig, RestartConfig, RetryConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &IbotsConfig) -> ConfigResult<()> {
    validate_global_config(config)?;
    validate_resources_config(&config.resources)?;
    validate_bots_config(config)?;
    Ok(())
}

/// Validates global configuration settings.
fn validate_global_config(config: &IbotsConfig) -> ConfigResult<()> {
    let global = &config.global;

    // An empty endpoint is allowed for in-process platforms
    if !global.endpoint.is_empty() {
        validate_endpoint(&global.endpoint)?;
    }

    if global.poll_interval_ms == 0 {
        return Err(ConfigError::validation("Poll interval must be greater than 0"));
    }

    if global.page_size == 0 {
        return Err(ConfigError::validation("Page size must be greater than 0"));
    }

    if global.max_page_size < global.page_size {
        return Err(ConfigError::validation(
            "Max page size must be greater than or equal to page size",
        ));
    }

    if global.stop_timeout_ms == 0 {
        return Err(ConfigError::validation("Stop timeout must be greater than 0"));
    }

    if global.state_dir.as_os_str().is_empty() {
        return Err(ConfigError::missing_field("global.state_dir"));
    }

    validate_retry_config(&global.read_retry)?;
    validate_restart_config(&global.restart)?;

    Ok(())
}

/// Validates retry configuration.
fn validate_retry_config(retry: &RetryConfig) -> ConfigResult<()> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::validation("Retry attempts must be at least 1"));
    }

    validate_backoff(retry.initial_delay_ms, retry.max_delay_ms, retry.backoff_multiplier)
}

/// Validates restart configuration.
fn validate_restart_config(restart: &RestartConfig) -> ConfigResult<()> {
    validate_backoff(
        restart.initial_delay_ms,
        restart.max_delay_ms,
        restart.backoff_multiplier,
    )
}

fn validate_backoff(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> ConfigResult<()> {
    if initial_delay_ms == 0 {
        return Err(ConfigError::validation(
            "Initial retry delay must be greater than 0",
        ));
    }

    if max_delay_ms < initial_delay_ms {
        return Err(ConfigError::validation(
            "Max retry delay must be greater than or equal to initial delay",
        ));
    }

    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::validation(
            "Backoff multiplier must be at least 1.0",
        ));
    }

    Ok(())
}

/// Validates all resource configurations.
fn validate_resources_config(resources: &BTreeMap<String, ResourceConfig>) -> ConfigResult<()> {
    for (name, resource) in resources {
        if name.is_empty() {
            return Err(ConfigError::missing_field("resource name"));
        }

        if resource.kind.is_empty() {
            return Err(ConfigError::missing_field(format!("resources.{name}.kind")));
        }

        if resource.timeout_ms == 0 {
            return Err(ConfigError::validation(format!(
                "Resource '{name}' timeout must be greater than 0"
            )));
        }

        if let Some(budget) = &resource.budget {
            if budget.calls == 0 || budget.period_ms == 0 {
                return Err(ConfigError::validation(format!(
                    "Resource '{name}' budget needs at least one call per non-empty period"
                )));
            }
        }
    }

    Ok(())
}

/// Validates all bot configurations.
fn validate_bots_config(config: &IbotsConfig) -> ConfigResult<()> {
    for (id, bot) in &config.bots {
        validate_bot_id(id)?;
        validate_bot_config(id, bot, &config.resources)?;
    }

    if let Some(id) = config.logging.bots.keys().find(|id| !config.bots.contains_key(*id)) {
        return Err(ConfigError::validation(format!(
            "logging.bots names unknown bot '{id}'"
        )));
    }

    Ok(())
}

/// Bot ids name checkpoint files, so they stay within a safe character set.
fn validate_bot_id(id: &str) -> ConfigResult<()> {
    if id.is_empty() {
        return Err(ConfigError::missing_field("bot id"));
    }

    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || id.starts_with('.') {
        return Err(ConfigError::validation(format!(
            "Bot ID '{id}' may only contain ASCII letters, digits, '-', '_' and '.'"
        )));
    }

    Ok(())
}

/// Validates a single bot configuration.
fn validate_bot_config(
    id: &str,
    bot: &BotConfig,
    resources: &BTreeMap<String, ResourceConfig>,
) -> ConfigResult<()> {
    if bot.handler.is_empty() {
        return Err(ConfigError::missing_field(format!("bots.{id}.handler")));
    }

    if bot.username.is_empty() {
        return Err(ConfigError::missing_field(format!("bots.{id}.username")));
    }

    if bot.password.is_empty() {
        return Err(ConfigError::missing_field(format!("bots.{id}.password")));
    }

    for name in &bot.resources {
        if !resources.contains_key(name) {
            return Err(ConfigError::UndeclaredResource {
                bot_id: id.to_string(),
                resource: name.clone(),
            });
        }
    }

    Ok(())
}

/// Validates the platform endpoint.
fn validate_endpoint(endpoint: &str) -> ConfigResult<()> {
    if endpoint.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid_endpoint(endpoint, "contains whitespace"));
    }

    let host = match endpoint.split_once("://") {
        Some((scheme, rest)) => {
            if !matches!(scheme, "http" | "https") {
                return Err(ConfigError::invalid_endpoint(endpoint, "scheme must be http or https"));
            }
            rest
        }
        None => endpoint,
    };

    if host.trim_end_matches('/').is_empty() {
        return Err(ConfigError::invalid_endpoint(endpoint, "no host"));
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BudgetConfig, GlobalConfig};
    use serde_json::Value;

    fn bot(resources: &[&str]) -> BotConfig {
        BotConfig {
            handler: "hello".into(),
            username: "hello@example.org".into(),
            password: "secret".into(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
            args: Value::Null,
            enabled: true,
        }
    }

    fn ledger() -> ResourceConfig {
        ResourceConfig {
            kind: "ledger".into(),
            budget: Some(BudgetConfig {
                calls: 1,
                period_ms: 1000,
            }),
            timeout_ms: 1000,
            args: Value::Null,
        }
    }

    #[test]
    fn test_valid_config() {
        let mut config = IbotsConfig::default();
        config.global.endpoint = "api.example.org".into();
        config.resources.insert("ledger".into(), ledger());
        config.bots.insert("hello".into(), bot(&["ledger"]));

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_undeclared_resource() {
        let mut config = IbotsConfig::default();
        config.bots.insert("hello".into(), bot(&["ledger"]));

        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UndeclaredResource { .. }));
    }

    #[test]
    fn test_empty_credentials() {
        let mut config = IbotsConfig::default();
        let mut hello = bot(&[]);
        hello.password.clear();
        config.bots.insert("hello".into(), hello);

        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "bots.hello.password"));
    }

    #[test]
    fn test_log_level_for_unknown_bot() {
        let mut config = IbotsConfig::default();
        config.bots.insert("hello".into(), bot(&[]));
        config
            .logging
            .bots
            .insert("ghost".into(), crate::config::LogLevel::Debug);

        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_bot_id_is_file_safe() {
        let mut config = IbotsConfig::default();
        config.bots.insert("../evil".into(), bot(&[]));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_endpoint() {
        assert!(validate_endpoint("https://api.example.org").is_ok());
        assert!(validate_endpoint("http://127.0.0.1:8000/").is_ok());
        assert!(validate_endpoint("api.example.org").is_ok());
        assert!(validate_endpoint("ftp://api.example.org").is_err());
        assert!(validate_endpoint("https://").is_err());
        assert!(validate_endpoint("api example").is_err());
    }

    #[test]
    fn test_global_bounds() {
        let config = IbotsConfig {
            global: GlobalConfig {
                page_size: 50,
                max_page_size: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());

        let mut config = IbotsConfig::default();
        config.global.read_retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = IbotsConfig::default();
        config.global.restart.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }
}
