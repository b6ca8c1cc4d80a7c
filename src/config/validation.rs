//! Configuration validation

use super::*;
use crate::error::{Result, ServiceError};

const ALLOWED_PROTOCOLS: &[&str] = &["http", "https"];

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_timeouts(&config.timeouts)?;
    validate_circuit_breaker(&config.circuit_breaker)?;
    validate_queue(&config.queue)?;
    validate_cache(&config.cache)?;
    validate_query(&config.query)?;
    Ok(())
}

/// Validate the remote server location
fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.files_collection.is_empty() || config.folders_collection.is_empty() {
        return Err(ServiceError::Config("Collection names cannot be empty".to_string()));
    }

    if config.files_collection == config.folders_collection {
        return Err(ServiceError::Config(
            "Files and folders must use different collections".to_string(),
        ));
    }

    if let Some(url) = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ServiceError::Config(format!("Invalid server URL '{}': {}", url, e)))?;

        if !ALLOWED_PROTOCOLS.contains(&parsed.scheme()) {
            return Err(ServiceError::Config(format!(
                "Server URL scheme must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        if parsed.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(ServiceError::Config("Server URL has no host".to_string()));
        }

        return Ok(());
    }

    if !ALLOWED_PROTOCOLS.contains(&config.protocol.as_str()) {
        return Err(ServiceError::Config(format!(
            "Server protocol must be http or https, got '{}'",
            config.protocol
        )));
    }

    if config.host.trim().is_empty() {
        return Err(ServiceError::Config("Server host cannot be empty".to_string()));
    }

    if config.host.contains('/') || config.host.contains(' ') {
        return Err(ServiceError::Config(format!("Invalid server host '{}'", config.host)));
    }

    if config.port == 0 {
        return Err(ServiceError::Config(
            "Server port must be between 1 and 65535".to_string(),
        ));
    }

    Ok(())
}

fn validate_timeouts(config: &TimeoutConfig) -> Result<()> {
    if config.operation_ms == 0 {
        return Err(ServiceError::Config("Operation timeout must be greater than 0".to_string()));
    }

    if config.init_ms == 0 {
        return Err(ServiceError::Config(
            "Initialization timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_circuit_breaker(config: &CircuitBreakerSettings) -> Result<()> {
    if config.failure_threshold == 0 {
        return Err(ServiceError::Config(
            "Circuit breaker failure threshold must be greater than 0".to_string(),
        ));
    }

    if config.success_threshold == 0 {
        return Err(ServiceError::Config(
            "Circuit breaker success threshold must be greater than 0".to_string(),
        ));
    }

    if config.half_open_max_calls == 0 {
        return Err(ServiceError::Config(
            "Circuit breaker must allow at least one half-open call".to_string(),
        ));
    }

    if config.call_timeout_ms == 0 {
        return Err(ServiceError::Config(
            "Circuit breaker call timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(config: &QueueSettings) -> Result<()> {
    if config.max_size == 0 {
        return Err(ServiceError::Config("Queue size must be greater than 0".to_string()));
    }

    if config.batch_size == 0 {
        return Err(ServiceError::Config("Queue batch size must be greater than 0".to_string()));
    }

    if config.batch_size > config.max_size {
        return Err(ServiceError::Config(format!(
            "Queue batch size ({}) cannot exceed queue size ({})",
            config.batch_size, config.max_size
        )));
    }

    if config.max_retries == 0 {
        return Err(ServiceError::Config("Queue max retries must be greater than 0".to_string()));
    }

    Ok(())
}

fn validate_cache(config: &CacheSettings) -> Result<()> {
    if config.max_size == 0 {
        return Err(ServiceError::Config("Cache size must be greater than 0".to_string()));
    }

    if config.ttl_ms == 0 {
        return Err(ServiceError::Config("Cache TTL must be greater than 0".to_string()));
    }

    Ok(())
}

fn validate_query(config: &QuerySettings) -> Result<()> {
    if config.max_inflight == 0 {
        return Err(ServiceError::Config(
            "Max in-flight queries must be greater than 0".to_string(),
        ));
    }

    if config.default_top_k == 0 {
        return Err(ServiceError::Config("Default top-k must be greater than 0".to_string()));
    }

    Ok(())
}
