use super::{AppConfig, ConfigError};

/// Validate the entire application configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] describing the first invalid field.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_auth(config)?;
    validate_chat_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    validate_http_url("base_url", &server.base_url)?;
    for (field, path) in [
        ("completions_path", &server.completions_path),
        ("models_path", &server.models_path),
    ] {
        if !path.starts_with('/') {
            return Err(validation_err(format!("{field} must start with '/'")));
        }
    }
    if server.connect_timeout_secs == 0 {
        return Err(validation_err("connect_timeout_secs must be > 0"));
    }
    if server.request_timeout_secs == 0 {
        return Err(validation_err("request_timeout_secs must be > 0"));
    }
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err("http_pool_max_idle_per_host must be > 0"));
    }
    if let Some(proxy) = server.proxy.as_deref() {
        validate_http_url("proxy", proxy)?;
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation_err(format!("{field_name} cannot be empty")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_auth(config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(var) = config.auth.api_key_env.as_deref() {
        if var.trim().is_empty() {
            return Err(validation_err("api_key_env cannot be empty when set"));
        }
    }
    Ok(())
}

fn validate_chat_config(config: &AppConfig) -> Result<(), ConfigError> {
    let chat = &config.chat;
    if chat.stream_channel_capacity == 0 {
        return Err(validation_err("stream_channel_capacity must be > 0"));
    }
    if let Some(temperature) = chat.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(validation_err("temperature must be between 0 and 2"));
        }
    }
    if chat.max_tokens == Some(0) {
        return Err(validation_err("max_tokens must be > 0"));
    }
    if let Some(memory) = &chat.memory_config {
        if memory.max_long_term == Some(0) {
            return Err(validation_err("memory_config.max_long_term must be > 0"));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
