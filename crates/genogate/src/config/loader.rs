use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::schema::{Config, ProviderConfig};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// Environment variable consulted when no explicit config path is given.
pub const CONFIG_ENV_VAR: &str = "GENOGATE_CONFIG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Picks the config file: explicit path, then `GENOGATE_CONFIG`, then the platform config dir.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(value) = std::env::var(CONFIG_ENV_VAR) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    let candidate = default_config_path().ok_or(ConfigError::NotFound)?;
    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(ConfigError::NotFound)
    }
}

/// `<config dir>/genogate/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("genogate").join("config.json"))
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validation(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(validation(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.store.root.trim().is_empty() {
        return Err(validation("store.root must not be empty"));
    }

    let mut names = HashSet::new();
    for genome in &config.catalog.genomes {
        if !crate::catalog::is_valid_genome_name(&genome.name) {
            return Err(validation(format!(
                "Invalid genome name '{}'",
                genome.name
            )));
        }
        if !names.insert(genome.name.as_str()) {
            return Err(validation(format!(
                "Duplicate genome '{}'",
                genome.name
            )));
        }
    }

    if config.jobs.poll_interval_ms == 0 {
        return Err(validation("jobs.poll_interval_ms must be > 0"));
    }
    if config.jobs.max_tracked_jobs == 0 {
        return Err(validation("jobs.max_tracked_jobs must be > 0"));
    }
    if config.handles.read_chunk_bytes == 0 {
        return Err(validation("handles.read_chunk_bytes must be > 0"));
    }
    if config.handles.idle_timeout_secs == 0 || config.handles.reap_interval_secs == 0 {
        return Err(validation("handle idle timeout and reap interval must be > 0"));
    }
    if config.scheduler.max_concurrent == 0 {
        return Err(validation("scheduler.max_concurrent must be > 0"));
    }

    let templates = &config.scheduler.templates;
    for (name, template) in [
        ("bowtie", &templates.bowtie),
        ("bwa", &templates.bwa),
        ("samtools", &templates.samtools),
        ("vcf_merge", &templates.vcf_merge),
    ] {
        if template.trim().is_empty() {
            return Err(validation(format!("Template '{}' is empty", name)));
        }
    }

    match &config.auth.provider {
        ProviderConfig::Static { users } => {
            let mut usernames = HashSet::new();
            for user in users {
                if !usernames.insert(user.username.as_str()) {
                    return Err(validation(format!(
                        "Duplicate user '{}'",
                        user.username
                    )));
                }
                let has_password = user.password.as_deref().is_some_and(|p| !p.is_empty());
                let has_token = user.token.as_deref().is_some_and(|t| !t.is_empty());
                if !has_password && !has_token {
                    return Err(validation(format!(
                        "User '{}' needs a password or a token",
                        user.username
                    )));
                }
            }
        }
        ProviderConfig::Http { url, .. } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(validation(format!(
                    "Identity provider URL must be http(s): {}",
                    url
                )));
            }
        }
    }

    Ok(())
}
