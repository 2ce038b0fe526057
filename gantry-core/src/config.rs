//! # Configuration
//!
//! Every component receives its settings through an explicit [`Config`] value, usually shared
//! behind an `Arc`. A configuration can be built from defaults, deserialized with `serde`
//! (missing fields fall back to their defaults) or read from `GANTRY_*` environment variables.
use crate::error::{ErrorSerializer, JsonSerializer};
use serde::Deserialize;
use std::{fmt::Debug, str::FromStr, sync::Arc, time::Duration};
use tonic::metadata::{Ascii, Binary, MetadataKey};

/// Default values for configuration
mod defaults {
    pub fn error_metadata_key() -> String {
        "error-internal-bin".to_string()
    }
    // Conservatively below the 8KiB trailing metadata limit of most HTTP/2 stacks.
    pub fn max_metadata_size() -> usize {
        7 * 1024 + 512
    }
    pub fn synchronized_client_expiry_secs() -> u64 {
        60
    }
    pub fn use_exception_message() -> bool {
        true
    }
    pub fn internal_error_message() -> String {
        "Internal Server Error".to_string()
    }
    pub fn backtrace_on_error() -> bool {
        false
    }
    pub fn backtrace_limit() -> usize {
        10
    }
    pub fn append_server_errors_to_trailing_metadata() -> bool {
        true
    }
}

/// Errors produced while loading a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Settings consumed by the error model, the pipeline and the synchronized client.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Metadata key the serialized error is written under.
    #[serde(default = "defaults::error_metadata_key")]
    pub error_metadata_key: String,
    /// Maximum size in bytes of the error metadata attached to a call.
    #[serde(default = "defaults::max_metadata_size")]
    pub max_metadata_size: usize,
    /// How long a coalesced result stays cached after the call completed.
    #[serde(default = "defaults::synchronized_client_expiry_secs")]
    pub synchronized_client_expiry_secs: u64,
    /// Whether messages of unexpected handler failures are sent to the caller verbatim.
    #[serde(default = "defaults::use_exception_message")]
    pub use_exception_message: bool,
    /// Message sent instead of the original one when `use_exception_message` is off.
    #[serde(default = "defaults::internal_error_message")]
    pub internal_error_message: String,
    /// Attach debug info with a truncated stack trace to unexpected failures.
    #[serde(default = "defaults::backtrace_on_error")]
    pub backtrace_on_error: bool,
    /// Maximum number of stack trace lines kept in the debug info.
    #[serde(default = "defaults::backtrace_limit")]
    pub backtrace_limit: usize,
    /// Whether failed calls carry the serialized error in their trailing metadata.
    #[serde(default = "defaults::append_server_errors_to_trailing_metadata")]
    pub append_server_errors_to_trailing_metadata: bool,
    /// Serializer used for the error payload, JSON unless replaced programmatically.
    #[serde(skip, default = "default_serializer")]
    pub error_serializer: Arc<dyn ErrorSerializer>,
}

fn default_serializer() -> Arc<dyn ErrorSerializer> {
    Arc::new(JsonSerializer)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            error_metadata_key: defaults::error_metadata_key(),
            max_metadata_size: defaults::max_metadata_size(),
            synchronized_client_expiry_secs: defaults::synchronized_client_expiry_secs(),
            use_exception_message: defaults::use_exception_message(),
            internal_error_message: defaults::internal_error_message(),
            backtrace_on_error: defaults::backtrace_on_error(),
            backtrace_limit: defaults::backtrace_limit(),
            append_server_errors_to_trailing_metadata:
                defaults::append_server_errors_to_trailing_metadata(),
            error_serializer: default_serializer(),
        }
    }
}

impl Config {
    /// Loads the configuration from `GANTRY_*` environment variables.
    ///
    /// Unset variables keep their default value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration using `lookup` to resolve each `GANTRY_*` variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            error_metadata_key: lookup("GANTRY_ERROR_METADATA_KEY")
                .unwrap_or(defaults.error_metadata_key),
            max_metadata_size: parse(
                &lookup,
                "GANTRY_MAX_METADATA_SIZE",
                defaults.max_metadata_size,
            )?,
            synchronized_client_expiry_secs: parse(
                &lookup,
                "GANTRY_SYNCHRONIZED_CLIENT_EXPIRY",
                defaults.synchronized_client_expiry_secs,
            )?,
            use_exception_message: parse_bool(
                &lookup,
                "GANTRY_USE_EXCEPTION_MESSAGE",
                defaults.use_exception_message,
            )?,
            internal_error_message: lookup("GANTRY_INTERNAL_ERROR_MESSAGE")
                .unwrap_or(defaults.internal_error_message),
            backtrace_on_error: parse_bool(
                &lookup,
                "GANTRY_BACKTRACE_ON_ERROR",
                defaults.backtrace_on_error,
            )?,
            backtrace_limit: parse(&lookup, "GANTRY_BACKTRACE_LIMIT", defaults.backtrace_limit)?,
            append_server_errors_to_trailing_metadata: parse_bool(
                &lookup,
                "GANTRY_APPEND_SERVER_ERRORS_TO_TRAILING_METADATA",
                defaults.append_server_errors_to_trailing_metadata,
            )?,
            error_serializer: defaults.error_serializer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would otherwise only fail once a call is being served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = &self.error_metadata_key;
        let valid_key = if key.ends_with("-bin") {
            MetadataKey::<Binary>::from_bytes(key.as_bytes()).is_ok()
        } else {
            MetadataKey::<Ascii>::from_bytes(key.as_bytes()).is_ok()
        };

        if !valid_key {
            return Err(ConfigError::InvalidValue {
                key: "error_metadata_key".to_string(),
                value: key.clone(),
                reason: "must be a valid gRPC metadata key".to_string(),
            });
        }

        if self.max_metadata_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_metadata_size".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Expiry of the synchronized client's result cache.
    pub fn synchronized_client_expiry(&self) -> Duration {
        Duration::from_secs(self.synchronized_client_expiry_secs)
    }

    /// Replaces the error serializer.
    pub fn with_error_serializer(mut self, serializer: impl ErrorSerializer + 'static) -> Self {
        self.error_serializer = Arc::new(serializer);
        self
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.error_metadata_key, "error-internal-bin");
        assert_eq!(config.max_metadata_size, 7680);
        assert_eq!(config.synchronized_client_expiry(), Duration::from_secs(60));
        assert!(config.use_exception_message);
        assert!(!config.backtrace_on_error);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("GANTRY_ERROR_METADATA_KEY", "x-error"),
            ("GANTRY_SYNCHRONIZED_CLIENT_EXPIRY", "5"),
            ("GANTRY_USE_EXCEPTION_MESSAGE", "false"),
            ("GANTRY_BACKTRACE_ON_ERROR", "1"),
        ]))
        .unwrap();

        assert_eq!(config.error_metadata_key, "x-error");
        assert_eq!(config.synchronized_client_expiry(), Duration::from_secs(5));
        assert!(!config.use_exception_message);
        assert!(config.backtrace_on_error);
        assert_eq!(config.backtrace_limit, 10);
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        let err = Config::from_lookup(lookup(&[("GANTRY_MAX_METADATA_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "GANTRY_MAX_METADATA_SIZE"));

        let err = Config::from_lookup(lookup(&[("GANTRY_BACKTRACE_ON_ERROR", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = Config::from_lookup(lookup(&[("GANTRY_ERROR_METADATA_KEY", "bad key")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "error_metadata_key"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "internal_error_message": "Oops", "backtrace_limit": 3 }"#)
                .unwrap();
        assert_eq!(config.internal_error_message, "Oops");
        assert_eq!(config.backtrace_limit, 3);
        assert_eq!(config.error_metadata_key, "error-internal-bin");
    }
}
