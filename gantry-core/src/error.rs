//! # Structured Errors
//!
//! Every inbound call owns one [`Error`]. Handlers and interceptors enrich it (field errors,
//! debug info, metadata) and, when the call fails, it is serialized into the call's outbound
//! metadata so that clients can rebuild it on their side.
//!
//! ## Wire format
//!
//! The error is serialized by the configured [`ErrorSerializer`] ([`JsonSerializer`] by
//! default) and stored under `Config::error_metadata_key` (`error-internal-bin` by default).
//! The whole attached metadata is kept below `Config::max_metadata_size`: an error that would
//! exceed it is replaced by a small `internal` error instead of risking a transport fault.
mod failure;
pub mod kind;
pub mod serializer;

pub use failure::Failure;
pub use kind::{StatusKind, UnknownStatusKind};
pub use serializer::{ErrorSerializer, JsonSerializer, SerializerError};

use crate::{config::Config, request::Call};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tonic::{Status, metadata::MetadataMap};
use tracing::warn;

/// App code of the error that replaces an oversized one.
pub const METADATA_SIZE_EXCEEDED_CODE: &str = "RESOURCE_EXHAUSTED";
/// Message of the error that replaces an oversized one.
pub const METADATA_SIZE_EXCEEDED_MSG: &str =
    "Metadata too long, risks exceeding http2 trailing metadata limit.";

/// A validation error on a single field of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field_name: String,
    pub error_code: String,
    pub message: String,
}

/// Debugging details, only attached when explicitly requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub detail: String,
    pub stack_trace: Vec<String>,
}

/// The structured application error of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    code: StatusKind,
    app_code: Option<String>,
    message: String,
    field_errors: Vec<FieldError>,
    debug_info: Option<DebugInfo>,
    metadata: BTreeMap<String, String>,
}

impl Default for Error {
    fn default() -> Self {
        Self::new(StatusKind::Unknown)
    }
}

impl Error {
    pub fn new(code: StatusKind) -> Self {
        Self {
            code,
            app_code: None,
            message: String::new(),
            field_errors: Vec::new(),
            debug_info: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_app_code(mut self, app_code: impl Into<String>) -> Self {
        self.set_app_code(Some(app_code.into()));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn code(&self) -> StatusKind {
        self.code
    }

    pub fn set_code(&mut self, code: StatusKind) {
        self.code = code;
    }

    /// The application code, falling back to the status kind name when unset.
    pub fn app_code(&self) -> &str {
        self.app_code.as_deref().unwrap_or(self.code.as_str())
    }

    /// Sets the application code. `None` (or an empty string) restores the fallback.
    pub fn set_app_code(&mut self, app_code: Option<String>) {
        self.app_code = app_code.filter(|code| !code.is_empty());
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn field_errors(&self) -> &[FieldError] {
        &self.field_errors
    }

    /// Appends a field error. Duplicates are kept.
    pub fn add_field_error(
        &mut self,
        field_name: impl Into<String>,
        error_code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.field_errors.push(FieldError {
            field_name: field_name.into(),
            error_code: error_code.into(),
            message: message.into(),
        });
    }

    pub fn has_field_errors(&self) -> bool {
        !self.field_errors.is_empty()
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }

    pub fn set_debug_info(&mut self, detail: impl Into<String>, stack_trace: Vec<String>) {
        self.debug_info = Some(DebugInfo {
            detail: detail.into(),
            stack_trace,
        });
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Replaces the metadata. Values are converted to strings right away, since the wire
    /// only carries strings: JSON strings are taken as-is, any other value is rendered as JSON.
    pub fn set_metadata<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.metadata = entries
            .into_iter()
            .map(|(key, value)| (key.into(), coerce(value.into())))
            .collect();
    }

    /// Adds or replaces a single metadata entry, coercing the value to a string.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), coerce(value.into()));
    }

    /// Serializes the error with the given serializer.
    pub fn serialize(&self, serializer: &dyn ErrorSerializer) -> Result<String, SerializerError> {
        serializer.serialize(self)
    }

    /// Writes the serialized error and the error's metadata into the call's outbound metadata.
    ///
    /// When the combined metadata is larger than `config.max_metadata_size`, a small
    /// `internal` error is attached in place of this one and returned.
    pub fn attach_to_call(&self, call: &mut Call, config: &Config) -> Option<Error> {
        let metadata = self.outbound_metadata(config);
        if metadata.is_empty() {
            return None;
        }

        if metadata_size(&metadata) > config.max_metadata_size {
            warn!(
                code = METADATA_SIZE_EXCEEDED_CODE,
                original = ?self,
                limit = config.max_metadata_size,
                "{}",
                METADATA_SIZE_EXCEEDED_MSG
            );

            let replacement = Error::new(StatusKind::Internal)
                .with_app_code(METADATA_SIZE_EXCEEDED_CODE)
                .with_message(METADATA_SIZE_EXCEEDED_MSG);
            call.merge_output_metadata(&replacement.outbound_metadata(config));
            return Some(replacement);
        }

        call.merge_output_metadata(&metadata);
        None
    }

    /// Builds the transport status for this error, carrying the call's outbound metadata.
    pub fn to_status(&self, call: &Call) -> Status {
        Status::with_metadata(
            self.code.code(),
            self.message.clone(),
            call.output_metadata().clone(),
        )
    }

    /// Rebuilds the error attached to received metadata, if there is one.
    ///
    /// A payload that cannot be decoded is logged and ignored.
    pub fn from_metadata(metadata: &MetadataMap, config: &Config) -> Option<Self> {
        let key = config.error_metadata_key.as_str();
        let payload = if key.ends_with("-bin") {
            let bytes = metadata.get_bin(key)?.to_bytes().ok()?;
            String::from_utf8(bytes.to_vec()).ok()?
        } else {
            metadata.get(key)?.to_str().ok()?.to_string()
        };

        match config.error_serializer.deserialize(&payload) {
            Ok(error) => Some(error),
            Err(err) => {
                warn!(error = %err, key, "Ignoring undecodable error payload");
                None
            }
        }
    }

    fn outbound_metadata(&self, config: &Config) -> BTreeMap<String, String> {
        let mut metadata = self.metadata.clone();

        if config.append_server_errors_to_trailing_metadata {
            match self.serialize(config.error_serializer.as_ref()) {
                Ok(payload) => {
                    metadata.insert(config.error_metadata_key.clone(), payload);
                }
                Err(err) => warn!(error = %err, "Failed to serialize error, sending it without payload"),
            }
        }

        metadata
    }
}

fn coerce(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn metadata_size(metadata: &BTreeMap<String, String>) -> usize {
    serde_json::to_string(metadata).map_or(usize::MAX, |s| s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> Call {
        Call::new(MetadataMap::new(), tonic::Extensions::default())
    }

    fn attached_error(call: &Call, config: &Config) -> Error {
        let bytes = call
            .output_metadata()
            .get_bin(config.error_metadata_key.as_str())
            .unwrap()
            .to_bytes()
            .unwrap();
        let payload = std::str::from_utf8(&bytes).unwrap();
        JsonSerializer.deserialize(payload).unwrap()
    }

    #[test]
    fn test_metadata_values_are_coerced_to_strings() {
        let mut error = Error::default();
        error.set_metadata([
            ("foo", serde_json::Value::from("bar")),
            ("n", serde_json::Value::from(123)),
        ]);
        error.insert_metadata("flag", true);

        let expected: BTreeMap<String, String> = [("flag", "true"), ("foo", "bar"), ("n", "123")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(error.metadata(), &expected);
    }

    #[test]
    fn test_app_code_falls_back_to_code() {
        let mut error = Error::new(StatusKind::PermissionDenied);
        assert_eq!(error.app_code(), "permission_denied");

        error.set_app_code(Some("not_owner".to_string()));
        assert_eq!(error.app_code(), "not_owner");

        error.set_app_code(Some(String::new()));
        assert_eq!(error.app_code(), "permission_denied");
    }

    #[test]
    fn test_field_errors_accumulate_without_dedup() {
        let mut error = Error::default();
        assert!(!error.has_field_errors());
        error.add_field_error("sku", "blank", "SKU can't be blank");
        error.add_field_error("sku", "blank", "SKU can't be blank");
        assert_eq!(error.field_errors().len(), 2);
    }

    #[test]
    fn test_attach_to_call_writes_payload_and_metadata() {
        let config = Config::default();
        let mut call = call();
        let mut error = Error::new(StatusKind::NotFound)
            .with_app_code("product_not_found")
            .with_message("No such product");
        error.insert_metadata("product-sku", "ABC");

        assert!(error.attach_to_call(&mut call, &config).is_none());

        assert_eq!(call.output_metadata().get("product-sku").unwrap(), "ABC");
        let attached = attached_error(&call, &config);
        assert_eq!(attached.code(), StatusKind::NotFound);
        assert_eq!(attached.app_code(), "product_not_found");
        assert_eq!(attached.message(), "No such product");
    }

    #[test]
    fn test_attach_to_call_replaces_oversized_errors() {
        let config = Config::default();
        let mut call = call();
        let mut error = Error::new(StatusKind::InvalidArgument).with_message("too many errors");
        for i in 0..500 {
            error.add_field_error(format!("field_{i}"), "invalid", "This field is invalid");
        }

        let replacement = error.attach_to_call(&mut call, &config).unwrap();
        assert_eq!(replacement.code(), StatusKind::Internal);

        let attached = attached_error(&call, &config);
        assert_eq!(attached, replacement);
        assert_eq!(attached.app_code(), METADATA_SIZE_EXCEEDED_CODE);
        assert_eq!(attached.message(), METADATA_SIZE_EXCEEDED_MSG);
        assert!(!attached.has_field_errors());
    }

    #[test]
    fn test_attach_to_call_without_payload() {
        let config = Config {
            append_server_errors_to_trailing_metadata: false,
            ..Config::default()
        };
        let mut call = call();

        Error::new(StatusKind::Aborted).attach_to_call(&mut call, &config);

        assert!(call.output_metadata().is_empty());
    }

    #[test]
    fn test_from_metadata_reads_attached_error() {
        let config = Config::default();
        let mut call = call();
        let mut error = Error::new(StatusKind::FailedPrecondition).with_message("Out of stock");
        error.add_field_error("stock", "negative", "Stock can't be negative");
        error.attach_to_call(&mut call, &config);

        let received = Error::from_metadata(call.output_metadata(), &config).unwrap();
        assert_eq!(received.code(), StatusKind::FailedPrecondition);
        assert_eq!(received.field_errors(), error.field_errors());

        assert!(Error::from_metadata(&MetadataMap::new(), &config).is_none());
    }

    #[test]
    fn test_to_status_maps_code_and_carries_metadata() {
        let config = Config::default();
        let mut call = call();
        let error = Error::new(StatusKind::AlreadyExists).with_message("duplicate");
        error.attach_to_call(&mut call, &config);

        let status = error.to_status(&call);
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
        assert_eq!(status.message(), "duplicate");
        assert!(status.metadata().get_bin("error-internal-bin").is_some());
    }
}
