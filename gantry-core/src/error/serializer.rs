//! Pluggable wire formats for [`Error`].
use super::{DebugInfo, Error, FieldError, StatusKind};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Failed to encode error payload: '{0}'")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode error payload: '{0}'")]
    Decode(#[source] serde_json::Error),
}

/// Turns an [`Error`] into a transport-safe string and back.
pub trait ErrorSerializer: Debug + Send + Sync {
    fn serialize(&self, error: &Error) -> Result<String, SerializerError>;

    fn deserialize(&self, payload: &str) -> Result<Error, SerializerError>;
}

/// Default serializer.
///
/// Produces `{code, app_code, message, field_errors, debug_info}` where `debug_info` is `{}`
/// when the error carries none. The error's metadata travels as separate metadata entries
/// and is not part of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

#[derive(Serialize, Deserialize)]
struct WireError {
    code: StatusKind,
    app_code: String,
    message: String,
    #[serde(default)]
    field_errors: Vec<FieldError>,
    #[serde(default)]
    debug_info: WireDebugInfo,
}

#[derive(Default, Serialize, Deserialize)]
struct WireDebugInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack_trace: Option<Vec<String>>,
}

impl ErrorSerializer for JsonSerializer {
    fn serialize(&self, error: &Error) -> Result<String, SerializerError> {
        let debug_info = match &error.debug_info {
            Some(info) => WireDebugInfo {
                detail: Some(info.detail.clone()),
                stack_trace: Some(info.stack_trace.clone()),
            },
            None => WireDebugInfo::default(),
        };

        let wire = WireError {
            code: error.code,
            app_code: error.app_code().to_string(),
            message: error.message.clone(),
            field_errors: error.field_errors.clone(),
            debug_info,
        };

        serde_json::to_string(&wire).map_err(SerializerError::Encode)
    }

    fn deserialize(&self, payload: &str) -> Result<Error, SerializerError> {
        let wire: WireError = serde_json::from_str(payload).map_err(SerializerError::Decode)?;

        let debug_info = wire.debug_info.detail.map(|detail| DebugInfo {
            detail,
            stack_trace: wire.debug_info.stack_trace.unwrap_or_default(),
        });

        let mut error = Error::new(wire.code)
            .with_app_code(wire.app_code)
            .with_message(wire.message);
        error.field_errors = wire.field_errors;
        error.debug_info = debug_info;

        Ok(error)
    }
}
