use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tonic::Code;

/// Returned when parsing a status kind name that is not part of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown status kind '{0}'")]
pub struct UnknownStatusKind(pub String);

/// Logical error category, mapped one to one onto a transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusKind {
    pub const ALL: [StatusKind; 17] = [
        StatusKind::Ok,
        StatusKind::Cancelled,
        StatusKind::Unknown,
        StatusKind::InvalidArgument,
        StatusKind::DeadlineExceeded,
        StatusKind::NotFound,
        StatusKind::AlreadyExists,
        StatusKind::PermissionDenied,
        StatusKind::ResourceExhausted,
        StatusKind::FailedPrecondition,
        StatusKind::Aborted,
        StatusKind::OutOfRange,
        StatusKind::Unimplemented,
        StatusKind::Internal,
        StatusKind::Unavailable,
        StatusKind::DataLoss,
        StatusKind::Unauthenticated,
    ];

    /// The snake_case name used on the wire (e.g. `not_found`).
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Ok => "ok",
            StatusKind::Cancelled => "cancelled",
            StatusKind::Unknown => "unknown",
            StatusKind::InvalidArgument => "invalid_argument",
            StatusKind::DeadlineExceeded => "deadline_exceeded",
            StatusKind::NotFound => "not_found",
            StatusKind::AlreadyExists => "already_exists",
            StatusKind::PermissionDenied => "permission_denied",
            StatusKind::ResourceExhausted => "resource_exhausted",
            StatusKind::FailedPrecondition => "failed_precondition",
            StatusKind::Aborted => "aborted",
            StatusKind::OutOfRange => "out_of_range",
            StatusKind::Unimplemented => "unimplemented",
            StatusKind::Internal => "internal",
            StatusKind::Unavailable => "unavailable",
            StatusKind::DataLoss => "data_loss",
            StatusKind::Unauthenticated => "unauthenticated",
        }
    }

    /// The transport status code this kind maps to.
    pub fn code(&self) -> Code {
        match self {
            StatusKind::Ok => Code::Ok,
            StatusKind::Cancelled => Code::Cancelled,
            StatusKind::Unknown => Code::Unknown,
            StatusKind::InvalidArgument => Code::InvalidArgument,
            StatusKind::DeadlineExceeded => Code::DeadlineExceeded,
            StatusKind::NotFound => Code::NotFound,
            StatusKind::AlreadyExists => Code::AlreadyExists,
            StatusKind::PermissionDenied => Code::PermissionDenied,
            StatusKind::ResourceExhausted => Code::ResourceExhausted,
            StatusKind::FailedPrecondition => Code::FailedPrecondition,
            StatusKind::Aborted => Code::Aborted,
            StatusKind::OutOfRange => Code::OutOfRange,
            StatusKind::Unimplemented => Code::Unimplemented,
            StatusKind::Internal => Code::Internal,
            StatusKind::Unavailable => Code::Unavailable,
            StatusKind::DataLoss => Code::DataLoss,
            StatusKind::Unauthenticated => Code::Unauthenticated,
        }
    }
}

impl From<Code> for StatusKind {
    fn from(code: Code) -> Self {
        match code {
            Code::Ok => StatusKind::Ok,
            Code::Cancelled => StatusKind::Cancelled,
            Code::Unknown => StatusKind::Unknown,
            Code::InvalidArgument => StatusKind::InvalidArgument,
            Code::DeadlineExceeded => StatusKind::DeadlineExceeded,
            Code::NotFound => StatusKind::NotFound,
            Code::AlreadyExists => StatusKind::AlreadyExists,
            Code::PermissionDenied => StatusKind::PermissionDenied,
            Code::ResourceExhausted => StatusKind::ResourceExhausted,
            Code::FailedPrecondition => StatusKind::FailedPrecondition,
            Code::Aborted => StatusKind::Aborted,
            Code::OutOfRange => StatusKind::OutOfRange,
            Code::Unimplemented => StatusKind::Unimplemented,
            Code::Internal => StatusKind::Internal,
            Code::Unavailable => StatusKind::Unavailable,
            Code::DataLoss => StatusKind::DataLoss,
            Code::Unauthenticated => StatusKind::Unauthenticated,
            #[allow(unreachable_patterns)]
            _ => StatusKind::Unknown,
        }
    }
}

impl From<StatusKind> for Code {
    fn from(kind: StatusKind) -> Self {
        kind.code()
    }
}

impl FromStr for StatusKind {
    type Err = UnknownStatusKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownStatusKind(s.to_string()))
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_maps_to_its_code_and_back() {
        for kind in StatusKind::ALL {
            assert_eq!(StatusKind::from(kind.code()), kind);
            assert_eq!(kind.as_str().parse::<StatusKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let err = "teapot".parse::<StatusKind>().unwrap_err();
        assert_eq!(err, UnknownStatusKind("teapot".to_string()));
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let value = serde_json::to_value(StatusKind::FailedPrecondition).unwrap();
        assert_eq!(value, "failed_precondition");
        assert!(serde_json::from_str::<StatusKind>("\"bogus\"").is_err());
    }
}
