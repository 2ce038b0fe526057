use crate::BoxError;
use tonic::Status;

/// The error side of every pipeline stage.
///
/// `Status` failures are transport-level: they pass through every stage untouched.
/// `Unexpected` failures are converted into an `internal` error once, at the top of the
/// pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error(transparent)]
    Status(#[from] Status),
    #[error("{0}")]
    Unexpected(#[source] BoxError),
}

impl Failure {
    /// Wraps any error that is not a transport status.
    pub fn unexpected(err: impl Into<BoxError>) -> Self {
        Self::Unexpected(err.into())
    }

    /// The transport status, if this is a status failure.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Failure::Status(status) => Some(status),
            Failure::Unexpected(_) => None,
        }
    }
}
