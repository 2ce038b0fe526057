use super::lists_method;
use crate::{
    error::{Failure, StatusKind},
    interceptor::{Interceptor, InterceptorClass, Next},
    request::{Reply, Request},
};
use base64::Engine;
use tonic::metadata::MetadataMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// When unset, only the password is checked.
    pub username: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct BasicAuthOptions {
    pub credentials: Credentials,
    /// Methods served without authentication.
    pub excluded_methods: Vec<String>,
}

/// Rejects calls without a valid `authorization: Basic ...` header.
pub struct BasicAuth {
    authorized: bool,
}

impl InterceptorClass for BasicAuth {
    type Options = BasicAuthOptions;

    fn build(request: &Request, options: &Self::Options) -> Self {
        let authorized = lists_method(&options.excluded_methods, request)
            || matches_credentials(request.metadata(), &options.credentials);
        Self { authorized }
    }
}

#[tonic::async_trait]
impl Interceptor for BasicAuth {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        if self.authorized {
            return next.run(request).await;
        }

        debug!(method = %request.method_name(), "Rejecting unauthenticated call");
        Err(request.fail(
            StatusKind::Unauthenticated,
            Some("unauthenticated"),
            "Unauthorized",
        ))
    }
}

fn matches_credentials(metadata: &MetadataMap, credentials: &Credentials) -> bool {
    let Some(header) = metadata
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return false;
    };

    credentials
        .username
        .as_deref()
        .is_none_or(|expected| expected == username)
        && credentials.password == password
}
