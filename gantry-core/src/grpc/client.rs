//! # Generic gRPC Client
//!
//! Wraps `tonic::client::Grpc` to perform calls on any method given its descriptor.
//!
//! The [`GrpcClient`] uses the [`super::codec::JsonCodec`] for serialization: it never needs
//! to know the structure of the messages, it establishes readiness, builds the HTTP/2 path
//! (e.g. `/package.Service/Method`) at runtime and converts string tuples into request
//! metadata. Responses are returned with their metadata so that callers can inspect headers
//! and rebuild structured errors.
use super::codec::JsonCodec;
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use std::{str::FromStr, time::Duration};
use tonic::{
    Response, Status, Streaming,
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
    #[error("Method '{0}' does not map to a valid HTTP/2 path")]
    InvalidPath(String),
}

/// Outcome of a call that reached the server: either a response or the status it failed with.
pub type CallResult<T> = Result<Result<Response<T>, Status>, GrpcRequestError>;

/// A generic client able to call any method of any service.
#[derive(Clone, Debug)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Unary gRPC call (Single Request -> Single Response).
    ///
    /// # Returns
    /// * `Ok(Ok(Response))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(GrpcRequestError)` - Failed to send request or connect.
    pub async fn unary(
        &mut self,
        method: &MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> CallResult<serde_json::Value> {
        self.ready().await?;

        let codec = JsonCodec::client(method);
        let path = http_path(method)?;
        let request = build_request(payload, headers, timeout)?;

        Ok(self.client.unary(request, path, codec).await)
    }

    /// Performs a Server Streaming gRPC call (Single Request -> Stream of Responses).
    pub async fn server_streaming(
        &mut self,
        method: &MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> CallResult<Streaming<serde_json::Value>> {
        self.ready().await?;

        let codec = JsonCodec::client(method);
        let path = http_path(method)?;
        let request = build_request(payload, headers, timeout)?;

        Ok(self.client.server_streaming(request, path, codec).await)
    }

    /// Performs a Client Streaming gRPC call (Stream of Requests -> Single Response).
    pub async fn client_streaming(
        &mut self,
        method: &MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> CallResult<serde_json::Value> {
        self.ready().await?;

        let codec = JsonCodec::client(method);
        let path = http_path(method)?;
        let request = build_request(payload_stream, headers, timeout)?;

        Ok(self.client.client_streaming(request, path, codec).await)
    }

    /// Performs a Bidirectional Streaming gRPC call (Stream of Requests -> Stream of Responses).
    pub async fn bidirectional_streaming(
        &mut self,
        method: &MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> CallResult<Streaming<serde_json::Value>> {
        self.ready().await?;

        let codec = JsonCodec::client(method);
        let path = http_path(method)?;
        let request = build_request(payload_stream, headers, timeout)?;

        Ok(self.client.streaming(request, path, codec).await)
    }

    async fn ready(&mut self) -> Result<(), GrpcRequestError> {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))
    }
}

fn http_path(method: &MethodDescriptor) -> Result<http::uri::PathAndQuery, GrpcRequestError> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path).map_err(|_| GrpcRequestError::InvalidPath(path))
}

fn build_request<T>(
    payload: T,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);
    for (k, v) in headers {
        let key =
            MetadataKey::from_str(&k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(&v)
            .map_err(|source| GrpcRequestError::InvalidMetadataValue { key: k, source })?;
        request.metadata_mut().insert(key, val);
    }
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_sets_headers_and_timeout() {
        let request = build_request(
            (),
            vec![("authorization".to_string(), "Basic abc".to_string())],
            Some(Duration::from_millis(1500)),
        )
        .unwrap();

        assert_eq!(request.metadata().get("authorization").unwrap(), "Basic abc");
        assert!(request.metadata().get("grpc-timeout").is_some());
    }

    #[test]
    fn test_build_request_rejects_invalid_headers() {
        let err = build_request((), vec![("bad key".to_string(), "v".to_string())], None)
            .unwrap_err();
        assert!(matches!(err, GrpcRequestError::InvalidMetadataKey { ref key, .. } if key == "bad key"));

        let err = build_request((), vec![("x-k".to_string(), "a\nb".to_string())], None)
            .unwrap_err();
        assert!(matches!(err, GrpcRequestError::InvalidMetadataValue { .. }));
    }

    #[test]
    fn test_http_path() {
        let method = catalog_service::catalog_service()
            .methods()
            .find(|m| m.name() == "ListProducts")
            .unwrap();
        assert_eq!(http_path(&method).unwrap().as_str(), "/catalog.Catalog/ListProducts");
    }
}
