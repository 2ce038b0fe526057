//! # Outbound Clients
//!
//! [`Client`] calls any method of a service given its descriptor, dispatching on the RPC
//! shape of the method. [`SynchronizedClient`] wraps it to collapse concurrent identical calls
//! into a single request.
//!
//! Failed calls surface as [`ClientError::Status`], carrying the structured [`Error`] the
//! server attached to the status metadata when there is one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gantry_core::{client::Client, config::Config};
//! use std::sync::Arc;
//!
//! # async fn run(service: prost_reflect::ServiceDescriptor) -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect("http://localhost:50051", service, Arc::new(Config::default())).await?;
//! let response = client
//!     .call("get_product", serde_json::json!({ "sku": "A1" }), vec![])
//!     .await?;
//! println!("{:?} in {:.2}ms", response.message(), response.execution_time_ms());
//! # Ok(())
//! # }
//! ```
mod coalesce;
mod synchronized;

pub use coalesce::{Coalescer, Fingerprint, LockToken};
pub use synchronized::SynchronizedClient;

use crate::{
    BoxError,
    config::Config,
    error::Error,
    grpc::client::{GrpcClient, GrpcRequestError},
    request::{RpcShape, merge_missing_metadata},
    server::method_key,
    timer,
};
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tonic::{
    Status, Streaming,
    metadata::MetadataMap,
    transport::{Channel, Endpoint},
};

/// Errors that can occur when connecting to a gRPC server.
#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

/// Errors that can occur during a call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },
    #[error("Invalid params: '{0}'")]
    InvalidParams(String),
    #[error("gRPC client request error: '{0}'")]
    Request(#[from] GrpcRequestError),
    #[error("Call failed with status {:?}: '{}'", .status.code(), .status.message())]
    Status {
        status: Status,
        /// The structured error attached by the server, if any.
        error: Option<Error>,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<&Status> {
        match self {
            ClientError::Status { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            ClientError::Status { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}

/// What a call returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The single response of a unary or client-streaming call.
    Message(Value),
    /// Every response of a server-streaming or bidirectional call.
    Stream(Vec<Value>),
}

/// A successful call.
#[derive(Debug, Clone)]
pub struct Response {
    pub payload: Payload,
    /// Response headers, plus trailers for streamed responses.
    pub metadata: MetadataMap,
    pub execution_time: Duration,
}

impl Response {
    pub fn message(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Message(message) => Some(message),
            Payload::Stream(_) => None,
        }
    }

    pub fn messages(&self) -> &[Value] {
        match &self.payload {
            Payload::Message(message) => std::slice::from_ref(message),
            Payload::Stream(messages) => messages,
        }
    }

    pub fn execution_time_ms(&self) -> f64 {
        self.execution_time.as_secs_f64() * 1000.0
    }
}

/// A dynamic client bound to one service.
#[derive(Clone, Debug)]
pub struct Client<S = Channel> {
    grpc: GrpcClient<S>,
    service: ServiceDescriptor,
    config: Arc<Config>,
    timeout: Option<Duration>,
}

impl Client<Channel> {
    /// Connects to the server at `addr`.
    pub async fn connect(
        addr: &str,
        service: ServiceDescriptor,
        config: Arc<Config>,
    ) -> Result<Self, ClientConnectError> {
        let endpoint = Endpoint::new(addr.to_string())
            .map_err(|e| ClientConnectError::InvalidUrl(addr.to_string(), e))?;

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientConnectError::ConnectionFailed(addr.to_string(), e))?;

        Ok(Self::new(channel, service, config))
    }
}

impl<S> Client<S>
where
    S: tonic::client::GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Creates a client from an existing Tonic service/channel.
    pub fn new(transport: S, service: ServiceDescriptor, config: Arc<Config>) -> Self {
        Self {
            grpc: GrpcClient::new(transport),
            service,
            config,
            timeout: None,
        }
    }

    /// Sets a deadline applied to every call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Looks a method up by its RPC name (`GetProduct`) or its method key (`get_product`).
    pub fn method(&self, name: &str) -> Result<MethodDescriptor, ClientError> {
        self.service
            .methods()
            .find(|m| m.name() == name || method_key(m.name()) == name)
            .ok_or_else(|| ClientError::MethodNotFound {
                service: self.service.full_name().to_string(),
                method: name.to_string(),
            })
    }

    /// Calls `method` with `params`.
    ///
    /// For client-streaming and bidirectional methods `params` must be a JSON array, sent as
    /// one message per item.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        metadata: Vec<(String, String)>,
    ) -> Result<Response, ClientError> {
        let method = self.method(method)?;
        self.call_method(&method, params, metadata).await
    }

    pub(crate) async fn call_method(
        &self,
        method: &MethodDescriptor,
        params: Value,
        metadata: Vec<(String, String)>,
    ) -> Result<Response, ClientError> {
        let timed = timer::time(self.dispatch(method, params, metadata)).await;
        let execution_time = timed.elapsed();
        let (payload, metadata) = timed.into_result()?;

        Ok(Response {
            payload,
            metadata,
            execution_time,
        })
    }

    async fn dispatch(
        &self,
        method: &MethodDescriptor,
        params: Value,
        metadata: Vec<(String, String)>,
    ) -> Result<(Payload, MetadataMap), ClientError> {
        let mut grpc = self.grpc.clone();

        match RpcShape::of(method) {
            RpcShape::Unary => {
                let response = grpc
                    .unary(method, params, metadata, self.timeout)
                    .await?
                    .map_err(|status| self.status_error(status))?;
                let (metadata, message, _) = response.into_parts();
                Ok((Payload::Message(message), metadata))
            }
            RpcShape::ServerStreaming => {
                let response = grpc
                    .server_streaming(method, params, metadata, self.timeout)
                    .await?
                    .map_err(|status| self.status_error(status))?;
                self.collect(response).await
            }
            RpcShape::ClientStreaming => {
                let messages = json_array_to_stream(params)?;
                let response = grpc
                    .client_streaming(method, messages, metadata, self.timeout)
                    .await?
                    .map_err(|status| self.status_error(status))?;
                let (metadata, message, _) = response.into_parts();
                Ok((Payload::Message(message), metadata))
            }
            RpcShape::BidiStreaming => {
                let messages = json_array_to_stream(params)?;
                let response = grpc
                    .bidirectional_streaming(method, messages, metadata, self.timeout)
                    .await?
                    .map_err(|status| self.status_error(status))?;
                self.collect(response).await
            }
        }
    }

    async fn collect(
        &self,
        response: tonic::Response<Streaming<Value>>,
    ) -> Result<(Payload, MetadataMap), ClientError> {
        let (mut metadata, mut stream, _) = response.into_parts();

        let mut messages = Vec::new();
        while let Some(message) = stream
            .message()
            .await
            .map_err(|status| self.status_error(status))?
        {
            messages.push(message);
        }

        if let Some(trailers) = stream
            .trailers()
            .await
            .map_err(|status| self.status_error(status))?
        {
            merge_missing_metadata(&mut metadata, &trailers);
        }

        Ok((Payload::Stream(messages), metadata))
    }

    fn status_error(&self, status: Status) -> ClientError {
        let error = Error::from_metadata(status.metadata(), &self.config);
        ClientError::Status { status, error }
    }
}

fn json_array_to_stream(
    params: Value,
) -> Result<impl Stream<Item = Value> + Send + 'static, ClientError> {
    match params {
        Value::Array(items) => Ok(tokio_stream::iter(items)),
        _ => Err(ClientError::InvalidParams(
            "Client streaming requires a JSON Array".to_string(),
        )),
    }
}
