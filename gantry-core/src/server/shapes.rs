//! Adapters between tonic's per-shape service traits and the pipeline.
//!
//! Every call runs the pipeline in a spawned task. Unary and client-streaming calls wait for it
//! and answer with the handler's message. Server-streaming and bidirectional calls answer right
//! away with the receiving end of the response channel; a failure of the pipeline becomes the
//! terminal item of that stream.
use super::{Inner, Route};
use crate::{
    error::StatusKind,
    pipeline,
    request::{Call, Emitter, MessageSource, Reply, Request, merge_missing_metadata},
};
use serde_json::Value;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Status, Streaming,
    codegen::BoxFuture,
    server::{ClientStreamingService, ServerStreamingService, StreamingService, UnaryService},
};
use tracing::debug;

/// Number of response messages buffered before `Request::emit` waits for the client.
pub const RESPONSE_STREAM_BUFFER: usize = 100;

type ResponseStream = ReceiverStream<Result<Value, Status>>;

/// A bound method, ready to serve calls.
#[derive(Clone)]
pub(super) struct Endpoint {
    pub(super) inner: Arc<Inner>,
    pub(super) route: Arc<Route>,
}

impl Endpoint {
    fn request(&self, call: Call, messages: MessageSource) -> Request {
        Request::new(
            self.route.method.clone(),
            call,
            messages,
            Arc::clone(&self.inner.config),
        )
    }

    async fn execute(&self, request: &mut Request) -> Result<Reply, Status> {
        debug!(method = %request.path(), shape = request.shape().as_str(), "Dispatching call");
        pipeline::execute(
            request,
            &self.inner.interceptors,
            &self.inner.hooks,
            self.route.handler.as_ref(),
        )
        .await
    }

    /// Runs the call in its own task and answers with the handler's message.
    ///
    /// The task outlives the transport's future, so a client going away does not cut the
    /// chain short: hooks and interceptors still see the call through.
    async fn respond(&self, request: Request) -> Result<tonic::Response<Value>, Status> {
        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.reply(request).await })
            .await
            .unwrap_or_else(|err| Err(Status::internal(format!("Call task failed: {err}"))))
    }

    async fn reply(&self, mut request: Request) -> Result<tonic::Response<Value>, Status> {
        let message = match self.execute(&mut request).await {
            Ok(Reply::Message(message)) => message,
            Ok(Reply::Streamed) => {
                let message = format!(
                    "Handler of '{}' did not return a response message",
                    request.method_name()
                );
                let status = request.fail_status(StatusKind::Internal, None, message);
                return Err(finish(status, &request.into_call()));
            }
            Err(status) => return Err(finish(status, &request.into_call())),
        };

        let mut response = tonic::Response::new(message);
        *response.metadata_mut() = request.into_call().into_output_metadata();
        Ok(response)
    }

    fn stream(&self, call: Call, messages: MessageSource) -> tonic::Response<ResponseStream> {
        let (emitter, stream) = Emitter::channel(RESPONSE_STREAM_BUFFER);
        let request = self.request(call.with_emitter(emitter.clone()), messages);
        let endpoint = self.clone();

        tokio::spawn(async move {
            let mut request = request;
            let outcome = endpoint.execute(&mut request).await;
            let call = request.into_call();

            match outcome {
                Ok(Reply::Streamed) => {}
                Ok(Reply::Message(message)) => {
                    // A closed stream means the client went away.
                    let _ = emitter.emit(message).await;
                }
                Err(status) => emitter.close_with(finish(status, &call)).await,
            }
        });

        tonic::Response::new(stream)
    }
}

/// Adds the call's outbound metadata the status does not carry yet.
fn finish(mut status: Status, call: &Call) -> Status {
    merge_missing_metadata(status.metadata_mut(), call.output_metadata());
    status
}

pub(super) struct Unary(pub(super) Endpoint);

impl UnaryService<Value> for Unary {
    type Response = Value;
    type Future = BoxFuture<tonic::Response<Value>, Status>;

    fn call(&mut self, request: tonic::Request<Value>) -> Self::Future {
        let endpoint = self.0.clone();
        Box::pin(async move {
            let (metadata, extensions, message) = request.into_parts();
            let request = endpoint.request(
                Call::new(metadata, extensions),
                MessageSource::single(message),
            );
            endpoint.respond(request).await
        })
    }
}

pub(super) struct ClientStreaming(pub(super) Endpoint);

impl ClientStreamingService<Value> for ClientStreaming {
    type Response = Value;
    type Future = BoxFuture<tonic::Response<Value>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<Value>>) -> Self::Future {
        let endpoint = self.0.clone();
        Box::pin(async move {
            let (metadata, extensions, messages) = request.into_parts();
            let request = endpoint.request(
                Call::new(metadata, extensions),
                MessageSource::stream(messages),
            );
            endpoint.respond(request).await
        })
    }
}

pub(super) struct ServerStreaming(pub(super) Endpoint);

impl ServerStreamingService<Value> for ServerStreaming {
    type Response = Value;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Value>) -> Self::Future {
        let endpoint = self.0.clone();
        Box::pin(async move {
            let (metadata, extensions, message) = request.into_parts();
            Ok(endpoint.stream(
                Call::new(metadata, extensions),
                MessageSource::single(message),
            ))
        })
    }
}

pub(super) struct BidiStreaming(pub(super) Endpoint);

impl StreamingService<Value> for BidiStreaming {
    type Response = Value;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<Value>>) -> Self::Future {
        let endpoint = self.0.clone();
        Box::pin(async move {
            let (metadata, extensions, messages) = request.into_parts();
            Ok(endpoint.stream(
                Call::new(metadata, extensions),
                MessageSource::stream(messages),
            ))
        })
    }
}
