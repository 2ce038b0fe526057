use super::{
    Client, ClientError, Response,
    coalesce::{Coalescer, Fingerprint},
};
use crate::{BoxError, server::method_key};
use http_body::Body as HttpBody;
use serde_json::Value;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tonic::transport::Channel;

/// A [`Client`] that collapses concurrent identical calls into one.
///
/// Calls are identical when they target the same method with the same params; metadata is not
/// part of the identity. Methods with side effects can opt out with
/// [`SynchronizedClient::with_unsynchronized_methods`].
#[derive(Debug)]
pub struct SynchronizedClient<S = Channel> {
    client: Client<S>,
    unsynchronized_methods: HashSet<String>,
    coalescer: Coalescer<Response>,
}

impl<S> SynchronizedClient<S>
where
    S: tonic::client::GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    /// Wraps `client`, keeping results for the configured `synchronized_client_expiry`.
    pub fn new(client: Client<S>) -> Self {
        let expiry = client.config().synchronized_client_expiry();
        Self {
            client,
            unsynchronized_methods: HashSet::new(),
            coalescer: Coalescer::new(expiry),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.coalescer = Coalescer::new(expiry);
        self
    }

    /// Methods (RPC names or method keys) that always get their own call.
    pub fn with_unsynchronized_methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        self.unsynchronized_methods
            .extend(methods.into_iter().map(|m| method_key(m.as_ref())));
        self
    }

    pub fn client(&self) -> &Client<S> {
        &self.client
    }

    pub fn coalescer(&self) -> &Coalescer<Response> {
        &self.coalescer
    }

    /// Calls `method`, sharing the response of an identical call already in flight.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        metadata: Vec<(String, String)>,
    ) -> Result<Arc<Response>, ClientError> {
        let method = self.client.method(method)?;

        if self.unsynchronized_methods.contains(&method_key(method.name())) {
            return self
                .client
                .call_method(&method, params, metadata)
                .await
                .map(Arc::new);
        }

        let fingerprint = Fingerprint::new(method.full_name(), &params);
        self.coalescer
            .run(fingerprint, || {
                self.client.call_method(&method, params, metadata)
            })
            .await
    }
}
