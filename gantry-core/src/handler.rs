//! The terminal stage of every call.
use crate::{
    error::Failure,
    request::{Reply, Request},
};

/// Serves one method of a service.
///
/// Unary and client-streaming handlers return [`Reply::Message`]. Server-streaming and
/// bidirectional handlers push their responses with [`Request::emit`] and return
/// [`Reply::Streamed`].
#[tonic::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure>;
}

/// Adapts an async function into a [`Handler`].
///
/// The function receives the request by mutable reference and returns a boxed future borrowing
/// it, so plain closures can serve a method:
///
/// ```rust,no_run
/// use gantry_core::{error::Failure, handler::handler_fn, request::Reply};
///
/// let handler = handler_fn(|request| {
///     Box::pin(async move {
///         let count = request.collect_messages().await?.len();
///         Ok::<_, Failure>(Reply::Message(serde_json::json!({ "imported": count })))
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Request) -> futures_util::future::BoxFuture<'a, Result<Reply, Failure>>
        + Send
        + Sync,
{
    HandlerFn(f)
}

/// See [`handler_fn`].
pub struct HandlerFn<F>(F);

#[tonic::async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut Request) -> futures_util::future::BoxFuture<'a, Result<Reply, Failure>>
        + Send
        + Sync,
{
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        (self.0)(request).await
    }
}
