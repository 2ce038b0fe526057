//! # Interceptors
//!
//! An interceptor wraps the rest of the call chain. It receives the [`Request`] and a [`Next`]
//! continuation and decides what happens:
//!
//! * call `next.run(request)` once to proceed, optionally acting before and after;
//! * return early without running `next` to short-circuit the chain (the handler is skipped);
//! * return a [`Failure`] to abort the call.
//!
//! `Next` is consumed by `run`, so the rest of the chain executes at most once per interceptor.
use crate::{
    error::Failure,
    handler::Handler,
    request::{Reply, Request},
};
use futures_util::future::BoxFuture;

#[tonic::async_trait]
pub trait Interceptor: Send + Sync {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure>;
}

/// An interceptor type that can be registered in a [`crate::registry::Registry`].
///
/// A fresh instance is built for every call from the registration options, so instances may
/// keep per-call state.
pub trait InterceptorClass: Interceptor + Sized + 'static {
    type Options: Send + Sync + 'static;

    fn build(request: &Request, options: &Self::Options) -> Self;
}

/// The remainder of the chain after the current interceptor.
pub struct Next<'a> {
    rest: &'a [Box<dyn Interceptor>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Box<dyn Interceptor>], handler: &'a dyn Handler) -> Self {
        Self { rest, handler }
    }

    /// Runs the rest of the chain: the next interceptor, or the handler when none is left.
    pub fn run(self, request: &'a mut Request) -> BoxFuture<'a, Result<Reply, Failure>> {
        match self.rest.split_first() {
            Some((current, rest)) => current.call(request, Next::new(rest, self.handler)),
            None => self.handler.handle(request),
        }
    }
}
