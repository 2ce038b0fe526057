//! # Hooks
//!
//! Hooks are the stage-based alternative to interceptors. A hook overrides any of four named
//! extension points:
//!
//! * `outer_around`: wraps everything else, including the other hooks' stages;
//! * `before`: runs sequentially, in registration order, before the handler;
//! * `around`: wraps the handler body;
//! * `after`: runs sequentially, in registration order, with the outcome of the call.
//!
//! Hooks are not a second pipeline. [`phases`] turns the prepared hooks into interceptors
//! appended after the user interceptors, so a call goes through:
//!
//! ```text
//! interceptors -> outer_around (last registered outermost) -> before -> around (last
//! registered outermost) -> handler -> after
//! ```
//!
//! `after` hooks run whatever happened further in: a failing `before`, `around` or handler
//! still drives them, and `outer_around` still sees the failure on its way out.
use crate::{
    error::Failure,
    interceptor::{Interceptor, Next},
    request::{Reply, Request},
};
use std::sync::Arc;

#[tonic::async_trait]
pub trait Hook: Send + Sync {
    /// Runs before the handler. A failure skips the remaining `before` hooks, the `around`
    /// stages and the handler, but not the `after` hooks.
    async fn before(&self, _request: &mut Request) -> Result<(), Failure> {
        Ok(())
    }

    /// Wraps the handler body.
    async fn around(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        next.run(request).await
    }

    /// Wraps every other hook stage.
    async fn outer_around(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        next.run(request).await
    }

    /// Runs once the call completed, successfully or not.
    async fn after(&self, _request: &mut Request, _outcome: &Result<Reply, Failure>) {}
}

/// A hook type that can be registered in a [`crate::registry::Registry`].
pub trait HookClass: Hook + Sized + 'static {
    type Options: Send + Sync + 'static;

    fn build(request: &Request, options: &Self::Options) -> Self;
}

/// Lays the prepared hooks out as interceptors, outermost first.
pub fn phases(hooks: Vec<Box<dyn Hook>>) -> Vec<Box<dyn Interceptor>> {
    if hooks.is_empty() {
        return Vec::new();
    }

    let hooks: Vec<Arc<dyn Hook>> = hooks.into_iter().map(Arc::from).collect();
    let mut phases: Vec<Box<dyn Interceptor>> = Vec::with_capacity(hooks.len() * 2 + 1);

    for hook in hooks.iter().rev() {
        phases.push(Box::new(OuterAroundPhase(Arc::clone(hook))));
    }
    phases.push(Box::new(BeforeAfterPhase(hooks.clone())));
    for hook in hooks.iter().rev() {
        phases.push(Box::new(AroundPhase(Arc::clone(hook))));
    }

    phases
}

struct OuterAroundPhase(Arc<dyn Hook>);

#[tonic::async_trait]
impl Interceptor for OuterAroundPhase {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        self.0.outer_around(request, next).await
    }
}

struct AroundPhase(Arc<dyn Hook>);

#[tonic::async_trait]
impl Interceptor for AroundPhase {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        self.0.around(request, next).await
    }
}

struct BeforeAfterPhase(Vec<Arc<dyn Hook>>);

#[tonic::async_trait]
impl Interceptor for BeforeAfterPhase {
    async fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Reply, Failure> {
        let mut before = Ok(());
        for hook in &self.0 {
            before = hook.before(request).await;
            if before.is_err() {
                break;
            }
        }

        let outcome = match before {
            Ok(()) => next.run(request).await,
            Err(failure) => Err(failure),
        };

        for hook in &self.0 {
            hook.after(request, &outcome).await;
        }

        outcome
    }
}
