//! # Execution Pipeline
//!
//! [`execute`] runs one call through the whole chain:
//!
//! 1. fresh instances of the registered interceptors, outermost first;
//! 2. the hook phases (see [`crate::hooks`]);
//! 3. the handler, bounded by the call deadline.
//!
//! Failures are sorted out once, at the very top. A [`Failure::Status`] is returned as-is. A
//! [`Failure::Unexpected`] or a panic is logged and converted into an `internal` error with
//! app code `unknown`, which is attached to the call like any other failure.
use crate::{
    error::{Failure, StatusKind},
    handler::Handler,
    hooks::{self, Hook},
    interceptor::{Interceptor, Next},
    registry::Registry,
    request::{Reply, Request},
};
use futures_util::FutureExt;
use std::{any::Any, backtrace::Backtrace, panic::AssertUnwindSafe, sync::Arc};
use tonic::Status;
use tracing::error;

/// App code of errors produced by unexpected failures.
pub const UNEXPECTED_APP_CODE: &str = "unknown";

/// Runs `request` through the interceptors, the hooks and finally `handler`.
pub async fn execute(
    request: &mut Request,
    interceptors: &Registry<dyn Interceptor>,
    hooks: &Registry<dyn Hook>,
    handler: &dyn Handler,
) -> Result<Reply, Status> {
    let mut chain = interceptors.prepare(request);
    chain.extend(hooks::phases(hooks.prepare(request)));
    let handler = Deadline(handler);

    let outcome = AssertUnwindSafe(Next::new(&chain, &handler).run(request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(Failure::Status(status))) => Err(status),
        Ok(Err(Failure::Unexpected(err))) => {
            let trace = source_chain(err.as_ref());
            Err(internal(request, err.to_string(), trace))
        }
        Err(panic) => Err(internal(request, panic_message(panic.as_ref()), Vec::new())),
    }
}

/// Bounds the handler by the call deadline, if any.
struct Deadline<'a>(&'a dyn Handler);

#[tonic::async_trait]
impl<'a> Handler for Deadline<'a> {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        let Some(deadline) = request.call().deadline() else {
            return self.0.handle(request).await;
        };

        let outcome = tokio::time::timeout_at(deadline, self.0.handle(request)).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(request.fail(StatusKind::DeadlineExceeded, None, "Deadline exceeded")),
        }
    }
}

fn internal(request: &mut Request, message: String, mut trace: Vec<String>) -> Status {
    let config = Arc::clone(request.config());
    error!(
        method = %request.method_name(),
        error = %message,
        "Unexpected failure while handling call"
    );

    if config.backtrace_on_error {
        let backtrace = Backtrace::force_capture().to_string();
        trace.extend(
            backtrace
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
        trace.truncate(config.backtrace_limit);
        request.error_mut().set_debug_info(message.clone(), trace);
    }

    let message = if config.use_exception_message {
        message
    } else {
        config.internal_error_message.clone()
    };

    request.fail_status(StatusKind::Internal, Some(UNEXPECTED_APP_CODE), message)
}

fn source_chain(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    chain
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}
