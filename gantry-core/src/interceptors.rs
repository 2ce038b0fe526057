//! # Built-in Interceptors
//!
//! Ready-made [`crate::interceptor::InterceptorClass`]es, registered like any other:
//!
//! ```rust,no_run
//! use gantry_core::{
//!     config::Config,
//!     interceptors::{OutputMetadataTimer, RequestLogging, RequestLoggingOptions},
//!     registry::Registration,
//!     server::Dispatcher,
//! };
//!
//! let dispatcher = Dispatcher::new(Config::default());
//! dispatcher.interceptors().register(Registration::interceptor::<RequestLogging>(
//!     RequestLoggingOptions {
//!         log_parameters: true,
//!         blocklist: vec!["card.number".to_string()],
//!         ..Default::default()
//!     },
//! ));
//! dispatcher
//!     .interceptors()
//!     .register(Registration::interceptor::<OutputMetadataTimer>(Default::default()));
//! ```
mod basic_auth;
mod output_metadata_timer;
mod request_logging;

pub use basic_auth::{BasicAuth, BasicAuthOptions, Credentials};
pub use output_metadata_timer::{OutputMetadataTimer, OutputMetadataTimerOptions};
pub use request_logging::{RequestLogging, RequestLoggingOptions};

use crate::request::Request;

/// Whether `names` lists the called method, by RPC name, method key or full method name.
fn lists_method(names: &[String], request: &Request) -> bool {
    names.iter().any(|name| {
        name == request.method().name()
            || name == request.method_key()
            || *name == request.method_name()
    })
}
