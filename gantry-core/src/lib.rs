//! # Gantry Core
//!
//! `gantry-core` sits between `tonic` and the request handlers of a gRPC service. It lets
//! handler authors attach ordered, composable units of cross-cutting behavior to every call,
//! propagate structured application errors over the wire as trailing metadata, serve all
//! four RPC shapes through one handler abstraction, and coalesce identical outbound calls.
//!
//! Messages are dynamic: requests and responses travel as `serde_json::Value`s that are
//! validated against `prost_reflect` descriptors on the fly, so no generated Rust types are
//! needed to serve or call a service.
//!
//! ## Key Components
//!
//! * **[`server::Dispatcher`]:** A `tower` service that routes inbound calls to bound
//!   [`server::Controller`]s and runs each call through the interceptor pipeline.
//! * **[`registry::Registry`]:** Ordered, thread-safe registration of interceptors and hooks.
//! * **[`interceptor::Interceptor`] & [`hooks::Hook`]:** The two ways of wrapping a call. Hooks
//!   are executed as named phases of the same chain the interceptors form.
//! * **[`error::Error`]:** The structured error attached to every call and serialized into the
//!   trailing metadata when the call fails.
//! * **[`client::Client`] & [`client::SynchronizedClient`]:** Dynamic outbound clients, the latter
//!   collapsing concurrent identical calls into a single request.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gantry_core::{
//!     config::Config,
//!     error::Failure,
//!     handler::Handler,
//!     request::{Reply, Request},
//!     server::{Controller, Dispatcher},
//! };
//!
//! struct GetProduct;
//!
//! #[tonic::async_trait]
//! impl Handler for GetProduct {
//!     async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
//!         let sku = request.message().and_then(|m| m["sku"].as_str()).unwrap_or_default();
//!         Ok(Reply::Message(serde_json::json!({ "sku": sku })))
//!     }
//! }
//!
//! # fn run(service: prost_reflect::ServiceDescriptor) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(Config::default());
//! dispatcher.bind(&service, &Controller::new().handle("get_product", GetProduct))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports `prost-reflect` and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod handler;
pub mod hooks;
pub mod interceptor;
pub mod interceptors;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod server;
pub mod timer;

// Re-exports
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
