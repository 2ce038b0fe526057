//! # Dispatcher
//!
//! The [`Dispatcher`] is the inbound side of the crate: a `tower` service that routes gRPC
//! calls by path to the handler bound for the method and runs every call through the
//! interceptor pipeline.
//!
//! It can be driven by anything that speaks `http::Request`/`http::Response`, including
//! a `tonic` client directly, which is how the integration tests exercise it in memory.
//!
//! ## Binding
//!
//! [`Dispatcher::bind`] walks every method of a service descriptor and looks up the handler
//! under its snake_case key in a [`Controller`]. A service is either bound completely or not
//! at all. Binding the same service again replaces its routes.
pub mod controller;
mod shapes;

pub use controller::{Controller, method_key};
pub use shapes::RESPONSE_STREAM_BUFFER;

use crate::{
    BoxError,
    config::Config,
    grpc::codec::JsonCodec,
    handler::Handler,
    hooks::Hook,
    interceptor::Interceptor,
    registry::Registry,
    request::RpcShape,
};
use http_body::Body as HttpBody;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use shapes::{BidiStreaming, ClientStreaming, Endpoint, ServerStreaming, Unary};
use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    sync::{Arc, PoisonError, RwLock},
    task::{Context, Poll},
};
use tonic::codegen::{BoxFuture, Service};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("No handler '{key}' for method '{method}' of service '{service}'")]
    MissingHandler {
        service: String,
        method: String,
        key: String,
    },
}

pub(crate) struct Route {
    method: MethodDescriptor,
    shape: RpcShape,
    handler: Arc<dyn Handler>,
}

pub(crate) struct Inner {
    config: Arc<Config>,
    interceptors: Registry<dyn Interceptor>,
    hooks: Registry<dyn Hook>,
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

/// Routes inbound calls to bound handlers. Cloning is cheap: clones share the same routes
/// and registries.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes())
            .field("interceptors", &self.inner.interceptors)
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        Self::with_config(Arc::new(config))
    }

    pub fn with_config(config: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                interceptors: Registry::new(),
                hooks: Registry::new(),
                routes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Interceptors run around every call, first registered outermost.
    pub fn interceptors(&self) -> &Registry<dyn Interceptor> {
        &self.inner.interceptors
    }

    /// Hooks run inside the interceptors, around every call.
    pub fn hooks(&self) -> &Registry<dyn Hook> {
        &self.inner.hooks
    }

    /// Bound gRPC paths, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .inner
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        routes.sort();
        routes
    }

    /// Binds every method of `service` to the controller's handler of the same key.
    ///
    /// Fails without binding anything when a method has no handler.
    pub fn bind(
        &self,
        service: &ServiceDescriptor,
        controller: &Controller,
    ) -> Result<(), BindError> {
        let bindings = service
            .methods()
            .map(|method| {
                let key = method_key(method.name());
                match controller.handler(&key) {
                    Some(handler) => Ok((method, handler)),
                    None => Err(BindError::MissingHandler {
                        service: service.full_name().to_string(),
                        method: method.name().to_string(),
                        key,
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (method, handler) in bindings {
            self.bind_method(method, handler);
        }

        info!(service = service.full_name(), "Bound service");
        Ok(())
    }

    /// Binds a single method, replacing any handler bound for it before.
    pub fn bind_method(&self, method: MethodDescriptor, handler: Arc<dyn Handler>) {
        let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
        let route = Route {
            shape: RpcShape::of(&method),
            method,
            handler,
        };

        debug!(path, shape = route.shape.as_str(), "Binding method");
        self.inner
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, Arc::new(route));
    }

    fn route(&self, path: &str) -> Option<Arc<Route>> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

impl<B> Service<http::Request<B>> for Dispatcher
where
    B: HttpBody + Send + 'static,
    B::Error: Into<BoxError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(route) = self.route(req.uri().path()) else {
            debug!(path = req.uri().path(), "No route for call");
            return Box::pin(async { Ok(unimplemented()) });
        };

        let codec = JsonCodec::server(&route.method);
        let shape = route.shape;
        let endpoint = Endpoint {
            inner: Arc::clone(&self.inner),
            route,
        };

        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(codec);
            let response = match shape {
                RpcShape::Unary => grpc.unary(Unary(endpoint), req).await,
                RpcShape::ClientStreaming => {
                    grpc.client_streaming(ClientStreaming(endpoint), req).await
                }
                RpcShape::ServerStreaming => {
                    grpc.server_streaming(ServerStreaming(endpoint), req).await
                }
                RpcShape::BidiStreaming => grpc.streaming(BidiStreaming(endpoint), req).await,
            };
            Ok(response)
        })
    }
}

fn unimplemented() -> http::Response<tonic::body::Body> {
    let mut response = http::Response::new(tonic::body::Body::default());
    let headers = response.headers_mut();
    headers.insert(
        tonic::Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Failure,
        request::{Reply, Request},
    };

    struct Noop;

    #[tonic::async_trait]
    impl Handler for Noop {
        async fn handle(&self, _request: &mut Request) -> Result<Reply, Failure> {
            Ok(Reply::Streamed)
        }
    }

    fn full_controller() -> Controller {
        Controller::new()
            .handle("get_product", Noop)
            .handle("ImportProducts", Noop)
            .handle("list_products", Noop)
            .handle("sync_products", Noop)
    }

    #[test]
    fn test_bind_routes_every_method() {
        let dispatcher = Dispatcher::new(Config::default());
        dispatcher
            .bind(&catalog_service::catalog_service(), &full_controller())
            .unwrap();

        assert_eq!(
            dispatcher.routes(),
            vec![
                "/catalog.Catalog/GetProduct",
                "/catalog.Catalog/ImportProducts",
                "/catalog.Catalog/ListProducts",
                "/catalog.Catalog/SyncProducts",
            ]
        );

        // Rebinding replaces the routes.
        dispatcher
            .bind(&catalog_service::catalog_service(), &full_controller())
            .unwrap();
        assert_eq!(dispatcher.routes().len(), 4);
    }

    #[test]
    fn test_bind_refuses_incomplete_controllers() {
        let dispatcher = Dispatcher::new(Config::default());
        let controller = Controller::new()
            .handle("get_product", Noop)
            .handle("list_products", Noop);

        let err = dispatcher
            .bind(&catalog_service::catalog_service(), &controller)
            .unwrap_err();

        assert_eq!(
            err,
            BindError::MissingHandler {
                service: "catalog.Catalog".to_string(),
                method: "ImportProducts".to_string(),
                key: "import_products".to_string(),
            }
        );
        assert!(dispatcher.routes().is_empty());
    }
}
