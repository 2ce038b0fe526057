//! # Per-call Request Context
//!
//! A [`Request`] is created by the dispatcher for every inbound call and handed, by mutable
//! reference, to each interceptor, hook and finally the handler. It owns:
//!
//! * the [`Call`] handle: inbound metadata, outbound metadata, deadline and response emitter;
//! * the message source: the decoded request, or a pull-based stream of requests;
//! * the call's [`Error`], filled in by [`Request::fail`];
//! * a free-form context bag interceptors use to talk to each other.
use crate::{
    config::Config,
    error::{Error, Failure, StatusKind},
    server::controller::method_key,
};
use futures_util::{Stream, StreamExt};
use prost_reflect::MethodDescriptor;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Extensions, Status,
    metadata::{Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue},
};
use tracing::warn;

/// Inbound messages of a streaming call.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Value, Status>> + Send>>;

/// The four call patterns of gRPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl RpcShape {
    pub fn of(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => RpcShape::Unary,
            (true, false) => RpcShape::ClientStreaming,
            (false, true) => RpcShape::ServerStreaming,
            (true, true) => RpcShape::BidiStreaming,
        }
    }

    pub fn streams_requests(&self) -> bool {
        matches!(self, RpcShape::ClientStreaming | RpcShape::BidiStreaming)
    }

    pub fn streams_responses(&self) -> bool {
        matches!(self, RpcShape::ServerStreaming | RpcShape::BidiStreaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcShape::Unary => "unary",
            RpcShape::ClientStreaming => "client_stream",
            RpcShape::ServerStreaming => "server_stream",
            RpcShape::BidiStreaming => "bidi_stream",
        }
    }
}

/// What a handler (or a short-circuiting interceptor) produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The single response message of a unary or client-streaming call.
    Message(Value),
    /// The responses were pushed through [`Request::emit`].
    Streamed,
}

impl Reply {
    pub fn message(&self) -> Option<&Value> {
        match self {
            Reply::Message(value) => Some(value),
            Reply::Streamed => None,
        }
    }
}

/// Push side of a response stream.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::Sender<Result<Value, Status>>,
}

impl Emitter {
    /// Creates an emitter and the stream handed to the transport.
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<Result<Value, Status>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, ReceiverStream::new(rx))
    }

    /// Sends one response message, waiting for room in the stream buffer.
    pub async fn emit(&self, message: Value) -> Result<(), Failure> {
        self.tx
            .send(Ok(message))
            .await
            .map_err(|_| Status::cancelled("The client closed the response stream").into())
    }

    /// Terminates the stream with `status`.
    pub async fn close_with(&self, status: Status) {
        // Nobody is listening anymore, there is no one left to tell.
        let _ = self.tx.send(Err(status)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The call handle: everything the transport knows about the call.
#[derive(Debug)]
pub struct Call {
    metadata: MetadataMap,
    output_metadata: MetadataMap,
    extensions: Extensions,
    deadline: Option<Instant>,
    emitter: Option<Emitter>,
}

impl Call {
    /// Builds a call from the inbound metadata, deriving the deadline from `grpc-timeout`.
    pub fn new(metadata: MetadataMap, extensions: Extensions) -> Self {
        let deadline = metadata
            .get("grpc-timeout")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);

        Self {
            metadata,
            output_metadata: MetadataMap::new(),
            extensions,
            deadline,
            emitter: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Inbound metadata (request headers).
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Metadata sent back to the client.
    pub fn output_metadata(&self) -> &MetadataMap {
        &self.output_metadata
    }

    pub fn output_metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.output_metadata
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn emitter(&self) -> Option<&Emitter> {
        self.emitter.as_ref()
    }

    /// True once the deadline elapsed or the client stopped listening to the responses.
    pub fn is_cancelled(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
            || self.emitter.as_ref().is_some_and(Emitter::is_closed)
    }

    /// Sets one outbound metadata entry. Keys ending in `-bin` are sent as binary metadata.
    ///
    /// Entries that are not valid gRPC metadata are skipped with a warning.
    pub fn set_output_metadata(&mut self, key: &str, value: &str) -> bool {
        let inserted = if key.ends_with("-bin") {
            MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map(|k| {
                    self.output_metadata
                        .insert_bin(k, MetadataValue::from_bytes(value.as_bytes()));
                })
                .is_ok()
        } else {
            match (
                MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
                MetadataValue::<Ascii>::from_str(value),
            ) {
                (Ok(k), Ok(v)) => {
                    self.output_metadata.insert(k, v);
                    true
                }
                _ => false,
            }
        };

        if !inserted {
            warn!(key, "Skipping outbound metadata entry that is not valid gRPC metadata");
        }
        inserted
    }

    pub(crate) fn merge_output_metadata(&mut self, entries: &BTreeMap<String, String>) {
        for (key, value) in entries {
            self.set_output_metadata(key, value);
        }
    }

    pub(crate) fn into_output_metadata(self) -> MetadataMap {
        self.output_metadata
    }
}

/// Copies the entries of `source` that `target` does not have yet.
pub(crate) fn merge_missing_metadata(target: &mut MetadataMap, source: &MetadataMap) {
    for entry in source.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if !target.contains_key(key.as_str()) {
                    target.insert(key.clone(), value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) => {
                if !target.contains_key(key.as_str()) {
                    target.insert_bin(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Parses a `grpc-timeout` header value (`<up to 8 digits><H|M|S|m|u|n>`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    if !amount.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = amount.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 60 * 60)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Where a handler reads its request messages from.
pub enum MessageSource {
    Single { message: Value, consumed: bool },
    Stream(MessageStream),
}

impl MessageSource {
    pub fn single(message: Value) -> Self {
        MessageSource::Single {
            message,
            consumed: false,
        }
    }

    pub fn stream(stream: impl Stream<Item = Result<Value, Status>> + Send + 'static) -> Self {
        MessageSource::Stream(Box::pin(stream))
    }
}

impl fmt::Debug for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSource::Single { message, consumed } => f
                .debug_struct("Single")
                .field("message", message)
                .field("consumed", consumed)
                .finish(),
            MessageSource::Stream(_) => f.debug_tuple("Stream").finish_non_exhaustive(),
        }
    }
}

/// The per-call request context.
#[derive(Debug)]
pub struct Request {
    method: MethodDescriptor,
    service_name: String,
    method_key: String,
    shape: RpcShape,
    call: Call,
    messages: MessageSource,
    context: HashMap<String, Value>,
    error: Error,
    config: Arc<Config>,
}

impl Request {
    pub fn new(
        method: MethodDescriptor,
        call: Call,
        messages: MessageSource,
        config: Arc<Config>,
    ) -> Self {
        let service_name = method.parent_service().full_name().to_string();
        let method_key = method_key(method.name());
        let shape = RpcShape::of(&method);

        Self {
            method,
            service_name,
            method_key,
            shape,
            call,
            messages,
            context: HashMap::new(),
            error: Error::default(),
            config,
        }
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Fully qualified service name (e.g. `catalog.Catalog`).
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// snake_case name of the method (e.g. `get_product`).
    pub fn method_key(&self) -> &str {
        &self.method_key
    }

    /// `<service>.<method_key>` (e.g. `catalog.Catalog.get_product`).
    pub fn method_name(&self) -> String {
        format!("{}.{}", self.service_name, self.method_key)
    }

    /// The HTTP/2 path of the call (e.g. `/catalog.Catalog/GetProduct`).
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service_name, self.method.name())
    }

    pub fn shape(&self) -> RpcShape {
        self.shape
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn call_mut(&mut self) -> &mut Call {
        &mut self.call
    }

    /// Shortcut for the inbound metadata.
    pub fn metadata(&self) -> &MetadataMap {
        self.call.metadata()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The request message of unary and server-streaming calls.
    pub fn message(&self) -> Option<&Value> {
        match &self.messages {
            MessageSource::Single { message, .. } => Some(message),
            MessageSource::Stream(_) => None,
        }
    }

    /// Pulls the next request message. `Ok(None)` signals the end of the stream.
    ///
    /// For single-message calls the request message is returned once.
    pub async fn next_message(&mut self) -> Result<Option<Value>, Status> {
        match &mut self.messages {
            MessageSource::Single { message, consumed } => {
                if *consumed {
                    Ok(None)
                } else {
                    *consumed = true;
                    Ok(Some(message.clone()))
                }
            }
            MessageSource::Stream(stream) => stream.next().await.transpose(),
        }
    }

    /// Drains the remaining request messages.
    pub async fn collect_messages(&mut self) -> Result<Vec<Value>, Status> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Pushes one response message of a server-streaming or bidirectional call.
    ///
    /// The returned future does not borrow the request.
    pub fn emit(
        &self,
        message: Value,
    ) -> impl Future<Output = Result<(), Failure>> + Send + 'static {
        let emitter = self.call.emitter().cloned();
        let method_name = self.method_name();

        async move {
            match emitter {
                Some(emitter) => emitter.emit(message).await,
                None => Err(Status::internal(format!(
                    "Method '{method_name}' does not stream responses"
                ))
                .into()),
            }
        }
    }

    pub fn context(&self) -> &HashMap<String, Value> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.context
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn error_mut(&mut self) -> &mut Error {
        &mut self.error
    }

    /// Fails the call: fills in the call's error, attaches it to the outbound metadata and
    /// returns the mapped transport status. The error's current metadata is kept.
    ///
    /// An error too large for the outbound metadata fails the call as `internal` instead.
    ///
    /// `app_code` defaults to the status kind name.
    pub fn fail(
        &mut self,
        code: StatusKind,
        app_code: Option<&str>,
        message: impl Into<String>,
    ) -> Failure {
        Failure::Status(self.fail_status(code, app_code, message))
    }

    /// Like [`Request::fail`], replacing the error's metadata with `metadata` first.
    pub fn fail_with_metadata<K, V>(
        &mut self,
        code: StatusKind,
        app_code: Option<&str>,
        message: impl Into<String>,
        metadata: impl IntoIterator<Item = (K, V)>,
    ) -> Failure
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.error.set_metadata(metadata);
        self.fail(code, app_code, message)
    }

    pub(crate) fn fail_status(
        &mut self,
        code: StatusKind,
        app_code: Option<&str>,
        message: impl Into<String>,
    ) -> Status {
        self.error.set_code(code);
        self.error.set_app_code(app_code.map(str::to_string));
        self.error.set_message(message);
        match self.error.attach_to_call(&mut self.call, &self.config) {
            Some(replacement) => replacement.to_status(&self.call),
            None => self.error.to_status(&self.call),
        }
    }

    pub(crate) fn into_call(self) -> Call {
        self.call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn method(name: &str) -> MethodDescriptor {
        catalog_service::catalog_service()
            .methods()
            .find(|m| m.name() == name)
            .unwrap()
    }

    fn request(name: &str, messages: MessageSource) -> Request {
        Request::new(
            method(name),
            Call::new(MetadataMap::new(), Extensions::default()),
            messages,
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn test_identity_fields() {
        let request = request("GetProduct", MessageSource::single(json!({ "sku": "A1" })));

        assert_eq!(request.service_name(), "catalog.Catalog");
        assert_eq!(request.method_key(), "get_product");
        assert_eq!(request.method_name(), "catalog.Catalog.get_product");
        assert_eq!(request.path(), "/catalog.Catalog/GetProduct");
        assert_eq!(request.shape(), RpcShape::Unary);
        assert_eq!(request.message(), Some(&json!({ "sku": "A1" })));
    }

    #[test]
    fn test_shapes_follow_descriptor_flags() {
        assert_eq!(RpcShape::of(&method("ImportProducts")), RpcShape::ClientStreaming);
        assert_eq!(RpcShape::of(&method("ListProducts")), RpcShape::ServerStreaming);
        assert_eq!(RpcShape::of(&method("SyncProducts")), RpcShape::BidiStreaming);
    }

    #[tokio::test]
    async fn test_stream_source_ends_cleanly() {
        let items = vec![Ok(json!({ "sku": "A" })), Ok(json!({ "sku": "B" }))];
        let mut request = request(
            "ImportProducts",
            MessageSource::stream(stream::iter(items)),
        );

        assert_eq!(request.message(), None);
        assert_eq!(request.next_message().await.unwrap(), Some(json!({ "sku": "A" })));
        assert_eq!(request.next_message().await.unwrap(), Some(json!({ "sku": "B" })));
        assert_eq!(request.next_message().await.unwrap(), None);
        assert_eq!(request.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_source_yields_once() {
        let mut request = request("GetProduct", MessageSource::single(json!({ "sku": "A" })));
        assert_eq!(request.collect_messages().await.unwrap(), vec![json!({ "sku": "A" })]);
        assert_eq!(request.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_emit_without_response_stream_fails() {
        let request = request("GetProduct", MessageSource::single(json!({})));
        let failure = request.emit(json!({})).await.unwrap_err();
        assert_eq!(failure.status().unwrap().code(), tonic::Code::Internal);
    }

    #[test]
    fn test_fail_fills_error_and_status() {
        let mut request = request("GetProduct", MessageSource::single(json!({})));
        request.error_mut().add_field_error("sku", "blank", "SKU can't be blank");

        let failure = request.fail_with_metadata(
            StatusKind::InvalidArgument,
            Some("invalid_sku"),
            "Invalid SKU",
            [("attempt", 3)],
        );

        let status = failure.status().unwrap();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "Invalid SKU");
        assert_eq!(status.metadata().get("attempt").unwrap(), "3");
        assert!(status.metadata().get_bin("error-internal-bin").is_some());
        assert_eq!(request.error().app_code(), "invalid_sku");
        assert!(request.error().has_field_errors());
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("1x"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
    }

    #[test]
    fn test_output_metadata_skips_invalid_entries() {
        let mut call = Call::new(MetadataMap::new(), Extensions::default());
        assert!(call.set_output_metadata("x-ok", "fine"));
        assert!(!call.set_output_metadata("bad key", "value"));
        assert!(!call.set_output_metadata("x-bad-value", "line\nbreak"));
        assert!(call.set_output_metadata("x-blob-bin", "anything\ngoes"));
        assert_eq!(call.output_metadata().len(), 2);
    }

    #[test]
    fn test_call_reads_deadline_from_grpc_timeout() {
        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "100m".parse().unwrap());
        let call = Call::new(metadata, Extensions::default());
        assert!(call.deadline().is_some());
        assert!(!call.is_cancelled());
    }
}
