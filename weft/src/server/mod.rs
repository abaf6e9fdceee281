//! Responder endpoint: registers service contracts and dispatches inbound
//! streams to their handlers.
//!
//! Contracts are plain tables built at runtime: each method pairs a call
//! kind with a codec and an async handler. The dispatcher extracts the
//! `/Service/Method` path from a stream's first message, instantiates the
//! matching driver, and feeds it the remaining messages.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{Codec, Streaming};
use crate::metadata::{self, parse_grpc_timeout, MetadataMap};
use crate::request::MethodPath;
use crate::transport::{InboundMessages, InboundStream, Transport};
use crate::{Request, Response, Status};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type ErasedHandler = Arc<dyn Fn(CallContext) -> BoxFuture<()> + Send + Sync + 'static>;

/// The four call kinds a method can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Streaming,
}

/// The named collection of methods a service exposes.
///
/// Service names are unique per endpoint and method names unique per
/// service; the codec and handler of each method are fixed at construction.
pub struct ServiceContract {
    name: String,
    methods: HashMap<String, Method>,
}

struct Method {
    kind: MethodKind,
    run: ErasedHandler,
}

impl ServiceContract {
    /// Create an empty contract for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        ServiceContract {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of `method`, if registered.
    pub fn method_kind(&self, method: &str) -> Option<MethodKind> {
        self.methods.get(method).map(|m| m.kind)
    }

    fn insert(mut self, method: &str, kind: MethodKind, run: ErasedHandler) -> Self {
        let replaced = self.methods.insert(method.to_string(), Method { kind, run });
        assert!(
            replaced.is_none(),
            "method {:?} registered twice on service {:?}",
            method,
            self.name,
        );
        self
    }

    /// Register a unary method: one request, one response.
    pub fn unary<C, F, Fut>(self, method: &str, handler: F) -> Self
    where
        C: Codec,
        F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodKind::Unary,
            Arc::new(move |ctx| -> BoxFuture<()> {
                Box::pin(run_unary::<C, F, Fut>(ctx, handler.clone()))
            }),
        )
    }

    /// Register a server streaming method: one request, a response stream.
    pub fn server_streaming<C, F, Fut, S>(self, method: &str, handler: F) -> Self
    where
        C: Codec,
        F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
        S: Stream<Item = Result<C::Encode, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodKind::ServerStreaming,
            Arc::new(move |ctx| -> BoxFuture<()> {
                Box::pin(run_server_streaming::<C, F, Fut, S>(ctx, handler.clone()))
            }),
        )
    }

    /// Register a client streaming method: a request stream, one response.
    pub fn client_streaming<C, F, Fut>(self, method: &str, handler: F) -> Self
    where
        C: Codec,
        F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodKind::ClientStreaming,
            Arc::new(move |ctx| -> BoxFuture<()> {
                Box::pin(run_client_streaming::<C, F, Fut>(ctx, handler.clone()))
            }),
        )
    }

    /// Register a bi-directional streaming method.
    pub fn streaming<C, F, Fut, S>(self, method: &str, handler: F) -> Self
    where
        C: Codec,
        F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
        S: Stream<Item = Result<C::Encode, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(
            method,
            MethodKind::Streaming,
            Arc::new(move |ctx| -> BoxFuture<()> {
                Box::pin(run_streaming::<C, F, Fut, S>(ctx, handler.clone()))
            }),
        )
    }
}

impl std::fmt::Debug for ServiceContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContract")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A responder endpoint: a transport plus a table of service contracts.
pub struct Responder {
    transport: Arc<dyn Transport>,
    services: HashMap<String, ServiceContract>,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Responder {
            transport,
            services: HashMap::new(),
        }
    }

    /// Register a service contract. Registering a second contract with the
    /// same service name fails with [`crate::Code::AlreadyExists`].
    pub fn add_service(mut self, contract: ServiceContract) -> Result<Self, Status> {
        if self.services.contains_key(contract.name()) {
            return Err(Status::already_exists(format!(
                "service {:?} already registered",
                contract.name()
            )));
        }
        self.services.insert(contract.name().to_string(), contract);
        Ok(self)
    }

    /// Accept and dispatch inbound streams until the transport closes.
    pub async fn serve(self) {
        let services = Arc::new(self.services);
        while let Some(inbound) = self.transport.accept().await {
            let transport = self.transport.clone();
            let services = services.clone();
            tokio::spawn(dispatch(transport, services, inbound));
        }
    }

    /// Start serving on a background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn dispatch(
    transport: Arc<dyn Transport>,
    services: Arc<HashMap<String, ServiceContract>>,
    inbound: InboundStream,
) {
    let first = inbound.first;
    let stream_id = first.stream_id;
    let initial = first.metadata.unwrap_or_default();
    let replier = Replier::new(transport.clone(), stream_id);

    let raw_path = first
        .method_path
        .or_else(|| initial.get(metadata::PATH).map(str::to_string));
    let path = match raw_path.as_deref().and_then(MethodPath::parse) {
        Some(path) => path,
        None => {
            debug!(stream_id, "stream opened without a method path");
            replier
                .send_trailer(Status::invalid_argument("missing or malformed method path"))
                .await;
            return;
        }
    };

    let method = services
        .get(path.service())
        .and_then(|service| service.methods.get(path.method()));
    let method = match method {
        Some(method) => method,
        None => {
            debug!(%path, "no handler registered");
            replier
                .send_trailer(Status::unimplemented(format!("unknown method {path}")))
                .await;
            return;
        }
    };

    let ctx = CallContext {
        initial,
        messages: inbound.messages,
        ended: first.end_of_stream,
        replier,
    };
    (*method.run)(ctx).await;
    transport.release_stream_id(stream_id).await;
}

// Everything a driver needs to run one accepted call.
struct CallContext {
    initial: MetadataMap,
    messages: InboundMessages,
    ended: bool,
    replier: Replier,
}

impl CallContext {
    fn deadline(&self) -> Option<Duration> {
        let raw = self.initial.get(metadata::GRPC_TIMEOUT)?;
        match parse_grpc_timeout(raw) {
            Ok(timeout) => Some(timeout),
            Err(_) => {
                warn!("ignoring malformed grpc-timeout {:?}", raw);
                None
            }
        }
    }

    fn into_parts<C: Codec>(self) -> (MetadataMap, Option<Duration>, Streaming<C::Decode>, Replier) {
        let deadline = self.deadline();
        let mut codec = C::default();
        let requests = Streaming::new_request(
            self.messages,
            Box::new(move |bytes| codec.decode(bytes)),
            self.ended,
        );
        (self.initial, deadline, requests, self.replier)
    }
}

// Outbound half of an accepted call; keeps the metadata/data/trailer
// ordering and makes the trailer idempotent.
struct Replier {
    transport: Arc<dyn Transport>,
    stream_id: u32,
    sent_initial: AtomicBool,
    sent_trailer: AtomicBool,
}

impl Replier {
    fn new(transport: Arc<dyn Transport>, stream_id: u32) -> Self {
        Replier {
            transport,
            stream_id,
            sent_initial: AtomicBool::new(false),
            sent_trailer: AtomicBool::new(false),
        }
    }

    async fn send_initial(&self, metadata: MetadataMap) -> Result<(), Status> {
        if self.sent_initial.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .send_metadata(self.stream_id, metadata, false)
            .await
    }

    async fn send_payload(&self, bytes: bytes::Bytes) -> Result<(), Status> {
        self.transport
            .send_message(self.stream_id, bytes, false)
            .await
    }

    async fn send_trailer(&self, status: Status) {
        if self.sent_trailer.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sent_initial.store(true, Ordering::SeqCst);
        let trailer = status.to_metadata();
        if let Err(err) = self
            .transport
            .send_metadata(self.stream_id, trailer, true)
            .await
        {
            debug!(stream_id = self.stream_id, "failed to send trailer: {}", err);
        }
    }
}

async fn run_unary<C, F, Fut>(ctx: CallContext, handler: Arc<F>)
where
    C: Codec,
    F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
{
    let (initial, deadline, mut requests, replier) = ctx.into_parts::<C>();

    let result = with_deadline(deadline, async {
        let message = requests
            .message()
            .await?
            .ok_or_else(|| Status::internal("missing request message"))?;
        invoke((*handler)(Request::from_parts(initial, message))).await
    })
    .await;

    respond_single::<C>(&replier, result).await;
}

async fn run_server_streaming<C, F, Fut, S>(ctx: CallContext, handler: Arc<F>)
where
    C: Codec,
    F: Fn(Request<C::Decode>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
    S: Stream<Item = Result<C::Encode, Status>> + Send + 'static,
{
    let (initial, deadline, mut requests, replier) = ctx.into_parts::<C>();

    let result = with_deadline(deadline, async {
        let message = requests
            .message()
            .await?
            .ok_or_else(|| Status::internal("missing request message"))?;
        let response = invoke((*handler)(Request::from_parts(initial, message))).await?;
        pump_responses::<C, S>(&replier, response).await
    })
    .await;

    finish(&replier, result).await;
}

async fn run_client_streaming<C, F, Fut>(ctx: CallContext, handler: Arc<F>)
where
    C: Codec,
    F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<C::Encode>, Status>> + Send + 'static,
{
    let (initial, deadline, requests, replier) = ctx.into_parts::<C>();

    let result = with_deadline(deadline, async {
        invoke((*handler)(Request::from_parts(initial, requests))).await
    })
    .await;

    respond_single::<C>(&replier, result).await;
}

async fn run_streaming<C, F, Fut, S>(ctx: CallContext, handler: Arc<F>)
where
    C: Codec,
    F: Fn(Request<Streaming<C::Decode>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<S>, Status>> + Send + 'static,
    S: Stream<Item = Result<C::Encode, Status>> + Send + 'static,
{
    let (initial, deadline, requests, replier) = ctx.into_parts::<C>();

    let result = with_deadline(deadline, async {
        let response = invoke((*handler)(Request::from_parts(initial, requests))).await?;
        pump_responses::<C, S>(&replier, response).await
    })
    .await;

    finish(&replier, result).await;
}

// Send initial metadata, one encoded response, and an OK trailer; any error
// along the way becomes the trailer status instead.
async fn respond_single<C: Codec>(replier: &Replier, result: Result<Response<C::Encode>, Status>) {
    let status = async {
        let response = result?;
        let (metadata, message) = response.into_parts();
        let bytes = C::default().encode(&message)?;

        replier.send_initial(with_content_type::<C>(metadata)).await?;
        replier.send_payload(bytes).await?;
        Ok(())
    }
    .await;

    finish(replier, status).await;
}

// Send initial metadata and every yielded response; an Err item aborts the
// stream and becomes the trailer status.
async fn pump_responses<C, S>(replier: &Replier, response: Response<S>) -> Result<(), Status>
where
    C: Codec,
    S: Stream<Item = Result<C::Encode, Status>> + Send + 'static,
{
    let (metadata, stream) = response.into_parts();
    replier.send_initial(with_content_type::<C>(metadata)).await?;

    let mut codec = C::default();
    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        let bytes = codec.encode(&item?)?;
        replier.send_payload(bytes).await?;
    }
    Ok(())
}

async fn finish(replier: &Replier, result: Result<(), Status>) {
    match result {
        Ok(()) => replier.send_trailer(Status::ok("")).await,
        Err(status) => replier.send_trailer(status).await,
    }
}

fn with_content_type<C: Codec>(mut metadata: MetadataMap) -> MetadataMap {
    if !metadata.contains_key(metadata::CONTENT_TYPE) {
        metadata.insert(
            metadata::CONTENT_TYPE,
            format!("application/grpc+{}", C::NAME),
        );
    }
    metadata
}

// Run the handler future, turning a panic into a sanitised internal error.
async fn invoke<T>(fut: impl Future<Output = Result<T, Status>>) -> Result<T, Status> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("handler panicked");
            Err(Status::internal("handler panicked"))
        }
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match deadline {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("deadline elapsed")),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    #[test]
    fn duplicate_service_registration_is_already_exists() {
        let transport = Arc::new(crate::transport::memory::MemoryTransport::pair().1);
        let responder = Responder::new(transport)
            .add_service(ServiceContract::new("Echo"))
            .unwrap();

        let err = responder
            .add_service(ServiceContract::new("Echo"))
            .err()
            .expect("duplicate accepted");
        assert_eq!(err.code(), crate::Code::AlreadyExists);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_method_registration_panics() {
        let echo = |request: Request<String>| async move {
            Ok(Response::new(request.into_inner()))
        };
        let _ = ServiceContract::new("Echo")
            .unary::<JsonCodec<String, String>, _, _>("echo", echo)
            .unary::<JsonCodec<String, String>, _, _>("echo", echo);
    }
}
