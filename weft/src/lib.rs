//! A transport-agnostic RPC framework.
//!
//! `weft` multiplexes many logical streams over one connection and drives
//! the four classic call patterns over them: unary, server streaming, client
//! streaming, and bi-directional streaming. Transports are pluggable; an
//! in-memory pair, a WebSocket transport, and a gRPC-compatible HTTP/2
//! transport ship with the crate. Message encoding is pluggable per method
//! via serde-based codecs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::codec::JsonCodec;
//! use weft::server::{Responder, ServiceContract};
//! use weft::transport::memory::MemoryTransport;
//! use weft::{Caller, Request, Response, Status};
//!
//! # async fn example() -> Result<(), Status> {
//! let (caller_end, responder_end) = MemoryTransport::pair();
//!
//! let echo = ServiceContract::new("Echo").unary::<JsonCodec<String, String>, _, _>(
//!     "echo",
//!     |request: Request<String>| async move { Ok(Response::new(request.into_inner())) },
//! );
//! let _server = Responder::new(Arc::new(responder_end))
//!     .add_service(echo)?
//!     .start();
//!
//! let caller = Caller::new(Arc::new(caller_end));
//! let reply = caller
//!     .unary::<JsonCodec<String, String>>(("Echo", "echo"), Request::new("hello".into()))
//!     .await?;
//! assert_eq!(reply.into_inner(), "hello");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
#[doc(hidden)]
pub mod error;
pub mod metadata;
pub mod server;
pub mod transport;

mod request;
mod response;
mod status;

pub use client::Caller;
pub use codec::Streaming;
pub use request::{MethodPath, Request};
pub use response::Response;
pub use status::{Code, Status};

use std::pin::Pin;

/// A boxed response stream, handy as the `ResponseStream` of streaming
/// handlers.
pub type BoxStream<T> =
    Pin<Box<dyn futures_core::Stream<Item = Result<T, Status>> + Send + 'static>>;
