//! Byte-frame transports.
//!
//! A transport multiplexes many logical streams over one connection: it
//! exposes per-stream sends of metadata, payload, and end-of-stream, and
//! demultiplexes inbound traffic into per-stream message sequences plus an
//! acceptance queue for remotely initiated streams.
//!
//! Three implementations are provided: an in-memory cross-wired pair (tests
//! and in-process fan-out), a WebSocket transport carrying the
//! [`TransportMessage`] envelope, and a gRPC-compatible HTTP/2 transport.

pub mod http2;
pub mod memory;
pub mod ws;

mod demux;

pub(crate) use self::demux::Demux;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metadata::MetadataMap;
use crate::Status;

/// Default bound of each per-stream inbound queue. When a consumer lags this
/// far behind, the connection reader suspends: backpressure.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// The unit exchanged by a transport.
///
/// A message is either metadata-bearing or payload-bearing; the first message
/// on any stream always carries metadata, and `end_of_stream` may ride on any
/// message (including one carrying neither field: a bare end marker).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub stream_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Bytes>,
    #[serde(default)]
    pub end_of_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_path: Option<String>,
}

impl TransportMessage {
    /// A metadata-only message; `method_path` mirrors `:path` when present.
    pub fn metadata(stream_id: u32, metadata: MetadataMap, end_of_stream: bool) -> Self {
        let method_path = metadata.get(crate::metadata::PATH).map(str::to_string);
        TransportMessage {
            stream_id,
            metadata: Some(metadata),
            payload: None,
            end_of_stream,
            method_path,
        }
    }

    /// A payload-bearing message.
    pub fn payload(stream_id: u32, payload: Bytes, end_of_stream: bool) -> Self {
        TransportMessage {
            stream_id,
            metadata: None,
            payload: Some(payload),
            end_of_stream,
            method_path: None,
        }
    }

    /// A bare end-of-stream marker.
    pub fn end(stream_id: u32) -> Self {
        TransportMessage {
            stream_id,
            metadata: None,
            payload: None,
            end_of_stream: true,
            method_path: None,
        }
    }
}

/// Which end of a connection this transport is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiates calls; allocates odd stream ids starting at 1.
    Caller,
    /// Serves calls; allocates even stream ids starting at 2.
    Responder,
}

/// Allocates monotonically increasing stream ids with parity by role.
/// Ids are never reused within a connection.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        let first = match role {
            Role::Caller => 1,
            Role::Responder => 2,
        };
        StreamIdAllocator {
            next: AtomicU32::new(first),
        }
    }

    /// Allocate the next id. Pure allocation, no I/O.
    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

/// The demultiplexed inbound message sequence of one stream.
#[derive(Debug)]
pub struct InboundMessages {
    rx: mpsc::Receiver<TransportMessage>,
}

impl InboundMessages {
    pub(crate) fn new(rx: mpsc::Receiver<TransportMessage>) -> Self {
        InboundMessages { rx }
    }

    /// Next message on this stream, or `None` once the stream is released.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        self.rx.recv().await
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransportMessage>> {
        self.rx.poll_recv(cx)
    }
}

/// A remotely initiated stream: its first message (always metadata-bearing)
/// plus the sequence of messages that follow it.
#[derive(Debug)]
pub struct InboundStream {
    pub first: TransportMessage,
    pub messages: InboundMessages,
}

/// A byte-frame multiplexer over one connection.
///
/// Sends are per logical stream; inbound traffic is demultiplexed into
/// [`InboundMessages`] sequences. Transport-level failure aborts every open
/// stream with a synthetic end-of-stream whose metadata carries a non-zero
/// `grpc-status`; sends after [`Transport::close`] fail with
/// [`crate::Code::Unavailable`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Allocate the id for a new locally initiated stream.
    fn allocate_stream_id(&self) -> u32;

    /// Subscribe to inbound messages for a locally initiated stream.
    ///
    /// Must be called before the first send on `stream_id` so no inbound
    /// message can race the subscription.
    fn open_stream(&self, stream_id: u32) -> InboundMessages;

    /// Transmit a metadata-only frame.
    async fn send_metadata(
        &self,
        stream_id: u32,
        metadata: MetadataMap,
        end_of_stream: bool,
    ) -> Result<(), Status>;

    /// Transmit a payload frame.
    async fn send_message(
        &self,
        stream_id: u32,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<(), Status>;

    /// Emit a zero-length end-of-stream marker. Idempotent per stream.
    async fn finish_sending(&self, stream_id: u32) -> Result<(), Status>;

    /// Best-effort graceful teardown of local state for `stream_id`.
    /// Safe after [`Transport::finish_sending`] and for unknown ids.
    async fn release_stream_id(&self, stream_id: u32);

    /// Next remotely initiated stream, or `None` once the connection closes.
    async fn accept(&self) -> Option<InboundStream>;

    /// Cancel all streams, drain subscriptions, close the connection.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

// Tracks which streams have already emitted their end marker so that
// `finish_sending` stays idempotent.
#[derive(Debug, Default)]
pub(crate) struct FinishedStreams {
    ids: Mutex<HashSet<u32>>,
}

impl FinishedStreams {
    /// Returns true the first time `stream_id` finishes.
    pub(crate) fn mark(&self, stream_id: u32) -> bool {
        self.ids.lock().unwrap().insert(stream_id)
    }

    pub(crate) fn forget(&self, stream_id: u32) {
        self.ids.lock().unwrap().remove(&stream_id);
    }
}
