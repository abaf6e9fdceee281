//! In-memory paired transport.
//!
//! Two transports cross-wired by their inbound queues: a send on one side is
//! delivered, after a yield, to the other side's demultiplexer. Used for
//! tests and cross-task fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Demux, FinishedStreams, InboundMessages, InboundStream, Role, StreamIdAllocator, Transport,
    TransportMessage, DEFAULT_STREAM_BUFFER,
};
use crate::metadata::MetadataMap;
use crate::Status;

/// One half of an in-memory connection; see [`MemoryTransport::pair`].
pub struct MemoryTransport {
    ids: StreamIdAllocator,
    demux: Arc<Demux>,
    peer: Arc<Demux>,
    closed: Arc<AtomicBool>,
    finished: FinishedStreams,
}

impl MemoryTransport {
    /// Create a connected pair: the first half is the caller end (odd stream
    /// ids), the second the responder end (even stream ids).
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        Self::pair_with_buffer(DEFAULT_STREAM_BUFFER)
    }

    /// Like [`MemoryTransport::pair`] with an explicit per-stream queue bound.
    pub fn pair_with_buffer(buffer: usize) -> (MemoryTransport, MemoryTransport) {
        let caller_demux = Demux::new(buffer);
        let responder_demux = Demux::new(buffer);
        let closed = Arc::new(AtomicBool::new(false));

        let caller = MemoryTransport {
            ids: StreamIdAllocator::new(Role::Caller),
            demux: caller_demux.clone(),
            peer: responder_demux.clone(),
            closed: closed.clone(),
            finished: FinishedStreams::default(),
        };
        let responder = MemoryTransport {
            ids: StreamIdAllocator::new(Role::Responder),
            demux: responder_demux,
            peer: caller_demux,
            closed,
            finished: FinishedStreams::default(),
        };
        (caller, responder)
    }

    async fn deliver(&self, message: TransportMessage) -> Result<(), Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("transport closed"));
        }
        tokio::task::yield_now().await;
        self.peer.dispatch(message).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn allocate_stream_id(&self) -> u32 {
        self.ids.next_id()
    }

    fn open_stream(&self, stream_id: u32) -> InboundMessages {
        self.demux.subscribe(stream_id)
    }

    async fn send_metadata(
        &self,
        stream_id: u32,
        metadata: MetadataMap,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        self.deliver(TransportMessage::metadata(stream_id, metadata, end_of_stream))
            .await
    }

    async fn send_message(
        &self,
        stream_id: u32,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        self.deliver(TransportMessage::payload(stream_id, payload, end_of_stream))
            .await
    }

    async fn finish_sending(&self, stream_id: u32) -> Result<(), Status> {
        if !self.finished.mark(stream_id) {
            return Ok(());
        }
        self.deliver(TransportMessage::end(stream_id)).await
    }

    async fn release_stream_id(&self, stream_id: u32) {
        self.demux.unsubscribe(stream_id);
        self.finished.forget(stream_id);
    }

    async fn accept(&self) -> Option<InboundStream> {
        self.demux.accept().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let status = Status::unavailable("transport closed");
        self.demux.close_all(status.clone()).await;
        self.peer.close_all(status).await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataMap, PATH};
    use crate::Code;

    #[tokio::test]
    async fn delivers_across_the_pair() {
        let (caller, responder) = MemoryTransport::pair();

        let stream_id = caller.allocate_stream_id();
        assert_eq!(stream_id, 1);

        let mut metadata = MetadataMap::new();
        metadata.insert(PATH, "/Echo/echo");
        caller.send_metadata(stream_id, metadata, false).await.unwrap();
        caller
            .send_message(stream_id, Bytes::from_static(b"hello"), false)
            .await
            .unwrap();
        caller.finish_sending(stream_id).await.unwrap();

        let mut inbound = responder.accept().await.unwrap();
        assert_eq!(inbound.first.method_path.as_deref(), Some("/Echo/echo"));
        let payload = inbound.messages.recv().await.unwrap();
        assert_eq!(payload.payload.as_deref(), Some(&b"hello"[..]));
        let end = inbound.messages.recv().await.unwrap();
        assert!(end.end_of_stream);
    }

    #[tokio::test]
    async fn finish_sending_is_idempotent() {
        let (caller, responder) = MemoryTransport::pair();

        let stream_id = caller.allocate_stream_id();
        caller
            .send_metadata(stream_id, MetadataMap::new(), false)
            .await
            .unwrap();
        caller.finish_sending(stream_id).await.unwrap();
        caller.finish_sending(stream_id).await.unwrap();

        let mut inbound = responder.accept().await.unwrap();
        let end = inbound.messages.recv().await.unwrap();
        assert!(end.end_of_stream);
        // the duplicate marker was suppressed and the stream released
        assert!(inbound.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails_with_unavailable() {
        let (caller, _responder) = MemoryTransport::pair();
        caller.close().await;

        let err = caller
            .send_message(1, Bytes::from_static(b"x"), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn close_aborts_open_streams_on_both_sides() {
        let (caller, responder) = MemoryTransport::pair();

        let stream_id = caller.allocate_stream_id();
        let mut inbound = caller.open_stream(stream_id);
        caller
            .send_metadata(stream_id, MetadataMap::new(), false)
            .await
            .unwrap();
        let _accepted = responder.accept().await.unwrap();

        responder.close().await;

        let trailer = inbound.recv().await.unwrap();
        let status = Status::from_metadata(trailer.metadata.as_ref().unwrap()).unwrap();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
