//! WebSocket transport.
//!
//! One socket hosts many logical streams: each [`TransportMessage`] is
//! serialized as a JSON envelope into a binary WebSocket frame, with the
//! same stream-id parity rules as every other transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error};

use super::{
    Demux, FinishedStreams, InboundMessages, InboundStream, Role, StreamIdAllocator, Transport,
    TransportMessage, DEFAULT_STREAM_BUFFER,
};
use crate::metadata::MetadataMap;
use crate::Status;

/// A transport over one WebSocket connection.
pub struct WsTransport {
    ids: StreamIdAllocator,
    demux: Arc<Demux>,
    outbound: Mutex<Option<mpsc::Sender<TransportMessage>>>,
    closed: Arc<AtomicBool>,
    finished: FinishedStreams,
}

impl WsTransport {
    /// Connect to a WebSocket URL as the caller end.
    pub async fn connect(url: &str) -> Result<Self, Status> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|err| Status::unavailable(format!("websocket connect failed: {err}")))?;
        Ok(Self::from_socket(socket, Role::Caller))
    }

    /// Perform the server side of the WebSocket handshake on an accepted
    /// connection and become the responder end.
    pub async fn accept_io<S>(io: S) -> Result<Self, Status>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket = accept_async(io)
            .await
            .map_err(|err| Status::unavailable(format!("websocket handshake failed: {err}")))?;
        Ok(Self::from_socket(socket, Role::Responder))
    }

    /// Wrap an established WebSocket in a transport with the given role.
    pub fn from_socket<S>(socket: WebSocketStream<S>, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let demux = Demux::new(DEFAULT_STREAM_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<TransportMessage>(DEFAULT_STREAM_BUFFER);

        let (mut sink, mut stream) = socket.split();

        // The writer ends once every outbound sender is dropped; closing the
        // sink completes the close handshake, which in turn ends the reader.
        let _writer = {
            let demux = demux.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let envelope = match serde_json::to_vec(&message) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            error!("failed to encode transport envelope: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Binary(envelope)).await {
                        debug!("websocket send failed: {}", err);
                        break;
                    }
                }
                let _ = sink.close().await;
                closed.store(true, Ordering::SeqCst);
                demux
                    .close_all(Status::unavailable("websocket connection closed"))
                    .await;
            })
        };

        let _reader = {
            let demux = demux.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(Message::Binary(raw)) => match serde_json::from_slice(&raw) {
                            Ok(message) => demux.dispatch(message).await,
                            Err(err) => debug!("malformed transport envelope: {}", err),
                        },
                        Ok(Message::Text(raw)) => match serde_json::from_str(&raw) {
                            Ok(message) => demux.dispatch(message).await,
                            Err(err) => debug!("malformed transport envelope: {}", err),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {} // ping/pong handled by the protocol layer
                        Err(err) => {
                            debug!("websocket receive failed: {}", err);
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                demux
                    .close_all(Status::unavailable("websocket connection closed"))
                    .await;
            })
        };

        WsTransport {
            ids: StreamIdAllocator::new(role),
            demux,
            outbound: Mutex::new(Some(outbound_tx)),
            closed,
            finished: FinishedStreams::default(),
        }
    }

    async fn deliver(&self, message: TransportMessage) -> Result<(), Status> {
        let outbound = self.outbound.lock().unwrap().clone();
        let outbound = outbound.ok_or_else(|| Status::unavailable("transport closed"))?;
        outbound
            .send(message)
            .await
            .map_err(|_| Status::unavailable("transport closed"))
    }
}

#[async_trait]
impl Transport for WsTransport {
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
        self.closed.store(true, Ordering::SeqCst);
        // dropping the sender ends the writer, which closes the socket
        self.outbound.lock().unwrap().take();
        self.demux
            .close_all(Status::unavailable("transport closed"))
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
