//! Caller endpoint: initiates unary and streaming calls over a transport.

use std::sync::{Arc, Mutex};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{Codec, Streaming};
use crate::metadata::{self, fmt_grpc_timeout, MetadataMap};
use crate::request::MethodPath;
use crate::transport::Transport;
use crate::{Request, Response, Status};

/// A call dispatcher over one transport connection.
///
/// Each method takes a [`MethodPath`] (or anything convertible, such as a
/// `("Service", "method")` pair) and a [`Request`]; the codec `C` fixes the
/// message types of the call.
#[derive(Clone)]
pub struct Caller {
    transport: Arc<dyn Transport>,
}

impl Caller {
    /// Create a new caller over the provided transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Caller { transport }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send a single unary request.
    pub async fn unary<C: Codec>(
        &self,
        path: impl Into<MethodPath>,
        request: Request<C::Encode>,
    ) -> Result<Response<C::Decode>, Status> {
        let request = request.map(|message| tokio_stream::once(message));
        self.client_streaming::<C, _>(path, request).await
    }

    /// Send a client side streaming request: any number of request messages,
    /// exactly one response.
    pub async fn client_streaming<C, S>(
        &self,
        path: impl Into<MethodPath>,
        request: Request<S>,
    ) -> Result<Response<C::Decode>, Status>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let (metadata, mut streaming) = self.start::<C, S>(path.into(), request).await?;

        let message = streaming
            .message()
            .await?
            .ok_or_else(|| Status::internal("missing response message"))?;

        if streaming.message().await?.is_some() {
            return Err(Status::internal("expected a single response message"));
        }

        Ok(Response::from_parts(metadata, message))
    }

    /// Send a server side streaming request: one request message, an
    /// indefinite response sequence.
    pub async fn server_streaming<C: Codec>(
        &self,
        path: impl Into<MethodPath>,
        request: Request<C::Encode>,
    ) -> Result<Response<Streaming<C::Decode>>, Status> {
        let request = request.map(|message| tokio_stream::once(message));
        self.streaming::<C, _>(path, request).await
    }

    /// Send a bi-directional streaming request. Either side may half-close
    /// while still receiving.
    pub async fn streaming<C, S>(
        &self,
        path: impl Into<MethodPath>,
        request: Request<S>,
    ) -> Result<Response<Streaming<C::Decode>>, Status>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let (metadata, streaming) = self.start::<C, S>(path.into(), request).await?;
        Ok(Response::from_parts(metadata, streaming))
    }

    // Open the stream, spawn the request pump, and wait for the peer's
    // initial metadata (or its trailers-only rejection).
    async fn start<C, S>(
        &self,
        path: MethodPath,
        request: Request<S>,
    ) -> Result<(MetadataMap, Streaming<C::Decode>), Status>
    where
        C: Codec,
        S: Stream<Item = C::Encode> + Send + 'static,
    {
        let (mut metadata, timeout, source) = request.into_parts();

        let transport = self.transport.clone();
        let stream_id = transport.allocate_stream_id();
        let inbound = transport.open_stream(stream_id);

        metadata.insert(metadata::PATH, path.to_string());
        if !metadata.contains_key(metadata::CONTENT_TYPE) {
            metadata.insert(
                metadata::CONTENT_TYPE,
                format!("application/grpc+{}", C::NAME),
            );
        }
        if let Some(timeout) = timeout {
            metadata.insert(metadata::GRPC_TIMEOUT, fmt_grpc_timeout(timeout));
        }

        transport.send_metadata(stream_id, metadata, false).await?;

        {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut codec = C::default();
                let mut source = std::pin::pin!(source);
                while let Some(item) = source.next().await {
                    let bytes = match codec.encode(&item) {
                        Ok(bytes) => bytes,
                        Err(status) => {
                            debug!("request encoding failed: {}", status);
                            break;
                        }
                    };
                    if transport.send_message(stream_id, bytes, false).await.is_err() {
                        // connection lost; the inbound side surfaces the error
                        return;
                    }
                }
                let _ = transport.finish_sending(stream_id).await;
            });
        }

        let mut codec = C::default();
        let mut streaming = Streaming::new_response(
            inbound,
            Box::new(move |bytes| codec.decode(bytes)),
            timeout,
            (transport, stream_id),
        );
        let initial = streaming.wait_initial().await?;
        Ok((initial, streaming))
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller").finish()
    }
}

/// Create an imperative sending handle for client- and bi-directional
/// streaming calls, paired with the request stream to hand to the caller.
///
/// Unlike a plain channel, the sender enforces the half-close protocol:
/// sending after [`OutboundSender::finish`] fails with
/// [`crate::Code::FailedPrecondition`].
pub fn outbound_channel<T>(buffer: usize) -> (OutboundSender<T>, OutboundReceiver<T>) {
    let (tx, rx) = mpsc::channel(buffer);
    (
        OutboundSender {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        OutboundReceiver { rx },
    )
}

/// Sending half created by [`outbound_channel`].
pub struct OutboundSender<T> {
    tx: Arc<Mutex<Option<mpsc::Sender<T>>>>,
}

impl<T> Clone for OutboundSender<T> {
    fn clone(&self) -> Self {
        OutboundSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> OutboundSender<T> {
    /// Queue one request message, awaiting space if the stream is backed up.
    pub async fn send(&self, item: T) -> Result<(), Status> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Status::failed_precondition("cannot send after finish"))?;
        tx.send(item)
            .await
            .map_err(|_| Status::cancelled("stream closed"))
    }

    /// Half-close the sending side. Further [`OutboundSender::send`] calls
    /// fail; the peer still delivers its responses.
    pub fn finish(&self) {
        self.tx.lock().unwrap().take();
    }
}

impl<T> std::fmt::Debug for OutboundSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSender").finish()
    }
}

/// Receiving half created by [`outbound_channel`]; pass it to
/// [`Caller::client_streaming`] or [`Caller::streaming`] as the request
/// stream.
#[derive(Debug)]
pub struct OutboundReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Stream for OutboundReceiver<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[tokio::test]
    async fn outbound_sender_rejects_send_after_finish() {
        let (tx, _rx) = outbound_channel::<u32>(4);

        tx.send(1).await.unwrap();
        tx.finish();

        let err = tx.send(2).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn outbound_receiver_ends_after_finish() {
        use futures_util::StreamExt;

        let (tx, mut rx) = outbound_channel::<u32>(4);
        tx.send(7).await.unwrap();
        tx.finish();

        assert_eq!(rx.next().await, Some(7));
        assert_eq!(rx.next().await, None);
    }
}
