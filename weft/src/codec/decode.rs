use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{future, ready};
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, trace};

use crate::metadata::{MetadataMap, GRPC_STATUS};
use crate::status::infer_status;
use crate::transport::{InboundMessages, Transport};
use crate::Status;

pub(crate) type BoxDecodeFn<T> = Box<dyn FnMut(Bytes) -> Result<T, Status> + Send>;

/// Streaming requests and responses.
///
/// Wraps a per-stream inbound message sequence and a decoder, yielding
/// decoded messages until the stream's trailer. On the caller side a non-OK
/// trailer status is surfaced inline as the final `Err` item.
pub struct Streaming<T> {
    decode: BoxDecodeFn<T>,
    messages: InboundMessages,
    direction: Direction,
    deadline: Option<Pin<Box<Sleep>>>,
    initial_metadata: Option<MetadataMap>,
    trailers: Option<MetadataMap>,
    state: State,
    call: Option<(Arc<dyn Transport>, u32)>,
}

impl<T> Unpin for Streaming<T> {}

#[derive(Debug, PartialEq)]
enum State {
    Open,
    Done,
    Error,
}

#[derive(Debug)]
enum Direction {
    Request,
    Response,
}

impl<T> Streaming<T> {
    pub(crate) fn new_request(
        messages: InboundMessages,
        decode: BoxDecodeFn<T>,
        already_ended: bool,
    ) -> Self {
        Self::new(messages, decode, Direction::Request, already_ended)
    }

    pub(crate) fn new_response(
        messages: InboundMessages,
        decode: BoxDecodeFn<T>,
        timeout: Option<Duration>,
        call: (Arc<dyn Transport>, u32),
    ) -> Self {
        let mut streaming = Self::new(messages, decode, Direction::Response, false);
        streaming.deadline = timeout.map(|t| Box::pin(sleep_until(Instant::now() + t)));
        streaming.call = Some(call);
        streaming
    }

    fn new(
        messages: InboundMessages,
        decode: BoxDecodeFn<T>,
        direction: Direction,
        already_ended: bool,
    ) -> Self {
        Streaming {
            decode,
            messages,
            direction,
            deadline: None,
            initial_metadata: None,
            trailers: None,
            state: if already_ended { State::Done } else { State::Open },
            call: None,
        }
    }
}

impl<T> Streaming<T> {
    /// Fetch the next message from this stream.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        match future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
            Some(Ok(m)) => Ok(Some(m)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// The initial metadata the peer sent, once received.
    pub fn initial_metadata(&self) -> Option<&MetadataMap> {
        self.initial_metadata.as_ref()
    }

    /// The trailing metadata, available once the stream has completed.
    pub fn trailers(&self) -> Option<&MetadataMap> {
        self.trailers.as_ref()
    }

    /// Cancel the call: half-close the sending side, discard in-flight
    /// inbound messages, and release the stream.
    pub async fn cancel(mut self) {
        self.state = State::Done;
        if let Some((transport, stream_id)) = self.call.take() {
            let _ = transport.finish_sending(stream_id).await;
            transport.release_stream_id(stream_id).await;
        }
    }

    /// Wait for the peer's initial metadata, buffering nothing.
    ///
    /// Resolves early with `Err` when the peer replies trailers-only with a
    /// non-OK status, or when the deadline elapses first.
    pub(crate) async fn wait_initial(&mut self) -> Result<MetadataMap, Status> {
        future::poll_fn(|cx| self.poll_initial(cx)).await
    }

    fn poll_initial(&mut self, cx: &mut Context<'_>) -> Poll<Result<MetadataMap, Status>> {
        loop {
            if let Some(metadata) = &self.initial_metadata {
                return Poll::Ready(Ok(metadata.clone()));
            }
            if self.state != State::Open {
                return Poll::Ready(Err(Status::internal(
                    "stream ended before initial metadata",
                )));
            }
            if let Some(status) = self.poll_deadline(cx) {
                return Poll::Ready(Err(status));
            }

            let message = match ready!(self.messages.poll_recv(cx)) {
                Some(message) => message,
                None => {
                    self.state = State::Error;
                    return Poll::Ready(Err(Status::unavailable(
                        "stream closed before initial metadata",
                    )));
                }
            };

            match &message.metadata {
                Some(metadata) if metadata.contains_key(GRPC_STATUS) => {
                    // trailers-only reply
                    self.trailers = Some(metadata.clone());
                    self.initial_metadata = Some(metadata.clone());
                    self.state = State::Done;
                    if let Err(status) = infer_status(self.trailers.as_ref()) {
                        return Poll::Ready(Err(status));
                    }
                }
                Some(metadata) => {
                    self.initial_metadata = Some(metadata.clone());
                    if message.end_of_stream {
                        self.state = State::Error;
                        return Poll::Ready(Err(Status::internal(
                            "stream ended without grpc-status",
                        )));
                    }
                }
                None => {
                    trace!("payload received before initial metadata");
                    self.state = State::Error;
                    return Poll::Ready(Err(Status::internal(
                        "protocol error: payload received before metadata",
                    )));
                }
            }
        }
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Option<Status> {
        let deadline = self.deadline.as_mut()?;
        if deadline.as_mut().poll(cx).is_ready() {
            self.state = State::Error;
            self.abort();
            return Some(Status::deadline_exceeded("deadline elapsed"));
        }
        None
    }

    // Best-effort half-close and release after an abnormal end.
    fn abort(&mut self) {
        if let Some((transport, stream_id)) = self.call.take() {
            tokio::spawn(async move {
                let _ = transport.finish_sending(stream_id).await;
                transport.release_stream_id(stream_id).await;
            });
        }
    }

    fn handle_metadata(&mut self, metadata: MetadataMap, end_of_stream: bool) -> Option<Option<Result<T, Status>>> {
        match self.direction {
            Direction::Response => {
                if metadata.contains_key(GRPC_STATUS) {
                    self.trailers = Some(metadata);
                    self.state = State::Done;
                    return Some(match infer_status(self.trailers.as_ref()) {
                        Ok(()) => None,
                        Err(status) => Some(Err(status)),
                    });
                }
                if self.initial_metadata.is_none() {
                    self.initial_metadata = Some(metadata);
                }
                if end_of_stream {
                    self.state = State::Error;
                    return Some(Some(Err(Status::internal(
                        "stream ended without grpc-status",
                    ))));
                }
            }
            Direction::Request => {
                if self.initial_metadata.is_none() {
                    self.initial_metadata = Some(metadata);
                }
                if end_of_stream {
                    self.state = State::Done;
                    return Some(None);
                }
            }
        }
        None
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.state != State::Open {
                return Poll::Ready(None);
            }

            if let Some(status) = this.poll_deadline(cx) {
                return Poll::Ready(Some(Err(status)));
            }

            let message = match ready!(this.messages.poll_recv(cx)) {
                Some(message) => message,
                None => {
                    this.state = State::Done;
                    return match this.direction {
                        // the sender released the stream; transports inject
                        // a synthetic trailer on abnormal loss
                        Direction::Request => Poll::Ready(None),
                        Direction::Response => Poll::Ready(Some(Err(Status::unavailable(
                            "stream closed before trailers",
                        )))),
                    };
                }
            };

            if let Some(metadata) = message.metadata {
                if let Some(item) = this.handle_metadata(metadata, message.end_of_stream) {
                    return Poll::Ready(item);
                }
                continue;
            }

            if let Some(payload) = message.payload {
                let item = (this.decode)(payload);
                match &item {
                    Ok(_) if message.end_of_stream => this.state = State::Done,
                    Ok(_) => {}
                    Err(status) => {
                        debug!("inbound decode error: {}", status);
                        this.state = State::Error;
                    }
                }
                return Poll::Ready(Some(item));
            }

            // bare end-of-stream marker
            if message.end_of_stream {
                this.state = State::Done;
                return match this.direction {
                    Direction::Request => Poll::Ready(None),
                    Direction::Response => Poll::Ready(Some(Err(Status::internal(
                        "stream ended without grpc-status",
                    )))),
                };
            }
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}
