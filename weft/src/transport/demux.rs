use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::{InboundMessages, InboundStream, TransportMessage};
use crate::Status;

// Inbound demultiplexer shared by every transport implementation.
//
// Messages for known streams are forwarded into bounded per-stream queues
// (the send awaits space, which suspends the connection reader: backpressure).
// A message for an unknown stream that carries metadata opens a new inbound
// stream on the acceptance queue; without metadata it is dropped.
pub(crate) struct Demux {
    buffer: usize,
    streams: Mutex<HashMap<u32, mpsc::Sender<TransportMessage>>>,
    accept_tx: mpsc::Sender<InboundStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<InboundStream>>,
    closed: AtomicBool,
}

impl Demux {
    pub(crate) fn new(buffer: usize) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(buffer);
        Arc::new(Demux {
            buffer,
            streams: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn subscribe(&self, stream_id: u32) -> InboundMessages {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.streams.lock().unwrap().insert(stream_id, tx);
        InboundMessages::new(rx)
    }

    pub(crate) fn unsubscribe(&self, stream_id: u32) {
        self.streams.lock().unwrap().remove(&stream_id);
    }

    /// Route one inbound message. Never called with a lock held; the
    /// per-stream send happens outside the registry lock.
    pub(crate) async fn dispatch(&self, message: TransportMessage) {
        let stream_id = message.stream_id;
        let end_of_stream = message.end_of_stream;

        let known = self.streams.lock().unwrap().get(&stream_id).cloned();
        if let Some(tx) = known {
            if tx.send(message).await.is_err() {
                trace!(stream_id, "inbound message for a released stream");
                self.unsubscribe(stream_id);
            } else if end_of_stream {
                self.unsubscribe(stream_id);
            }
            return;
        }

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // New remote stream: the first message must carry metadata.
        if message.metadata.is_none() {
            trace!(stream_id, "dropping message for unknown stream");
            return;
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        if !end_of_stream {
            self.streams.lock().unwrap().insert(stream_id, tx);
        }
        let inbound = InboundStream {
            first: message,
            messages: InboundMessages::new(rx),
        };
        if self.accept_tx.send(inbound).await.is_err() {
            self.unsubscribe(stream_id);
        }
    }

    pub(crate) async fn accept(&self) -> Option<InboundStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Abort every open stream with a synthetic trailer carrying `status`
    /// and stop accepting new streams.
    pub(crate) async fn close_all(&self, status: Status) {
        self.closed.store(true, Ordering::SeqCst);

        let open: Vec<(u32, mpsc::Sender<TransportMessage>)> =
            self.streams.lock().unwrap().drain().collect();
        for (stream_id, tx) in open {
            let trailer = TransportMessage::metadata(stream_id, status.to_metadata(), true);
            let _ = tx.send(trailer).await;
        }

        self.accept_rx.lock().await.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
