use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::{BincodeCodec, Codec, JsonCodec, Streaming};
use crate::metadata::MetadataMap;
use crate::transport::memory::MemoryTransport;
use crate::transport::{InboundMessages, Transport, TransportMessage};
use crate::{Code, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    text: String,
    priority: u8,
}

fn note() -> Note {
    Note {
        text: "water the plants".to_string(),
        priority: 3,
    }
}

#[test]
fn json_round_trip() {
    let mut codec = JsonCodec::<Note, Note>::default();
    let bytes = codec.encode(&note()).unwrap();
    assert_eq!(codec.decode(bytes).unwrap(), note());
}

#[test]
fn bincode_round_trip() {
    let mut codec = BincodeCodec::<Note, Note>::default();
    let bytes = codec.encode(&note()).unwrap();
    assert_eq!(codec.decode(bytes).unwrap(), note());
}

#[test]
fn json_decode_error_is_invalid_argument() {
    let mut codec = JsonCodec::<Note, Note>::default();
    let err = codec.decode(Bytes::from_static(b"{ nope")).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

fn decoder() -> Box<dyn FnMut(Bytes) -> Result<String, Status> + Send> {
    let mut codec = JsonCodec::<String, String>::default();
    Box::new(move |bytes| codec.decode(bytes))
}

fn encoded(value: &str) -> Bytes {
    JsonCodec::<String, String>::default()
        .encode(&value.to_string())
        .unwrap()
}

fn response_streaming(
    timeout: Option<Duration>,
) -> (mpsc::Sender<TransportMessage>, Streaming<String>) {
    let (tx, rx) = mpsc::channel(16);
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::pair().0);
    let streaming = Streaming::new_response(InboundMessages::new(rx), decoder(), timeout, (transport, 1));
    (tx, streaming)
}

#[tokio::test]
async fn yields_messages_until_the_ok_trailer() {
    let (tx, mut streaming) = response_streaming(None);

    tx.send(TransportMessage::metadata(1, MetadataMap::new(), false))
        .await
        .unwrap();
    tx.send(TransportMessage::payload(1, encoded("one"), false))
        .await
        .unwrap();
    tx.send(TransportMessage::payload(1, encoded("two"), false))
        .await
        .unwrap();
    tx.send(TransportMessage::metadata(1, Status::ok("").to_metadata(), true))
        .await
        .unwrap();

    assert_eq!(streaming.message().await.unwrap(), Some("one".to_string()));
    assert_eq!(streaming.message().await.unwrap(), Some("two".to_string()));
    assert_eq!(streaming.message().await.unwrap(), None);
    assert!(streaming.trailers().is_some());
}

#[tokio::test]
async fn non_ok_trailer_surfaces_inline() {
    let (tx, mut streaming) = response_streaming(None);

    tx.send(TransportMessage::metadata(1, MetadataMap::new(), false))
        .await
        .unwrap();
    tx.send(TransportMessage::payload(1, encoded("partial"), false))
        .await
        .unwrap();
    tx.send(TransportMessage::metadata(
        1,
        Status::new(Code::ResourceExhausted, "queue full").to_metadata(),
        true,
    ))
    .await
    .unwrap();

    assert_eq!(streaming.message().await.unwrap(), Some("partial".to_string()));
    let err = streaming.message().await.unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(err.message(), "queue full");
}

#[tokio::test]
async fn trailers_only_rejection_resolves_wait_initial() {
    let (tx, mut streaming) = response_streaming(None);

    tx.send(TransportMessage::metadata(
        1,
        Status::unimplemented("nope").to_metadata(),
        true,
    ))
    .await
    .unwrap();

    let err = streaming.wait_initial().await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_while_waiting() {
    let (_tx, mut streaming) = response_streaming(Some(Duration::from_millis(100)));

    let err = streaming.message().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    // the stream is closed afterwards
    assert_eq!(streaming.message().await.unwrap(), None);
}

#[tokio::test]
async fn request_direction_ends_on_the_end_marker() {
    let (tx, rx) = mpsc::channel(16);
    let mut streaming = Streaming::new_request(InboundMessages::new(rx), decoder(), false);

    tx.send(TransportMessage::payload(2, encoded("req"), false))
        .await
        .unwrap();
    tx.send(TransportMessage::end(2)).await.unwrap();

    assert_eq!(streaming.message().await.unwrap(), Some("req".to_string()));
    assert_eq!(streaming.message().await.unwrap(), None);
}

#[tokio::test]
async fn request_direction_already_ended_is_empty() {
    let (_tx, rx) = mpsc::channel(16);
    let mut streaming = Streaming::new_request(InboundMessages::new(rx), decoder(), true);
    assert_eq!(streaming.message().await.unwrap(), None);
}

#[tokio::test]
async fn decode_failure_poisons_the_stream() {
    let (tx, mut streaming) = response_streaming(None);

    tx.send(TransportMessage::metadata(1, MetadataMap::new(), false))
        .await
        .unwrap();
    tx.send(TransportMessage::payload(1, Bytes::from_static(b"{"), false))
        .await
        .unwrap();

    let err = streaming.message().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(streaming.message().await.unwrap(), None);
}
