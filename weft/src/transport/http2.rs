//! gRPC-compatible HTTP/2 transport.
//!
//! Each logical stream maps onto one HTTP/2 stream: initial metadata rides
//! as request/response headers, payloads as DATA frames with the 5-byte
//! length prefix of [`crate::codec::pack`], and the final status as HTTP/2
//! trailers. Requests are `POST /{Service}/{Method}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    Demux, FinishedStreams, InboundMessages, InboundStream, Role, StreamIdAllocator, Transport,
    TransportMessage, DEFAULT_STREAM_BUFFER,
};
use crate::codec::{pack, FrameParser};
use crate::metadata::{MetadataMap, PATH, STATUS};
use crate::{Code, Status};

/// A transport over one HTTP/2 connection, either end.
pub struct Http2Transport {
    ids: Arc<StreamIdAllocator>,
    demux: Arc<Demux>,
    side: Side,
    closed: Arc<AtomicBool>,
    finished: FinishedStreams,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum Side {
    Client(ClientSide),
    Server(ServerSide),
}

struct ClientSide {
    send_request: tokio::sync::Mutex<h2::client::SendRequest<Bytes>>,
    authority: String,
    senders: Mutex<HashMap<u32, SendStream<Bytes>>>,
}

struct ServerSide {
    streams: Arc<Mutex<HashMap<u32, ServerStream>>>,
}

struct ServerStream {
    respond: Option<h2::server::SendResponse<Bytes>>,
    body: Option<SendStream<Bytes>>,
}

impl Http2Transport {
    /// Connect to `addr` (`host:port`) and become the caller end.
    pub async fn connect(addr: &str) -> Result<Self, Status> {
        let io = TcpStream::connect(addr).await?;
        let authority = addr.to_string();
        Self::handshake(io, authority).await
    }

    /// Perform the client handshake over an established connection.
    pub async fn handshake(io: TcpStream, authority: String) -> Result<Self, Status> {
        let (send_request, connection) = h2::client::handshake(io)
            .await
            .map_err(status_from_h2)?;

        let demux = Demux::new(DEFAULT_STREAM_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let conn_task = {
            let demux = demux.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!("h2 connection error: {}", err);
                }
                closed.store(true, Ordering::SeqCst);
                demux
                    .close_all(Status::unavailable("connection closed"))
                    .await;
            })
        };

        Ok(Http2Transport {
            ids: Arc::new(StreamIdAllocator::new(Role::Caller)),
            demux,
            side: Side::Client(ClientSide {
                send_request: tokio::sync::Mutex::new(send_request),
                authority,
                senders: Mutex::new(HashMap::new()),
            }),
            closed,
            finished: FinishedStreams::default(),
            tasks: Mutex::new(vec![conn_task]),
        })
    }

    /// Perform the server handshake on an accepted connection and become the
    /// responder end; inbound HTTP/2 streams surface via [`Transport::accept`].
    pub async fn serve(io: TcpStream) -> Result<Self, Status> {
        let mut connection = h2::server::handshake(io).await.map_err(status_from_h2)?;

        let ids = Arc::new(StreamIdAllocator::new(Role::Responder));
        let demux = Demux::new(DEFAULT_STREAM_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        let streams: Arc<Mutex<HashMap<u32, ServerStream>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = {
            let ids = ids.clone();
            let demux = demux.clone();
            let closed = closed.clone();
            let streams = streams.clone();
            tokio::spawn(async move {
                while let Some(accepted) = connection.accept().await {
                    let (request, respond) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            debug!("h2 accept error: {}", err);
                            break;
                        }
                    };

                    let stream_id = ids.next_id();
                    let (parts, body) = request.into_parts();

                    let path = parts.uri.path().to_string();
                    let mut metadata = metadata_from_headers(&parts.headers);
                    metadata.insert(PATH, path);

                    streams.lock().unwrap().insert(
                        stream_id,
                        ServerStream {
                            respond: Some(respond),
                            body: None,
                        },
                    );

                    let request_done = body.is_end_stream();
                    demux
                        .dispatch(TransportMessage::metadata(stream_id, metadata, request_done))
                        .await;

                    if !request_done {
                        let demux = demux.clone();
                        tokio::spawn(pump_request_body(demux, stream_id, body));
                    }
                }
                closed.store(true, Ordering::SeqCst);
                demux
                    .close_all(Status::unavailable("connection closed"))
                    .await;
            })
        };

        Ok(Http2Transport {
            ids,
            demux,
            side: Side::Server(ServerSide { streams }),
            closed,
            finished: FinishedStreams::default(),
            tasks: Mutex::new(vec![accept_task]),
        })
    }

    fn guard_open(&self) -> Result<(), Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("transport closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for Http2Transport {
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
        self.guard_open()?;
        match &self.side {
            Side::Client(client) => {
                client
                    .start_request(&self.demux, stream_id, metadata, end_of_stream)
                    .await
            }
            Side::Server(server) => server.send_metadata(stream_id, metadata, end_of_stream),
        }
    }

    async fn send_message(
        &self,
        stream_id: u32,
        payload: Bytes,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        self.guard_open()?;
        let framed = pack(&payload);
        match &self.side {
            Side::Client(client) => {
                let mut sender = client
                    .take_sender(stream_id)
                    .ok_or_else(|| Status::internal("send on an unopened stream"))?;
                let result = send_all(&mut sender, framed, end_of_stream).await;
                if !end_of_stream && result.is_ok() {
                    client.put_sender(stream_id, sender);
                }
                result
            }
            Side::Server(server) => {
                let mut sender = server
                    .take_body(stream_id)
                    .ok_or_else(|| Status::internal("send before response headers"))?;
                let result = send_all(&mut sender, framed, end_of_stream).await;
                if !end_of_stream && result.is_ok() {
                    server.put_body(stream_id, sender);
                }
                result
            }
        }
    }

    async fn finish_sending(&self, stream_id: u32) -> Result<(), Status> {
        if !self.finished.mark(stream_id) {
            return Ok(());
        }
        self.guard_open()?;
        let sender = match &self.side {
            Side::Client(client) => client.take_sender(stream_id),
            Side::Server(server) => server.take_body(stream_id),
        };
        if let Some(mut sender) = sender {
            sender
                .send_data(Bytes::new(), true)
                .map_err(status_from_h2)?;
        }
        Ok(())
    }

    async fn release_stream_id(&self, stream_id: u32) {
        self.demux.unsubscribe(stream_id);
        self.finished.forget(stream_id);
        match &self.side {
            Side::Client(client) => {
                client.senders.lock().unwrap().remove(&stream_id);
            }
            Side::Server(server) => {
                server.streams.lock().unwrap().remove(&stream_id);
            }
        }
    }

    async fn accept(&self) -> Option<InboundStream> {
        self.demux.accept().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.demux
            .close_all(Status::unavailable("transport closed"))
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ClientSide {
    async fn start_request(
        &self,
        demux: &Arc<Demux>,
        stream_id: u32,
        metadata: MetadataMap,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        if self.senders.lock().unwrap().contains_key(&stream_id) {
            // gRPC clients never send trailers
            return Err(Status::internal("metadata already sent for this stream"));
        }

        let path = metadata
            .get(PATH)
            .ok_or_else(|| Status::internal("initial metadata missing :path"))?;
        let uri: Uri = format!("http://{}{}", self.authority, path)
            .parse()
            .map_err(|err| Status::internal(format!("invalid request uri: {err}")))?;

        let mut request = http::Request::builder()
            .method(Method::POST)
            .version(Version::HTTP_2)
            .uri(uri)
            .body(())
            .map_err(|err| Status::internal(format!("invalid request: {err}")))?;
        *request.headers_mut() = headers_from_metadata(&metadata);
        request
            .headers_mut()
            .insert(http::header::TE, HeaderValue::from_static("trailers"));

        let send_request = self.send_request.lock().await.clone();
        let mut send_request = send_request.ready().await.map_err(status_from_h2)?;
        let (response, send_stream) = send_request
            .send_request(request, end_of_stream)
            .map_err(status_from_h2)?;

        if !end_of_stream {
            self.senders.lock().unwrap().insert(stream_id, send_stream);
        }

        let demux = demux.clone();
        tokio::spawn(pump_response(demux, stream_id, response));
        Ok(())
    }

    fn take_sender(&self, stream_id: u32) -> Option<SendStream<Bytes>> {
        self.senders.lock().unwrap().remove(&stream_id)
    }

    fn put_sender(&self, stream_id: u32, sender: SendStream<Bytes>) {
        self.senders.lock().unwrap().insert(stream_id, sender);
    }
}

impl ServerSide {
    fn send_metadata(
        &self,
        stream_id: u32,
        metadata: MetadataMap,
        end_of_stream: bool,
    ) -> Result<(), Status> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams
            .get_mut(&stream_id)
            .ok_or_else(|| Status::internal("send on an unknown stream"))?;

        if let Some(mut respond) = stream.respond.take() {
            // first metadata: the response head (or a trailers-only reply)
            let status = metadata
                .get(STATUS)
                .and_then(|raw| raw.parse::<u16>().ok())
                .and_then(|raw| StatusCode::from_u16(raw).ok())
                .unwrap_or(StatusCode::OK);

            let mut response = http::Response::builder()
                .status(status)
                .body(())
                .map_err(|err| Status::internal(format!("invalid response: {err}")))?;
            *response.headers_mut() = headers_from_metadata(&metadata);

            let body = respond
                .send_response(response, end_of_stream)
                .map_err(status_from_h2)?;
            if !end_of_stream {
                stream.body = Some(body);
            }
            return Ok(());
        }

        // subsequent metadata: the trailers
        let mut body = stream
            .body
            .take()
            .ok_or_else(|| Status::internal("stream already closed"))?;
        drop(streams);
        body.send_trailers(headers_from_metadata(&metadata))
            .map_err(status_from_h2)
    }

    fn take_body(&self, stream_id: u32) -> Option<SendStream<Bytes>> {
        self.streams
            .lock()
            .unwrap()
            .get_mut(&stream_id)
            .and_then(|stream| stream.body.take())
    }

    fn put_body(&self, stream_id: u32, body: SendStream<Bytes>) {
        if let Some(stream) = self.streams.lock().unwrap().get_mut(&stream_id) {
            stream.body = Some(body);
        }
    }
}

async fn pump_response(demux: Arc<Demux>, stream_id: u32, response: h2::client::ResponseFuture) {
    let response = match response.await {
        Ok(response) => response,
        Err(err) => {
            let trailer = status_from_h2(err).to_metadata();
            demux
                .dispatch(TransportMessage::metadata(stream_id, trailer, true))
                .await;
            return;
        }
    };

    let (parts, body) = response.into_parts();
    let mut metadata = metadata_from_headers(&parts.headers);
    metadata.insert(STATUS, parts.status.as_u16().to_string());

    let trailers_only = body.is_end_stream();
    demux
        .dispatch(TransportMessage::metadata(stream_id, metadata, trailers_only))
        .await;
    if trailers_only {
        return;
    }

    pump_body(demux, stream_id, body, true).await;
}

async fn pump_request_body(demux: Arc<Demux>, stream_id: u32, body: RecvStream) {
    pump_body(demux, stream_id, body, false).await;
}

// Forward DATA frames through the length-prefix parser, then the trailers
// (responses) or a bare end marker (requests).
async fn pump_body(demux: Arc<Demux>, stream_id: u32, mut body: RecvStream, response: bool) {
    let mut parser = FrameParser::new();
    let mut flow = body.flow_control().clone();

    while let Some(chunk) = body.data().await {
        let data = match chunk {
            Ok(data) => data,
            Err(err) => {
                let trailer = status_from_h2(err).to_metadata();
                demux
                    .dispatch(TransportMessage::metadata(stream_id, trailer, true))
                    .await;
                return;
            }
        };
        let _ = flow.release_capacity(data.len());

        match parser.parse(&data) {
            Ok(frames) => {
                for frame in frames {
                    demux
                        .dispatch(TransportMessage::payload(stream_id, frame, false))
                        .await;
                }
            }
            Err(status) => {
                demux
                    .dispatch(TransportMessage::metadata(stream_id, status.to_metadata(), true))
                    .await;
                return;
            }
        }
    }

    if !parser.is_empty() {
        trace!(stream_id, "unexpected EOF decoding stream");
        let status = Status::internal("unexpected EOF decoding stream");
        demux
            .dispatch(TransportMessage::metadata(stream_id, status.to_metadata(), true))
            .await;
        return;
    }

    if response {
        match body.trailers().await {
            Ok(Some(trailers)) => {
                demux
                    .dispatch(TransportMessage::metadata(
                        stream_id,
                        metadata_from_headers(&trailers),
                        true,
                    ))
                    .await;
            }
            Ok(None) => {
                demux.dispatch(TransportMessage::end(stream_id)).await;
            }
            Err(err) => {
                let trailer = status_from_h2(err).to_metadata();
                demux
                    .dispatch(TransportMessage::metadata(stream_id, trailer, true))
                    .await;
            }
        }
    } else {
        demux.dispatch(TransportMessage::end(stream_id)).await;
    }
}

// Send framed bytes respecting h2 flow control, chunking by granted capacity.
async fn send_all(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), Status> {
    if data.is_empty() {
        return stream.send_data(data, end_of_stream).map_err(status_from_h2);
    }

    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Status::unavailable("connection closed"))?
            .map_err(status_from_h2)?;
        if granted == 0 {
            continue;
        }

        let chunk = data.split_to(granted.min(data.len()));
        let last = end_of_stream && data.is_empty();
        stream.send_data(chunk, last).map_err(status_from_h2)?;
    }
    Ok(())
}

fn headers_from_metadata(metadata: &MetadataMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(metadata.len());
    for (key, value) in metadata.iter() {
        if key.starts_with(':') {
            continue;
        }
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("skipping non-representable metadata entry {:?}", key),
        }
    }
    headers
}

fn metadata_from_headers(headers: &HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        match value.to_str() {
            Ok(value) => metadata.append(name.as_str(), value),
            Err(_) => debug!("skipping non-ascii header {:?}", name),
        }
    }
    metadata
}

fn status_from_h2(err: h2::Error) -> Status {
    // See https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#errors
    let code = match err.reason() {
        Some(h2::Reason::NO_ERROR)
        | Some(h2::Reason::PROTOCOL_ERROR)
        | Some(h2::Reason::INTERNAL_ERROR)
        | Some(h2::Reason::FLOW_CONTROL_ERROR)
        | Some(h2::Reason::SETTINGS_TIMEOUT)
        | Some(h2::Reason::COMPRESSION_ERROR)
        | Some(h2::Reason::CONNECT_ERROR) => Code::Internal,
        Some(h2::Reason::REFUSED_STREAM) => Code::Unavailable,
        Some(h2::Reason::CANCEL) => Code::Cancelled,
        Some(h2::Reason::ENHANCE_YOUR_CALM) => Code::ResourceExhausted,
        Some(h2::Reason::INADEQUATE_SECURITY) => Code::PermissionDenied,
        _ => Code::Unknown,
    };

    Status::new(code, format!("h2 protocol error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_keys_never_become_headers() {
        let mut metadata = MetadataMap::new();
        metadata.insert(PATH, "/Echo/echo");
        metadata.insert(STATUS, "200");
        metadata.insert("x-trace", "abc");

        let headers = headers_from_metadata(&metadata);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-trace").unwrap(), "abc");
    }

    #[test]
    fn h2_cancel_maps_to_cancelled() {
        let err = h2::Error::from(h2::Reason::CANCEL);
        assert_eq!(status_from_h2(err).code(), Code::Cancelled);
    }
}
