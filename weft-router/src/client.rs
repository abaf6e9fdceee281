//! The router client: registration, the p2p stream, typed sends, and
//! correlated request/response on top of the unreliable message channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use weft::client::{outbound_channel, OutboundSender};
use weft::codec::JsonCodec;
use weft::transport::Transport;
use weft::{Caller, Request, Status, Streaming};

use crate::message::{
    ClientInfo, ClientTimestamp, ClientsList, Empty, GetOnlineClientsRequest, JsonMap, MessageKind,
    PongResponse, RegisterRequest, RegisterResponse, RouterEvent, RouterMessage,
    UpdateMetadataRequest, now_ms,
};
use crate::service::SERVICE_NAME;

const INBOUND_BUFFER: usize = 64;

/// A registered peer's handle onto the router.
///
/// Wraps a [`Caller`]; registration parameters are retained so a reconnect
/// wrapper can replay them verbatim.
pub struct RouterClient {
    caller: Caller,
    inner: Arc<Inner>,
}

struct Inner {
    client_id: Mutex<Option<String>>,
    registration: Mutex<Option<RegisterRequest>>,
    outbound: Mutex<Option<OutboundSender<RouterMessage>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<RouterMessage>>>,
    inbound_tx: mpsc::Sender<RouterMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<RouterMessage>>,
    disconnected: Notify,
}

impl RouterClient {
    /// Create a client over the provided transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        RouterClient {
            caller: Caller::new(transport),
            inner: Arc::new(Inner {
                client_id: Mutex::new(None),
                registration: Mutex::new(None),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                disconnected: Notify::new(),
            }),
        }
    }

    /// The id allocated by the router, once registered.
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().unwrap().clone()
    }

    /// The retained registration parameters, if any.
    pub fn registration(&self) -> Option<RegisterRequest> {
        self.inner.registration.lock().unwrap().clone()
    }

    /// Register with the router, retaining the parameters for reconnect.
    pub async fn register(&self, request: RegisterRequest) -> Result<String, Status> {
        *self.inner.registration.lock().unwrap() = Some(request.clone());

        let response = self
            .caller
            .unary::<JsonCodec<RegisterRequest, RegisterResponse>>(
                (SERVICE_NAME, "register"),
                Request::new(request),
            )
            .await?
            .into_inner();

        if !response.success {
            return Err(Status::internal(
                response
                    .error_message
                    .unwrap_or_else(|| "registration refused".to_string()),
            ));
        }

        *self.inner.client_id.lock().unwrap() = Some(response.client_id.clone());
        Ok(response.client_id)
    }

    /// Round-trip a timestamp to the router.
    pub async fn ping(&self) -> Result<PongResponse, Status> {
        let response = self
            .caller
            .unary::<JsonCodec<ClientTimestamp, PongResponse>>(
                (SERVICE_NAME, "ping"),
                Request::new(ClientTimestamp { client_ts: now_ms() }),
            )
            .await?;
        Ok(response.into_inner())
    }

    /// List currently registered clients matching `filter`.
    pub async fn get_online_clients(
        &self,
        filter: GetOnlineClientsRequest,
    ) -> Result<Vec<ClientInfo>, Status> {
        let response = self
            .caller
            .unary::<JsonCodec<GetOnlineClientsRequest, ClientsList>>(
                (SERVICE_NAME, "get_online_clients"),
                Request::new(filter),
            )
            .await?;
        Ok(response.into_inner().clients)
    }

    /// Merge this client's advertised metadata and optionally its groups.
    pub async fn update_metadata(
        &self,
        metadata: JsonMap,
        groups: Option<Vec<String>>,
    ) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        self.caller
            .unary::<JsonCodec<UpdateMetadataRequest, crate::message::Ack>>(
                (SERVICE_NAME, "update_client_metadata"),
                Request::new(UpdateMetadataRequest {
                    client_id,
                    metadata,
                    groups,
                }),
            )
            .await?;
        Ok(())
    }

    /// Open the long-lived p2p stream and start the inbound pump.
    ///
    /// The first outbound message is a heartbeat carrying the registered
    /// sender id, which the router acknowledges before any routed traffic.
    pub async fn initialize_p2p(&self) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        let (outbound, requests) = outbound_channel::<RouterMessage>(INBOUND_BUFFER);

        // queue the identifying heartbeat before opening the call: the
        // router reads it before acknowledging the attach
        outbound
            .send(RouterMessage::heartbeat(Some(client_id)))
            .await?;

        let response = self
            .caller
            .streaming::<JsonCodec<RouterMessage, RouterMessage>, _>(
                (SERVICE_NAME, "p2p"),
                Request::new(requests),
            )
            .await?;

        let mut inbound = response.into_inner();

        // the attach acknowledgement arrives before any routed message
        match inbound.message().await? {
            Some(ack) if ack.kind == MessageKind::Heartbeat => {}
            Some(other) => {
                let reason = other
                    .error_message
                    .unwrap_or_else(|| "p2p attach rejected".to_string());
                return Err(Status::failed_precondition(reason));
            }
            None => return Err(Status::unavailable("p2p stream closed during attach")),
        }

        *self.inner.outbound.lock().unwrap() = Some(outbound);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => inner.route_inbound(message).await,
                    Ok(None) => break,
                    Err(status) => {
                        debug!("p2p stream failed: {}", status);
                        break;
                    }
                }
            }
            inner.outbound.lock().unwrap().take();
            inner.pending.lock().unwrap().clear();
            inner.disconnected.notify_waiters();
        });
        Ok(())
    }

    /// Send a typed message to one peer.
    pub async fn send_unicast(&self, target_id: &str, payload: Value) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        self.send(RouterMessage::unicast(client_id, target_id, payload))
            .await
    }

    /// Send a typed message to every member of a group.
    pub async fn send_multicast(&self, group_name: &str, payload: Value) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        self.send(RouterMessage::multicast(client_id, group_name, payload))
            .await
    }

    /// Send a typed message to every connected peer but this one.
    pub async fn send_broadcast(&self, payload: Value) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        self.send(RouterMessage::broadcast(client_id, payload)).await
    }

    /// Send a correlated request and await the matching response.
    ///
    /// A UUID `request_id` is attached inside the payload; the call fails
    /// with [`weft::Code::DeadlineExceeded`] if no response arrives within
    /// `timeout`, and the correlation entry is cleaned up either way.
    pub async fn send_request(
        &self,
        target_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<RouterMessage, Status> {
        let client_id = self.require_client_id()?;
        let request_id = Uuid::new_v4().to_string();

        let payload = match payload {
            Value::Object(mut object) => {
                object.insert("request_id".into(), request_id.clone().into());
                Value::Object(object)
            }
            other => serde_json::json!({ "request_id": request_id, "data": other }),
        };

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        if let Err(status) = self
            .send(RouterMessage::request(client_id, target_id, payload))
            .await
        {
            self.inner.pending.lock().unwrap().remove(&request_id);
            return Err(status);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Status::unavailable("connection lost awaiting response")),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(Status::deadline_exceeded(format!(
                    "no response within {timeout:?}"
                )))
            }
        }
    }

    /// Reply to a received `request`, echoing its correlation id.
    pub async fn respond(&self, request: &RouterMessage, payload: Value) -> Result<(), Status> {
        let client_id = self.require_client_id()?;
        let target = request
            .sender_id
            .clone()
            .ok_or_else(|| Status::invalid_argument("request has no sender_id"))?;
        let request_id = request
            .request_id()
            .ok_or_else(|| Status::invalid_argument("request has no request_id"))?
            .to_string();

        let payload = match payload {
            Value::Object(mut object) => {
                object.insert("request_id".into(), request_id.into());
                Value::Object(object)
            }
            other => serde_json::json!({ "request_id": request_id, "data": other }),
        };
        self.send(RouterMessage::response(client_id, target, payload))
            .await
    }

    /// Next routed message (unicast, multicast, broadcast, request, or
    /// error); `None` once the p2p stream has closed.
    pub async fn recv(&self) -> Option<RouterMessage> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    /// Post a keepalive every `interval` until the p2p stream closes.
    /// Choose an interval below the router's inactivity timeout.
    pub fn start_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let outbound = inner.outbound.lock().unwrap().clone();
                let client_id = inner.client_id.lock().unwrap().clone();
                match outbound {
                    Some(outbound) => {
                        if outbound.send(RouterMessage::heartbeat(client_id)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        })
    }

    /// Subscribe to the router's event stream.
    pub async fn subscribe_to_events(&self) -> Result<Streaming<RouterEvent>, Status> {
        let response = self
            .caller
            .server_streaming::<JsonCodec<Empty, RouterEvent>>(
                (SERVICE_NAME, "events"),
                Request::new(Empty {}),
            )
            .await?;
        Ok(response.into_inner())
    }

    /// Resolves once the p2p stream has closed. Returns immediately when
    /// p2p is not active.
    pub async fn closed(&self) {
        // register interest before checking, so a teardown racing this call
        // cannot slip between the check and the wait
        let notified = self.inner.disconnected.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.inner.outbound.lock().unwrap().is_none() {
            return;
        }
        notified.await;
    }

    async fn send(&self, message: RouterMessage) -> Result<(), Status> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Status::failed_precondition("p2p stream is not initialized"))?;
        outbound.send(message).await
    }

    fn require_client_id(&self) -> Result<String, Status> {
        self.client_id()
            .ok_or_else(|| Status::failed_precondition("client is not registered"))
    }
}

impl Inner {
    async fn route_inbound(&self, message: RouterMessage) {
        if message.kind == MessageKind::Response {
            if let Some(request_id) = message.request_id().map(str::to_string) {
                if let Some(waiter) = self.pending.lock().unwrap().remove(&request_id) {
                    let _ = waiter.send(message);
                    return;
                }
            }
        }
        if self.inbound_tx.send(message).await.is_err() {
            debug!("inbound message dropped, client receiver is gone");
        }
    }
}

impl std::fmt::Debug for RouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterClient")
            .field("client_id", &self.client_id())
            .finish()
    }
}
