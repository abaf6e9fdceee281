//! The router core: client registry, message-bus fan-out, liveness monitor,
//! and event distribution.
//!
//! All registry state sits behind a single lock held only long enough to
//! read or write; sends into client sinks always happen outside the lock so
//! a slow peer can never wedge the registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{EventQueue, EventStream};
use crate::message::{
    now_ms, ClientInfo, ClientStatus, EventKind, GetOnlineClientsRequest, JsonMap, MessageKind,
    RouterEvent, RouterMessage,
};
use weft::Status;

/// Tunable knobs of a router instance.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Period of the liveness monitor.
    pub health_check_interval: Duration,
    /// A client silent for this long is forcibly disconnected.
    pub client_inactivity_timeout: Duration,
    /// Bound of each event subscriber's queue.
    pub event_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            health_check_interval: Duration::from_secs(30),
            client_inactivity_timeout: Duration::from_secs(120),
            event_queue_capacity: 64,
        }
    }
}

/// Size of each client's outbound sink.
pub(crate) const SINK_BUFFER: usize = 64;

struct ClientRecord {
    client_id: String,
    client_name: Option<String>,
    groups: HashSet<String>,
    connected_at_ms: u64,
    last_activity: Instant,
    last_activity_ms: u64,
    status: ClientStatus,
    metadata: JsonMap,
}

impl ClientRecord {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_ms = now_ms();
        self.status = ClientStatus::Online;
    }

    fn info(&self) -> ClientInfo {
        let mut groups: Vec<String> = self.groups.iter().cloned().collect();
        groups.sort();
        ClientInfo {
            client_id: self.client_id.clone(),
            client_name: self.client_name.clone(),
            groups,
            status: self.status,
            connected_at_ms: self.connected_at_ms,
            last_activity_ms: self.last_activity_ms,
            metadata: self.metadata.clone(),
        }
    }
}

struct Subscriber {
    queue: Arc<EventQueue>,
    owner: Option<String>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, ClientRecord>,
    sinks: HashMap<String, mpsc::Sender<RouterMessage>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    total_registered: u64,
}

/// Registry of logical clients plus the machinery that routes messages
/// between them and fans events out to subscribers.
///
/// Invariants: every sink has a matching client record (a record may exist
/// without a sink between registration and p2p attachment), and a sink is
/// replaced, never aliased; the previous sink is closed before the swap.
pub struct RouterCore {
    config: RouterConfig,
    started: Instant,
    inner: Mutex<Registry>,
}

impl RouterCore {
    pub fn new(config: RouterConfig) -> Self {
        RouterCore {
            config,
            started: Instant::now(),
            inner: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Insert (or re-register) a client record, optionally attaching a sink.
    ///
    /// A first registration emits `client_connected`; re-registering an
    /// existing id closes the previous sink and suppresses the event.
    pub fn register_client(
        &self,
        client_id: &str,
        sink: Option<mpsc::Sender<RouterMessage>>,
        client_name: Option<String>,
        groups: Vec<String>,
        metadata: JsonMap,
    ) {
        let (previous_sink, is_new) = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.sinks.remove(client_id);
            if let Some(sink) = sink {
                inner.sinks.insert(client_id.to_string(), sink);
            }

            let is_new = !inner.clients.contains_key(client_id);
            let record = inner
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientRecord {
                    client_id: client_id.to_string(),
                    client_name: None,
                    groups: HashSet::new(),
                    connected_at_ms: now_ms(),
                    last_activity: Instant::now(),
                    last_activity_ms: now_ms(),
                    status: ClientStatus::Online,
                    metadata: JsonMap::new(),
                });
            record.client_name = client_name.clone();
            record.groups = groups.into_iter().collect();
            record.metadata = metadata;
            record.touch();

            if is_new {
                inner.total_registered += 1;
            }
            (previous, is_new)
        };

        // replaced, not aliased
        drop(previous_sink);

        if is_new {
            info!(client_id, "client registered");
            let mut data = JsonMap::new();
            data.insert("client_id".into(), client_id.into());
            if let Some(name) = client_name {
                data.insert("client_name".into(), name.into());
            }
            self.publish(RouterEvent::new(EventKind::ClientConnected, data));
        } else {
            debug!(client_id, "client re-registered, connect event suppressed");
        }
    }

    /// Swap in a new outbound sink for `client_id`, closing the old one.
    pub fn replace_client_stream(
        &self,
        client_id: &str,
        sink: mpsc::Sender<RouterMessage>,
    ) -> Result<(), Status> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .clients
                .get_mut(client_id)
                .ok_or_else(|| Status::not_found(format!("client {client_id:?} is not registered")))?;
            record.touch();
            inner.sinks.insert(client_id.to_string(), sink)
        };
        drop(previous);
        Ok(())
    }

    /// Detach `current` if it is still the client's sink, keeping the record
    /// so the client may reconnect.
    pub fn detach_client_stream(&self, client_id: &str, current: &mpsc::WeakSender<RouterMessage>) {
        let Some(current) = current.upgrade() else {
            // the channel is already fully closed, so it cannot be the one
            // in the registry
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.sinks.get(client_id), Some(sink) if sink.same_channel(&current)) {
            inner.sinks.remove(client_id);
        }
    }

    /// Remove the record and sink, emit `client_disconnected`, and clean up
    /// the client's event subscriptions. Returns false for unknown ids.
    pub async fn disconnect_client(&self, client_id: &str, reason: &str) -> bool {
        let (record, orphaned) = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner.clients.remove(client_id);
            inner.sinks.remove(client_id);

            let owned: Vec<u64> = inner
                .subscribers
                .iter()
                .filter(|(_, sub)| sub.owner.as_deref() == Some(client_id))
                .map(|(id, _)| *id)
                .collect();
            let orphaned: Vec<Arc<EventQueue>> = owned
                .into_iter()
                .filter_map(|id| inner.subscribers.remove(&id))
                .map(|sub| sub.queue)
                .collect();
            (record, orphaned)
        };

        for queue in orphaned {
            queue.close();
        }

        let Some(record) = record else {
            return false;
        };

        info!(client_id, reason, "client disconnected");
        let mut data = JsonMap::new();
        data.insert("client_id".into(), client_id.into());
        data.insert("reason".into(), reason.into());
        if let Some(name) = record.client_name {
            data.insert("client_name".into(), name.into());
        }
        self.publish(RouterEvent::new(EventKind::ClientDisconnected, data));
        self.publish_topology();
        true
    }

    /// Route one message to a client's sink, updating its activity.
    /// Returns whether the message was deliverable.
    pub async fn send_to_client(&self, client_id: &str, message: RouterMessage) -> bool {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(record) = inner.clients.get_mut(client_id) {
                record.touch();
            }
            inner.sinks.get(client_id).cloned()
        };
        match sink {
            Some(sink) => sink.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Deliver to every member of `group` except `exclude`; returns the
    /// delivered count.
    pub async fn send_to_group(
        &self,
        group: &str,
        message: RouterMessage,
        exclude: Option<&str>,
    ) -> usize {
        let members = {
            let mut inner = self.inner.lock().unwrap();
            let member_ids: Vec<String> = inner
                .clients
                .values()
                .filter(|record| record.groups.contains(group))
                .filter(|record| Some(record.client_id.as_str()) != exclude)
                .map(|record| record.client_id.clone())
                .collect();
            collect_sinks(&mut inner, &member_ids)
        };
        deliver_all(members, message).await
    }

    /// Deliver to every connected sink except `exclude`; returns the
    /// delivered count.
    pub async fn send_broadcast(&self, message: RouterMessage, exclude: Option<&str>) -> usize {
        let recipients = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<String> = inner
                .sinks
                .keys()
                .filter(|id| Some(id.as_str()) != exclude)
                .cloned()
                .collect();
            collect_sinks(&mut inner, &ids)
        };
        deliver_all(recipients, message).await
    }

    /// Route one inbound p2p message from `sender_id`, replying to the
    /// sender with an `error` message on misuse or an unknown target.
    pub async fn route(&self, sender_id: &str, mut message: RouterMessage) {
        self.touch_activity(sender_id);
        message.sender_id = Some(sender_id.to_string());

        match message.kind {
            MessageKind::Unicast | MessageKind::Request | MessageKind::Response => {
                let Some(target) = message.target_id.clone() else {
                    self.error_to(sender_id, "message is missing target_id").await;
                    return;
                };
                if !self.send_to_client(&target, message).await {
                    self.error_to(sender_id, format!("client {target:?} not found"))
                        .await;
                }
            }
            MessageKind::Multicast => {
                let Some(group) = message.group_name.clone() else {
                    self.error_to(sender_id, "multicast is missing group_name").await;
                    return;
                };
                self.send_to_group(&group, message, Some(sender_id)).await;
            }
            MessageKind::Broadcast => {
                self.send_broadcast(message, Some(sender_id)).await;
            }
            MessageKind::Ping => {
                let _ = self
                    .send_to_client(sender_id, RouterMessage::pong(sender_id))
                    .await;
            }
            MessageKind::Heartbeat | MessageKind::Pong => {
                // activity already updated above
            }
            MessageKind::Error => {
                debug!(sender_id, error = ?message.error_message, "client reported an error");
            }
            MessageKind::Register | MessageKind::RegisterResponse => {
                self.error_to(sender_id, "registration is not valid on a p2p stream")
                    .await;
            }
        }
    }

    async fn error_to(&self, client_id: &str, error_message: impl Into<String>) {
        let _ = self
            .send_to_client(client_id, RouterMessage::error(error_message))
            .await;
    }

    pub fn touch_activity(&self, client_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.clients.get_mut(client_id) {
            record.touch();
        }
    }

    pub fn is_client_online(&self, client_id: &str) -> bool {
        self.inner.lock().unwrap().clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    /// Snapshot of clients matching the filter: any of `groups` (when given)
    /// and every `metadata` pair (when given).
    pub fn online_clients(&self, request: &GetOnlineClientsRequest) -> Vec<ClientInfo> {
        let inner = self.inner.lock().unwrap();
        let mut clients: Vec<ClientInfo> = inner
            .clients
            .values()
            .filter(|record| match &request.groups {
                Some(groups) if !groups.is_empty() => {
                    groups.iter().any(|group| record.groups.contains(group))
                }
                _ => true,
            })
            .filter(|record| match &request.metadata {
                Some(filter) => filter
                    .iter()
                    .all(|(key, value)| record.metadata.get(key) == Some(value)),
                None => true,
            })
            .map(ClientRecord::info)
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Merge a client's metadata (and optionally replace its groups),
    /// emitting `client_capabilities_updated`.
    pub fn update_client_metadata(
        &self,
        client_id: &str,
        metadata: JsonMap,
        groups: Option<Vec<String>>,
    ) -> Result<(), Status> {
        let merged = {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .clients
                .get_mut(client_id)
                .ok_or_else(|| Status::not_found(format!("client {client_id:?} is not registered")))?;
            for (key, value) in metadata {
                record.metadata.insert(key, value);
            }
            if let Some(groups) = groups {
                record.groups = groups.into_iter().collect();
            }
            record.touch();
            record.metadata.clone()
        };

        let mut data = JsonMap::new();
        data.insert("client_id".into(), client_id.into());
        data.insert("metadata".into(), Value::Object(merged));
        self.publish(RouterEvent::new(EventKind::ClientCapabilitiesUpdated, data));
        Ok(())
    }

    /// Open an event subscription. The first element is always a
    /// `router_stats` snapshot; live events follow.
    pub fn subscribe_to_events(&self, owner: Option<String>) -> EventStream {
        let queue = EventQueue::new(self.config.event_queue_capacity);
        queue.push(self.stats_snapshot());

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                queue: queue.clone(),
                owner,
            },
        );
        EventStream::new(queue)
    }

    fn stats_snapshot(&self) -> RouterEvent {
        let inner = self.inner.lock().unwrap();
        let mut data = JsonMap::new();
        data.insert("active_clients".into(), (inner.clients.len() as u64).into());
        data.insert("total_registered".into(), inner.total_registered.into());
        data.insert(
            "events_subscribers".into(),
            (inner.subscribers.len() as u64).into(),
        );
        data.insert(
            "uptime_ms".into(),
            (self.started.elapsed().as_millis() as u64).into(),
        );
        RouterEvent::new(EventKind::RouterStats, data)
    }

    // Fan an event out to every live subscriber queue; a full queue drops
    // its oldest event and receives a health_warning in exchange.
    fn publish(&self, event: RouterEvent) {
        let queues: Vec<Arc<EventQueue>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.retain(|_, sub| !sub.queue.is_closed());
            inner.subscribers.values().map(|sub| sub.queue.clone()).collect()
        };

        for queue in queues {
            if queue.push(event.clone()) {
                warn!("event subscriber overflowed, oldest event dropped");
                let mut data = JsonMap::new();
                data.insert("reason".into(), "event queue overflow".into());
                queue.push(RouterEvent::new(EventKind::HealthWarning, data));
            }
        }
    }

    fn publish_topology(&self) {
        let active: Vec<Value> = {
            let inner = self.inner.lock().unwrap();
            let mut ids: Vec<&String> = inner.clients.keys().collect();
            ids.sort();
            ids.into_iter().map(|id| Value::String(id.clone())).collect()
        };
        let mut data = JsonMap::new();
        data.insert("count".into(), (active.len() as u64).into());
        data.insert("active_clients".into(), Value::Array(active));
        self.publish(RouterEvent::new(EventKind::TopologyChanged, data));
    }

    /// Start the periodic liveness monitor.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(core.config.health_check_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await; // the immediate first tick
            loop {
                ticks.tick().await;
                core.sweep().await;
            }
        })
    }

    /// One monitor pass: idle marking, inactivity disconnects, zombie
    /// cleanup, and stale-subscriber reaping.
    pub async fn sweep(&self) {
        let idle_after = 2 * self.config.health_check_interval;
        let stale_after = self.config.client_inactivity_timeout.mul_f64(0.8);

        let mut to_disconnect: Vec<(String, &'static str)> = Vec::new();
        let mut idled = false;

        let stale_queues = {
            let mut inner = self.inner.lock().unwrap();
            let Registry {
                clients, sinks, ..
            } = &mut *inner;

            for (client_id, record) in clients.iter_mut() {
                let inactive = record.last_activity.elapsed();
                if inactive >= self.config.client_inactivity_timeout {
                    to_disconnect.push((client_id.clone(), "inactivity timeout"));
                    continue;
                }

                // the two zombie predicates are deliberately separate:
                // a closed sink, and a record with no sink at all
                let sink_closed = matches!(sinks.get(client_id), Some(sink) if sink.is_closed());
                let stream_missing = !sinks.contains_key(client_id) && inactive >= idle_after;
                if sink_closed || stream_missing {
                    to_disconnect.push((client_id.clone(), "zombie connection"));
                    continue;
                }

                if inactive >= idle_after && record.status == ClientStatus::Online {
                    record.status = ClientStatus::Idle;
                    idled = true;
                }
            }

            // a subscriber is stale once it sits on a backlog without
            // draining, not merely because the router has been quiet
            let stale: Vec<u64> = inner
                .subscribers
                .iter()
                .filter(|(_, sub)| {
                    sub.queue.is_closed()
                        || (sub.queue.has_backlog() && sub.queue.idle_for() >= stale_after)
                })
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| inner.subscribers.remove(&id))
                .map(|sub| sub.queue)
                .collect::<Vec<_>>()
        };

        for queue in stale_queues {
            queue.close();
        }

        let disconnected = !to_disconnect.is_empty();
        for (client_id, reason) in to_disconnect {
            self.disconnect_client(&client_id, reason).await;
        }

        // disconnect_client already published topology for its changes
        if idled && !disconnected {
            self.publish_topology();
        }
    }
}

fn collect_sinks(
    inner: &mut Registry,
    ids: &[String],
) -> Vec<mpsc::Sender<RouterMessage>> {
    let mut sinks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(sink) = inner.sinks.get(id) {
            sinks.push(sink.clone());
            if let Some(record) = inner.clients.get_mut(id) {
                record.touch();
            }
        }
    }
    sinks
}

async fn deliver_all(sinks: Vec<mpsc::Sender<RouterMessage>>, message: RouterMessage) -> usize {
    let mut delivered = 0;
    for sink in sinks {
        if sink.send(message.clone()).await.is_ok() {
            delivered += 1;
        }
    }
    delivered
}

impl std::fmt::Debug for RouterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterCore")
            .field("clients", &self.client_count())
            .finish()
    }
}
