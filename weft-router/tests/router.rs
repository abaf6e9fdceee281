use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use weft::client::outbound_channel;
use weft::codec::JsonCodec;
use weft::server::Responder;
use weft::transport::memory::MemoryTransport;
use weft::transport::Transport;
use weft::{Caller, Code, Request};
use weft_router::message::{GetOnlineClientsRequest, JsonMap, RegisterRequest};
use weft_router::{
    router_contract, EventKind, MessageKind, RouterClient, RouterConfig, RouterCore, RouterMessage,
};

fn test_core() -> Arc<RouterCore> {
    Arc::new(RouterCore::new(RouterConfig {
        health_check_interval: Duration::from_millis(50),
        client_inactivity_timeout: Duration::from_millis(150),
        event_queue_capacity: 32,
    }))
}

// One in-memory connection per client, every endpoint sharing the core.
fn connect(core: &Arc<RouterCore>) -> (RouterClient, Arc<dyn Transport>) {
    let (caller_end, responder_end) = MemoryTransport::pair();
    let _server = Responder::new(Arc::new(responder_end))
        .add_service(router_contract(core.clone()))
        .unwrap()
        .start();
    let transport: Arc<dyn Transport> = Arc::new(caller_end);
    (RouterClient::new(transport.clone()), transport)
}

async fn join(core: &Arc<RouterCore>, name: &str, groups: &[&str]) -> RouterClient {
    let (client, _transport) = connect(core);
    client
        .register(RegisterRequest {
            client_name: Some(name.to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            metadata: JsonMap::new(),
        })
        .await
        .unwrap();
    client.initialize_p2p().await.unwrap();
    client
}

#[tokio::test]
async fn unicast_reaches_only_the_target() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;
    let bob = join(&core, "bob", &[]).await;
    let charlie = join(&core, "charlie", &[]).await;

    alice
        .send_unicast(&bob.client_id().unwrap(), json!({"text": "hi"}))
        .await
        .unwrap();

    let received = bob.recv().await.unwrap();
    assert_eq!(received.kind, MessageKind::Unicast);
    assert_eq!(received.sender_id, alice.client_id());
    assert_eq!(received.payload, Some(json!({"text": "hi"})));

    // neither the sender nor a bystander hears anything
    assert!(timeout(Duration::from_millis(50), alice.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(50), charlie.recv()).await.is_err());
}

#[tokio::test]
async fn unicast_to_unknown_yields_one_error_message() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;

    alice.send_unicast("unknown", json!({})).await.unwrap();

    let error = alice.recv().await.unwrap();
    assert_eq!(error.kind, MessageKind::Error);
    assert_eq!(error.success, Some(false));
    assert!(timeout(Duration::from_millis(50), alice.recv()).await.is_err());
}

#[tokio::test]
async fn broadcast_excludes_the_sender() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;
    let bob = join(&core, "bob", &[]).await;
    let charlie = join(&core, "charlie", &[]).await;

    alice.send_broadcast(json!({"n": 1})).await.unwrap();

    assert_eq!(bob.recv().await.unwrap().kind, MessageKind::Broadcast);
    assert_eq!(charlie.recv().await.unwrap().kind, MessageKind::Broadcast);
    assert!(timeout(Duration::from_millis(50), alice.recv()).await.is_err());
}

#[tokio::test]
async fn multicast_reaches_group_members_only() {
    let core = test_core();
    let alice = join(&core, "alice", &["ops"]).await;
    let bob = join(&core, "bob", &["ops"]).await;
    let dave = join(&core, "dave", &["dev"]).await;

    alice.send_multicast("ops", json!({})).await.unwrap();

    assert_eq!(bob.recv().await.unwrap().kind, MessageKind::Multicast);
    assert!(timeout(Duration::from_millis(50), dave.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(50), alice.recv()).await.is_err());
}

#[tokio::test]
async fn request_without_response_times_out() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;
    let bob = join(&core, "bob", &[]).await;

    let err = alice
        .send_request(
            &bob.client_id().unwrap(),
            json!({"q": "?"}),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    // bob saw the request and stays fully usable
    let request = bob.recv().await.unwrap();
    assert_eq!(request.kind, MessageKind::Request);
    bob.ping().await.unwrap();
}

#[tokio::test]
async fn request_response_correlates_by_id() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;
    let bob = join(&core, "bob", &[]).await;
    let bob_id = bob.client_id().unwrap();

    tokio::spawn(async move {
        let request = bob.recv().await.unwrap();
        assert_eq!(request.kind, MessageKind::Request);
        bob.respond(&request, json!({"a": 42})).await.unwrap();
        // hold bob's connection open until the response is routed
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let response = alice
        .send_request(&bob_id, json!({"q": "?"}), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.payload.unwrap().get("a"), Some(&json!(42)));
}

#[tokio::test]
async fn p2p_with_unregistered_sender_is_refused() {
    let core = test_core();
    let (caller_end, responder_end) = MemoryTransport::pair();
    let _server = Responder::new(Arc::new(responder_end))
        .add_service(router_contract(core.clone()))
        .unwrap()
        .start();
    let caller = Caller::new(Arc::new(caller_end));

    let (tx, rx) = outbound_channel::<RouterMessage>(8);
    tx.send(RouterMessage::heartbeat(Some("bogus".into())))
        .await
        .unwrap();

    let response = caller
        .streaming::<JsonCodec<RouterMessage, RouterMessage>, _>(
            ("router", "p2p"),
            Request::new(rx),
        )
        .await
        .unwrap();

    let mut inbound = response.into_inner();
    let first = inbound.message().await.unwrap().unwrap();
    assert_eq!(first.kind, MessageKind::Error);
    // the router processes nothing further on this stream
    assert!(inbound.message().await.unwrap().is_none());
}

#[tokio::test]
async fn events_start_with_a_stats_snapshot() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;

    let mut events = alice.subscribe_to_events().await.unwrap();
    let first = events.message().await.unwrap().unwrap();
    assert_eq!(first.kind, EventKind::RouterStats);
    assert_eq!(first.data.get("active_clients"), Some(&json!(1)));
}

#[tokio::test]
async fn update_metadata_emits_capabilities_event() {
    let core = test_core();
    let alice = join(&core, "alice", &[]).await;

    let mut events = alice.subscribe_to_events().await.unwrap();
    events.message().await.unwrap(); // stats snapshot

    let mut metadata = JsonMap::new();
    metadata.insert("zone".into(), json!("eu"));
    alice.update_metadata(metadata, None).await.unwrap();

    let event = events.message().await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::ClientCapabilitiesUpdated);
    assert_eq!(event.data.get("client_id"), Some(&json!(alice.client_id().unwrap())));

    let found = alice
        .get_online_clients(GetOnlineClientsRequest {
            groups: None,
            metadata: Some({
                let mut filter = JsonMap::new();
                filter.insert("zone".into(), json!("eu"));
                filter
            }),
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn silent_client_is_cleaned_up_within_two_intervals() {
    let core = test_core();
    let _monitor = core.spawn_monitor();

    let alice = join(&core, "alice", &[]).await;
    let bob = join(&core, "bob", &[]).await;
    bob.start_heartbeat(Duration::from_millis(40));

    let mut events = core.subscribe_to_events(None);
    events.recv().await; // stats snapshot

    // alice goes silent; within inactivity_timeout + 2 intervals she is gone
    let deadline = Duration::from_millis(600);
    let disconnected = timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(event) if event.kind == EventKind::ClientDisconnected => return event,
                Some(_) => continue,
                None => panic!("event stream closed early"),
            }
        }
    })
    .await
    .expect("no disconnect within the deadline");

    assert_eq!(
        disconnected.data.get("client_id"),
        Some(&json!(alice.client_id().unwrap()))
    );

    let topology = timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(event) if event.kind == EventKind::TopologyChanged => return event,
                Some(_) => continue,
                None => panic!("event stream closed early"),
            }
        }
    })
    .await
    .expect("no topology change within the deadline");
    assert_eq!(topology.data.get("count"), Some(&json!(1)));

    assert!(!core.is_client_online(&alice.client_id().unwrap()));
    assert!(core.is_client_online(&bob.client_id().unwrap()));
}

#[tokio::test]
async fn closed_transport_becomes_a_zombie_and_is_reaped() {
    // a long inactivity timeout, so only the zombie predicates can fire
    let core = Arc::new(RouterCore::new(RouterConfig {
        health_check_interval: Duration::from_millis(50),
        client_inactivity_timeout: Duration::from_secs(10),
        event_queue_capacity: 32,
    }));
    let _monitor = core.spawn_monitor();

    let (client, transport) = connect(&core);
    client
        .register(RegisterRequest {
            client_name: Some("ghost".to_string()),
            groups: vec![],
            metadata: JsonMap::new(),
        })
        .await
        .unwrap();
    client.initialize_p2p().await.unwrap();
    let ghost_id = client.client_id().unwrap();

    let mut events = core.subscribe_to_events(None);
    events.recv().await; // stats snapshot

    // the connection dies without unregistering
    transport.close().await;

    let disconnected = timeout(Duration::from_millis(600), async {
        loop {
            match events.recv().await {
                Some(event) if event.kind == EventKind::ClientDisconnected => return event,
                Some(_) => continue,
                None => panic!("event stream closed early"),
            }
        }
    })
    .await
    .expect("zombie not reaped");

    assert_eq!(disconnected.data.get("client_id"), Some(&json!(ghost_id)));
    assert_eq!(
        disconnected.data.get("reason"),
        Some(&json!("zombie connection"))
    );
    assert!(!core.is_client_online(&ghost_id));
}
