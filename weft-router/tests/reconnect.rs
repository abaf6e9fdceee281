use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;

use weft_router::message::{GetOnlineClientsRequest, JsonMap, RegisterRequest};
use weft_router::{
    BackoffStrategy, ConnectionState, ReconnectPolicy, ReconnectingClient, RouterConfig,
    RouterCore, RouterServer, RouterServerConfig,
};

async fn start_server() -> (String, Arc<RouterCore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = RouterServer::new(RouterServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        router: RouterConfig {
            health_check_interval: Duration::from_millis(100),
            client_inactivity_timeout: Duration::from_secs(5),
            event_queue_capacity: 32,
        },
    });
    let core = server.core();
    tokio::spawn(server.serve_on(listener));

    (format!("ws://{addr}"), core)
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        strategy: BackoffStrategy::Fixed,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
        max_attempts: None,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn registration() -> RegisterRequest {
    let mut metadata = JsonMap::new();
    metadata.insert("zone".into(), json!("eu"));
    RegisterRequest {
        client_name: Some("phoenix".to_string()),
        groups: vec!["watchers".to_string()],
        metadata,
    }
}

#[tokio::test]
async fn reconnect_replays_registration_verbatim() {
    let (url, core) = start_server().await;

    let reconnecting = Arc::new(ReconnectingClient::new(url, registration(), fast_policy()));
    let mut states = reconnecting.states();
    tokio::spawn(reconnecting.clone().run());

    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("never connected")
    .unwrap();

    let first_id = reconnecting.current().unwrap().client_id().unwrap();
    let clients = core.online_clients(&GetOnlineClientsRequest::default());
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_name.as_deref(), Some("phoenix"));
    assert_eq!(clients[0].groups, ["watchers"]);
    assert_eq!(clients[0].metadata.get("zone"), Some(&json!("eu")));

    // sever the session from the router side; the wrapper must come back
    // with the same retained parameters under a fresh id
    core.disconnect_client(&first_id, "kicked").await;

    let second_id = timeout(Duration::from_secs(3), async {
        loop {
            if let Some(client) = reconnecting.current() {
                if let Some(id) = client.client_id() {
                    if id != first_id {
                        return id;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("never reconnected");
    assert_ne!(first_id, second_id);

    let clients = core.online_clients(&GetOnlineClientsRequest::default());
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_id, second_id);
    assert_eq!(clients[0].client_name.as_deref(), Some("phoenix"));
    assert_eq!(clients[0].groups, ["watchers"]);
    assert_eq!(clients[0].metadata.get("zone"), Some(&json!("eu")));

    reconnecting.stop();
}

#[tokio::test]
async fn stopped_wrapper_ends_in_the_stopped_state() {
    // nothing is listening on this port, so every attempt fails
    let reconnecting = Arc::new(ReconnectingClient::new(
        "ws://127.0.0.1:9",
        registration(),
        ReconnectPolicy {
            max_attempts: Some(2),
            ..fast_policy()
        },
    ));
    let mut states = reconnecting.states();
    tokio::spawn(reconnecting.clone().run());

    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Stopped),
    )
    .await
    .expect("never stopped")
    .unwrap();

    assert!(reconnecting.current().is_none());
}
