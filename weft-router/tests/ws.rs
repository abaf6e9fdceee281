use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use weft::transport::ws::WsTransport;
use weft_router::message::{JsonMap, RegisterRequest};
use weft_router::{MessageKind, RouterClient, RouterConfig, RouterServer, RouterServerConfig};

async fn start_server() -> String {
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
    tokio::spawn(server.serve_on(listener));

    format!("ws://{addr}")
}

async fn join(url: &str, name: &str) -> RouterClient {
    let transport = WsTransport::connect(url).await.unwrap();
    let client = RouterClient::new(Arc::new(transport));
    client
        .register(RegisterRequest {
            client_name: Some(name.to_string()),
            groups: vec![],
            metadata: JsonMap::new(),
        })
        .await
        .unwrap();
    client.initialize_p2p().await.unwrap();
    client
}

#[tokio::test]
async fn peers_route_over_a_real_websocket_server() {
    let url = start_server().await;

    let alice = join(&url, "alice").await;
    let bob = join(&url, "bob").await;

    alice
        .send_unicast(&bob.client_id().unwrap(), json!({"text": "over ws"}))
        .await
        .unwrap();

    let received = bob.recv().await.unwrap();
    assert_eq!(received.kind, MessageKind::Unicast);
    assert_eq!(received.sender_id, alice.client_id());
    assert_eq!(received.payload, Some(json!({"text": "over ws"})));
}

#[tokio::test]
async fn ping_round_trips_timestamps() {
    let url = start_server().await;
    let alice = join(&url, "alice").await;

    let pong = alice.ping().await.unwrap();
    assert!(pong.client_ts > 0);
    // same clock on both ends here, modulo a little scheduling skew
    assert!(pong.server_ts + 1_000 >= pong.client_ts);
}
