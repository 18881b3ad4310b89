//! End-to-end client ↔ gateway ↔ backend flows.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use cluster_gateway::protocol::envelope::{names, Envelope};
use cluster_gateway::protocol::kex::PUBLIC_KEY_LEN;
use cluster_gateway::{Gateway, RunningGateway};

mod common;
use common::{bytes, client_bound, eventually, forward, gateway_config, target, wait_routable, MockBackend, TestClient};

async fn start(config: cluster_gateway::GatewayConfig) -> RunningGateway {
    Gateway::bind(config).await.unwrap().start()
}

async fn game_gateway(backend: &MockBackend) -> RunningGateway {
    let config = gateway_config(
        vec![target(1, "game", backend.addr)],
        vec![
            forward("game.query", "game", false, true),
            forward("game.move", "game", true, false),
            forward("game.hello", "game", false, false),
            client_bound("game.answer"),
            client_bound("game.state"),
        ],
    );
    let running = start(config).await;
    assert!(wait_routable(&running, "game").await);
    running
}

#[tokio::test]
async fn ping_is_answered_by_gateway() {
    let running = start(gateway_config(vec![], vec![])).await;
    let mut client = TestClient::connect(running.local_addr()).await;

    client.send(names::PING, b"hi").await;
    let pong = client.recv().await;
    assert_eq!(pong.name, names::PONG);
    assert_eq!(&pong.payload[..], b"hi");

    running.shutdown().await;
}

#[tokio::test]
async fn request_reply_round_trip() {
    let mut backend = MockBackend::start(&[("game.query", "game.answer")]).await;
    let running = game_gateway(&backend).await;
    assert_eq!(backend.registrations(), 1);

    let mut client = TestClient::connect(running.local_addr()).await;
    client.send("game.query", b"where am i").await;

    let envelope = backend.next_named("game.query").await;
    assert_ne!(envelope.serial, 0);
    assert_eq!(&envelope.payload[..], b"where am i");

    let reply = client.recv().await;
    assert_eq!(reply.name, "game.answer");
    assert_eq!(&reply.payload[..], b"where am i");
    assert!(eventually(|| running.router().pending().is_empty()).await);

    running.shutdown().await;
}

#[tokio::test]
async fn backend_push_reaches_client() {
    let backend = MockBackend::start(&[]).await;
    let running = game_gateway(&backend).await;

    let mut client = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);
    let handle = running.registry().handles()[0];

    assert!(backend.push(Envelope::new(handle, 0, "game.state", bytes("tick"))));
    let frame = client.recv().await;
    assert_eq!(frame.name, "game.state");
    assert_eq!(&frame.payload[..], b"tick");

    running.shutdown().await;
}

#[tokio::test]
async fn auth_required_message_waits_for_authorize() {
    let mut backend = MockBackend::start(&[]).await;
    let running = game_gateway(&backend).await;

    let mut client = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);
    let handle = running.registry().handles()[0];

    client.send("game.move", b"early").await;
    client.send("game.hello", b"").await;
    assert_eq!(backend.next_envelope().await.name, "game.hello");

    assert!(backend.push(Envelope::new(handle, 0, names::AUTHORIZE, bytes(""))));
    assert!(eventually(|| {
        running
            .registry()
            .grab(handle)
            .is_some_and(|conn| conn.is_authorized())
    })
    .await);

    client.send("game.move", b"late").await;
    let envelope = backend.next_envelope().await;
    assert_eq!(envelope.name, "game.move");
    assert_eq!(&envelope.payload[..], b"late");
    assert_eq!(envelope.handle, handle);

    running.shutdown().await;
}

#[tokio::test]
async fn unauthorized_client_closed_after_countdown() {
    let mut config = gateway_config(vec![], vec![]);
    config.auth.timeout_ms = 200;
    let running = start(config).await;

    let mut client = TestClient::connect(running.local_addr()).await;
    assert!(client.is_closed_within(Duration::from_secs(2)).await);
    assert!(eventually(|| running.registry().is_empty()).await);

    running.shutdown().await;
}

#[tokio::test]
async fn backend_kick_closes_client() {
    let backend = MockBackend::start(&[]).await;
    let running = game_gateway(&backend).await;

    let mut client = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);
    let handle = running.registry().handles()[0];

    assert!(backend.push(Envelope::new(handle, 0, names::KICK, bytes(""))));
    assert!(client.is_closed_within(Duration::from_secs(2)).await);

    running.shutdown().await;
}

#[tokio::test]
async fn disconnect_notifies_offline_service() {
    let mut backend = MockBackend::start(&[]).await;
    let mut config = gateway_config(vec![target(1, "game", backend.addr)], vec![]);
    config.routing.offline_service = Some("game".to_string());
    let running = start(config).await;
    assert!(wait_routable(&running, "game").await);

    let client = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);
    let handle = running.registry().handles()[0];
    drop(client);

    let offline = backend.next_named(names::OFFLINE).await;
    assert_eq!(offline.handle, handle);
    assert!(eventually(|| running.registry().is_empty()).await);

    running.shutdown().await;
}

#[tokio::test]
async fn connection_over_capacity_is_refused() {
    let mut config = gateway_config(vec![], vec![]);
    config.listener.max_connections = 1;
    let running = start(config).await;

    let _first = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);

    let mut second = TcpStream::connect(running.local_addr()).await.unwrap();
    let mut buf = [0u8; PUBLIC_KEY_LEN];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(running.registry().len(), 1);

    running.shutdown().await;
}

#[tokio::test]
async fn silent_peer_dropped_after_handshake_timeout() {
    let mut config = gateway_config(vec![], vec![]);
    config.auth.handshake_timeout_ms = 200;
    let running = start(config).await;

    let mut raw = TcpStream::connect(running.local_addr()).await.unwrap();
    let mut public = [0u8; PUBLIC_KEY_LEN];
    raw.read_exact(&mut public).await.unwrap();

    let mut rest = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut rest))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(eventually(|| running.registry().is_empty()).await);

    running.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let running = start(gateway_config(vec![], vec![])).await;
    let mut client = TestClient::connect(running.local_addr()).await;
    assert!(eventually(|| running.registry().len() == 1).await);

    let registry = running.registry().clone();
    running.shutdown().await;

    assert!(registry.is_empty());
    assert!(client.is_closed_within(Duration::from_secs(2)).await);
}
