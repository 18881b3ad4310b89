//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use cluster_gateway::config::{GatewayConfig, MessageConfig, MessageRoute, TargetConfig};
use cluster_gateway::protocol::cipher::StreamCipher;
use cluster_gateway::protocol::envelope::{decode_envelope, encode_envelope, names, Envelope};
use cluster_gateway::protocol::frame::{Frame, FrameDecoder, FrameEncoder};
use cluster_gateway::protocol::handshake::client_handshake;

pub const WAIT: Duration = Duration::from_secs(3);

/// A backend server that acks registration, records envelopes and
/// answers the names in its reply map.
pub struct MockBackend {
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Envelope>,
    link: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    registrations: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(replies: &[(&str, &str)]) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), replies).await
    }

    pub async fn start_on(addr: SocketAddr, replies: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let replies: Arc<HashMap<String, String>> = Arc::new(
            replies
                .iter()
                .map(|(req, rep)| (req.to_string(), rep.to_string()))
                .collect(),
        );
        let (tx, received) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(None));
        let registrations = Arc::new(AtomicUsize::new(0));

        let task = {
            let link = link.clone();
            let registrations = registrations.clone();
            tokio::spawn(async move {
                let mut links = JoinSet::new();
                while let Ok((socket, _)) = listener.accept().await {
                    links.spawn(serve_link(
                        socket,
                        replies.clone(),
                        tx.clone(),
                        link.clone(),
                        registrations.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            link,
            registrations,
            task,
        }
    }

    /// Push an envelope down the current gateway link.
    pub fn push(&self, envelope: Envelope) -> bool {
        match self.link.lock().unwrap().as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("no envelope reached the backend")
            .expect("backend channel closed")
    }

    pub async fn next_named(&mut self, name: &str) -> Envelope {
        loop {
            let envelope = self.next_envelope().await;
            if envelope.name == name {
                return envelope;
            }
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every open link.
    pub fn stop(self) {
        self.task.abort();
    }
}

async fn serve_link(
    socket: TcpStream,
    replies: Arc<HashMap<String, String>>,
    received: mpsc::UnboundedSender<Envelope>,
    link: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    registrations: Arc<AtomicUsize>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    *link.lock().unwrap() = Some(out_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let bytes = encode_envelope(&envelope).unwrap();
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::new();
    'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        while let Some(envelope) = decode_envelope(&mut buf, 64 * 1024).unwrap() {
            if envelope.name == names::REGISTER {
                registrations.fetch_add(1, Ordering::SeqCst);
                let ack = Envelope::new(envelope.handle, 0, names::REGISTER_ACK, &[0u8][..]);
                if out_tx.send(ack).is_err() {
                    break 'read;
                }
                continue;
            }
            if let Some(reply) = replies.get(&envelope.name) {
                let _ = out_tx.send(Envelope::new(
                    envelope.handle,
                    envelope.serial,
                    reply.clone(),
                    envelope.payload.clone(),
                ));
            }
            let _ = received.send(envelope);
        }
    }

    writer_task.abort();
}

/// Client side of the wire protocol.
pub struct TestClient {
    stream: TcpStream,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let secret = client_handshake(&mut stream, WAIT).await.unwrap();

        let mut encoder = FrameEncoder::new();
        encoder.set_cipher(StreamCipher::from_secret(&secret));
        let mut decoder = FrameDecoder::new(64 * 1024);
        decoder.set_cipher(StreamCipher::from_secret(&secret));

        Self {
            stream,
            encoder,
            decoder,
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, name: &str, payload: &[u8]) {
        let bytes = self.encoder.encode(name, payload).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next frame, or `None` if the gateway closed the socket or nothing
    /// arrived within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let read = tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await;
            match read {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    pub async fn recv(&mut self) -> Frame {
        self.recv_within(WAIT).await.expect("no frame from gateway")
    }

    /// True once the gateway closes the connection.
    pub async fn is_closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

pub fn target(id: u32, service: &str, addr: SocketAddr) -> TargetConfig {
    TargetConfig {
        id,
        name: service.to_string(),
        address: addr.to_string(),
        timeout_ms: 500,
        out_queue: 64,
    }
}

pub fn forward(name: &str, service: &str, auth: bool, awaits_reply: bool) -> MessageConfig {
    MessageConfig {
        name: name.to_string(),
        route: MessageRoute::Forward,
        service: Some(service.to_string()),
        auth,
        awaits_reply,
    }
}

pub fn client_bound(name: &str) -> MessageConfig {
    MessageConfig {
        name: name.to_string(),
        route: MessageRoute::Client,
        service: None,
        auth: false,
        awaits_reply: false,
    }
}

/// Config bound to an ephemeral port with fast guard intervals.
pub fn gateway_config(targets: Vec<TargetConfig>, messages: Vec<MessageConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.auth.timeout_ms = 0;
    config.auth.guard_interval_ms = 50;
    config.auth.handshake_timeout_ms = 1_000;
    config.upstream.check_interval_ms = 50;
    config.upstream.retry_interval_ms = 20;
    config.upstream.auto_err_retry = 10;
    config.routing.response_timeout_ms = 1_000;
    config.observability.metrics_enabled = false;
    config.targets = targets;
    config.messages = messages;
    config
}

/// Poll `check` until it holds or `WAIT` passes.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Wait until `service` has a connected backend on its ring.
pub async fn wait_routable(running: &cluster_gateway::RunningGateway, service: &str) -> bool {
    let Some(loader) = running.router().loaders().get(service) else {
        return false;
    };
    eventually(|| !loader.is_empty() && running.connected_backends() > 0).await
}
