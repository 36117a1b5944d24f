//! Robustness tests for the broker server.
//!
//! Malformed frames, missing descriptors, forged senders, abrupt
//! disconnects and connection churn must never take the broker down or
//! disturb other clients.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

use saftbus_core::{from_bytes, to_bytes, ClientId, ErrorKind, ObjectId, ProxyId};
use saftbus_protocol::{
    connect_private, signal_pipe, CallEnvelope, FramedSocket, Handshake, ObjectListing, Reply,
    Request, StateDump,
};
use saftbusd::broker::{spawn_broker, BrokerHandle, BrokerOptions};
use saftbusd::demo::{register_demo, COUNTER_INTERFACE, COUNTER_PATH};
use saftbusd::server::BusServer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);
const CLEANUP_WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    broker: BrokerHandle,
    counter_id: ObjectId,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("bus.sock");

        let broker = spawn_broker(BrokerOptions::default());
        let counter_id = register_demo(&broker).await.expect("register counter");
        let cancel_token = CancellationToken::new();

        let server = BusServer::new(socket_path.clone(), broker.clone(), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(socket_path.exists(), "Server socket did not appear");

        TestServer {
            socket_path,
            cancel_token,
            broker,
            counter_id,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> FramedSocket {
        let mut socket = FramedSocket::new(connect_private(&self.socket_path).await.unwrap());
        socket.send_value(&Request::hello()).await.unwrap();
        match socket.recv_value::<Handshake>().await.unwrap() {
            Handshake::Accepted { .. } => socket,
            other => panic!("Expected Accepted, got {other:?}"),
        }
    }

    async fn connect_with_id(&self) -> (FramedSocket, ClientId) {
        let mut socket = FramedSocket::new(connect_private(&self.socket_path).await.unwrap());
        socket.send_value(&Request::hello()).await.unwrap();
        match socket.recv_value::<Handshake>().await.unwrap() {
            Handshake::Accepted { client_id, .. } => (socket, client_id),
            other => panic!("Expected Accepted, got {other:?}"),
        }
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

async fn request<T: DeserializeOwned, R: Serialize>(socket: &mut FramedSocket, req: &R) -> T {
    socket.send_value(req).await.unwrap();
    timeout(Duration::from_secs(2), socket.recv_value())
        .await
        .expect("reply in time")
        .unwrap()
}

/// True once the server has closed the socket.
async fn closed_by_server(socket: &mut FramedSocket) -> bool {
    match timeout(Duration::from_secs(2), socket.read_frame()).await {
        Ok(Ok(None)) | Ok(Err(_)) => true,
        Ok(Ok(Some(_))) | Err(_) => false,
    }
}

async fn wait_for_state(broker: &BrokerHandle, check: impl Fn(&StateDump) -> bool) -> StateDump {
    let start = tokio::time::Instant::now();
    loop {
        let dump = broker.dump_state().await;
        if check(&dump) || start.elapsed() > CLEANUP_WAIT {
            return dump;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
}

fn counter_call(server: &TestServer, sender: ClientId, member: &str, args: Vec<u8>) -> Request {
    Request::Call(CallEnvelope {
        object_id: server.counter_id,
        path: COUNTER_PATH.to_string(),
        sender,
        interface: COUNTER_INTERFACE.to_string(),
        member: member.to_string(),
        args,
    })
}

async fn server_still_serves(server: &TestServer) {
    let mut socket = server.connect().await;
    let listing: ObjectListing = request(&mut socket, &Request::ListObjects).await;
    assert!(listing.contains_key(COUNTER_PATH));
}

// ============================================================================
// Malformed input
// ============================================================================

#[tokio::test]
async fn test_undecodable_request_closes_connection() {
    let server = TestServer::spawn().await;
    let mut socket = server.connect().await;

    // variant index far past the last request
    socket.write_frame(&[0xff, 0xff, 0x00, 0x00]).await.unwrap();
    assert!(closed_by_server(&mut socket).await);

    server_still_serves(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_request_releases_ownership() {
    let server = TestServer::spawn().await;
    let (mut owner, owner_id) = server.connect_with_id().await;
    let (mut other, other_id) = server.connect_with_id().await;

    let own = counter_call(&server, owner_id, "Own", Vec::new());
    let reply: Reply = request(&mut owner, &own).await;
    reply.into_result().unwrap();
    assert_eq!(server.broker.dump_state().await.subscriptions_of(owner_id), 1);

    owner.write_frame(&[0xff, 0xff, 0x00, 0x00]).await.unwrap();
    assert!(closed_by_server(&mut owner).await);

    let dump = wait_for_state(&server.broker, |d| d.client(owner_id).is_none()).await;
    assert!(dump.client(owner_id).is_none());
    assert_eq!(dump.subscriptions_of(owner_id), 0);

    let get_owner = counter_call(&server, other_id, "GetOwner", Vec::new());
    let reply: Reply = request(&mut other, &get_owner).await;
    let owner_now: Option<ClientId> = from_bytes(&reply.into_result().unwrap()).unwrap();
    assert_eq!(owner_now, None);

    let by = to_bytes(&1i32).unwrap();
    let reply: Reply = request(&mut other, &counter_call(&server, other_id, "Increment", by)).await;
    assert_eq!(from_bytes::<i32>(&reply.into_result().unwrap()).unwrap(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_header_closes_connection() {
    let server = TestServer::spawn().await;
    let stream = connect_private(&server.socket_path).await.unwrap();
    let mut socket = FramedSocket::new(stream);
    socket.send_value(&Request::hello()).await.unwrap();
    let _: Handshake = socket.recv_value().await.unwrap();

    let mut raw: UnixStream = socket.into_inner();
    raw.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

    let mut socket = FramedSocket::new(raw);
    assert!(closed_by_server(&mut socket).await);

    server_still_serves(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_rendezvous_without_descriptor() {
    let server = TestServer::spawn().await;

    let mut public = UnixStream::connect(&server.socket_path).await.unwrap();
    public.write_all(b"S").await.unwrap();
    drop(public);

    let public = UnixStream::connect(&server.socket_path).await.unwrap();
    drop(public);

    server_still_serves(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_call_with_truncated_arguments() {
    let server = TestServer::spawn().await;
    let (mut socket, client_id) = server.connect_with_id().await;

    let envelope = CallEnvelope {
        object_id: server.counter_id,
        path: COUNTER_PATH.to_string(),
        sender: client_id,
        interface: COUNTER_INTERFACE.to_string(),
        member: "Increment".to_string(),
        args: vec![1],
    };
    let reply: Reply = request(&mut socket, &Request::Call(envelope)).await;
    let err = reply.into_result().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failed);
    assert!(err.message.starts_with("protocol error:"));

    // connection keeps working
    let listing: ObjectListing = request(&mut socket, &Request::ListObjects).await;
    assert!(!listing.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_signal_channel_without_descriptor() {
    let server = TestServer::spawn().await;
    let mut socket = server.connect().await;

    let req = Request::open_signal_channel(COUNTER_PATH, COUNTER_INTERFACE, ProxyId::new(1));
    let reply: Reply = request(&mut socket, &req).await;
    assert_eq!(reply.into_result().unwrap_err().kind, ErrorKind::InvalidArgs);

    let listing: ObjectListing = request(&mut socket, &Request::ListObjects).await;
    assert!(!listing.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_signal_channel_with_invalid_path() {
    let server = TestServer::spawn().await;
    let mut socket = server.connect().await;

    let (_read_end, write_end) = signal_pipe().unwrap();
    let req = Request::open_signal_channel("no/leading/slash", COUNTER_INTERFACE, ProxyId::new(1));
    socket
        .write_frame_with_fd(&to_bytes(&req).unwrap(), write_end.as_fd())
        .await
        .unwrap();
    let reply: Reply = socket.recv_value().await.unwrap();
    assert_eq!(reply.into_result().unwrap_err().kind, ErrorKind::InvalidArgs);

    server.shutdown().await;
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_forged_sender_denied() {
    let server = TestServer::spawn().await;
    let (mut socket, client_id) = server.connect_with_id().await;

    let envelope = CallEnvelope {
        object_id: server.counter_id,
        path: COUNTER_PATH.to_string(),
        sender: ClientId::new(client_id.get() + 1000),
        interface: COUNTER_INTERFACE.to_string(),
        member: "Own".to_string(),
        args: Vec::new(),
    };
    let reply: Reply = request(&mut socket, &Request::Call(envelope)).await;
    assert_eq!(reply.into_result().unwrap_err().kind, ErrorKind::AccessDenied);

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_hello_is_an_error() {
    let server = TestServer::spawn().await;
    let mut socket = server.connect().await;

    let reply: Reply = request(&mut socket, &Request::hello()).await;
    assert_eq!(reply.into_result().unwrap_err().kind, ErrorKind::Failed);

    server.shutdown().await;
}

// ============================================================================
// Churn
// ============================================================================

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let server = TestServer::spawn().await;

    for _ in 0..20 {
        let socket = server.connect().await;
        drop(socket);
    }

    let dump = wait_for_state(&server.broker, |d| d.clients.is_empty()).await;
    assert!(dump.clients.is_empty());

    server_still_serves(&server).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_clients_increment() {
    let server = TestServer::spawn().await;
    let counter_id = server.counter_id;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let (mut socket, client_id) = server.connect_with_id().await;
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let envelope = CallEnvelope {
                    object_id: counter_id,
                    path: COUNTER_PATH.to_string(),
                    sender: client_id,
                    interface: COUNTER_INTERFACE.to_string(),
                    member: "Increment".to_string(),
                    args: to_bytes(&1i32).unwrap(),
                };
                let reply: Reply = request(&mut socket, &Request::Call(envelope)).await;
                reply.into_result().unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let (mut socket, client_id) = server.connect_with_id().await;
    let envelope = CallEnvelope::property_get(
        counter_id,
        COUNTER_PATH,
        client_id,
        COUNTER_INTERFACE,
        "value",
    )
    .unwrap();
    let reply: Reply = request(&mut socket, &Request::Call(envelope)).await;
    assert_eq!(from_bytes::<i32>(&reply.into_result().unwrap()).unwrap(), 100);

    server.shutdown().await;
}

#[tokio::test]
async fn test_closed_signal_reader_drops_channel_only() {
    let server = TestServer::spawn().await;
    let (mut socket, client_id) = server.connect_with_id().await;

    let mut readers = Vec::new();
    for proxy in 1..=2 {
        let (read_end, write_end) = signal_pipe().unwrap();
        let req =
            Request::open_signal_channel(COUNTER_PATH, COUNTER_INTERFACE, ProxyId::new(proxy));
        socket
            .write_frame_with_fd(&to_bytes(&req).unwrap(), write_end.as_fd())
            .await
            .unwrap();
        let reply: Reply = socket.recv_value().await.unwrap();
        reply.into_result().unwrap();
        readers.push(read_end);
    }

    // close the first proxy's reader; the broker notices the hang-up
    drop(readers.remove(0));

    let dump = wait_for_state(&server.broker, |d| {
        d.client(client_id)
            .is_some_and(|c| c.signal_channels.len() == 1)
    })
    .await;
    let channels = &dump.client(client_id).unwrap().signal_channels;
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].proxy_id, ProxyId::new(2));

    // control connection unaffected
    let listing: ObjectListing = request(&mut socket, &Request::ListObjects).await;
    assert!(!listing.is_empty());

    server.shutdown().await;
}
