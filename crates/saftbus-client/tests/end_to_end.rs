//! End-to-end tests: a real broker and server, driven through `Connection`,
//! `Proxy` and `SignalGroup`.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use saftbus_client::{
    ClientConfig, ClientError, ClientId, Connection, DispatchMode, ErrorKind, ObjectId, Proxy,
    SignalGroup, SignalMessage, StateDump, WaitOutcome,
};
use saftbus_core::{from_bytes, to_bytes, BusError, Reader};
use saftbusd::broker::{spawn_broker, BrokerHandle, BrokerOptions};
use saftbusd::demo::{register_demo, COUNTER_INTERFACE, COUNTER_PATH};
use saftbusd::server::BusServer;
use saftbusd::service::{CallContext, ServiceObject};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SIGNAL_WAIT: Duration = Duration::from_secs(2);
const CLEANUP_WAIT: Duration = Duration::from_secs(2);

const ECHO_PATH: &str = "/test/echo";
const ECHO_INTERFACE: &str = "test.Echo";

// ============================================================================
// Test Helpers
// ============================================================================

/// Returns its string argument unchanged.
struct Echo;

impl ServiceObject for Echo {
    fn introspect(&self) -> String {
        format!("<interface name=\"{ECHO_INTERFACE}\"/>")
    }

    fn call(
        &mut self,
        method: &str,
        args: &mut Reader<'_>,
        _ctx: &mut CallContext,
    ) -> Result<Vec<u8>, BusError> {
        match method {
            "Echo" => {
                let tag: String = args.get()?;
                Ok(to_bytes(&tag)?)
            }
            other => Err(BusError::invalid_args(format!("unknown method '{other}'"))),
        }
    }
}

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    broker: BrokerHandle,
    counter_id: ObjectId,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(BrokerOptions::default()).await
    }

    async fn spawn_with(options: BrokerOptions) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("bus.sock");

        let broker = spawn_broker(options);
        let counter_id = register_demo(&broker).await.expect("register counter");
        broker
            .register_object(ECHO_INTERFACE, ECHO_PATH, Echo)
            .await
            .expect("register echo");

        let cancel_token = CancellationToken::new();
        let server = BusServer::new(socket_path.clone(), broker.clone(), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(socket_path.exists(), "server socket did not appear");

        TestServer {
            socket_path,
            cancel_token,
            broker,
            counter_id,
            _temp_dir: temp_dir,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            socket_path: self.socket_path.clone(),
            call_timeout: Some(Duration::from_secs(5)),
        }
    }

    async fn connect(&self) -> Connection {
        Connection::connect(&self.config()).await.expect("connect")
    }

    async fn wait_for_state(&self, check: impl Fn(&StateDump) -> bool) -> StateDump {
        let start = tokio::time::Instant::now();
        loop {
            let dump = self.broker.dump_state().await;
            if check(&dump) || start.elapsed() > CLEANUP_WAIT {
                return dump;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Collects the decoded `Changed` values a proxy receives.
fn record_changes(proxy: &Proxy) -> Arc<Mutex<Vec<i32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    proxy.connect_signal("Changed", move |signal: &SignalMessage| {
        sink.lock().unwrap().push(from_bytes::<i32>(&signal.args).unwrap());
    });
    seen
}

async fn increment(proxy: &Proxy, by: i32) -> Result<i32, ClientError> {
    proxy.call_value("Increment", &by).await
}

// ============================================================================
// Calls and properties
// ============================================================================

#[tokio::test]
async fn test_counter_scenario_across_two_clients() {
    let server = TestServer::spawn().await;

    let conn_a = server.connect().await;
    let counter_a = Proxy::without_signals(&conn_a, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    assert_eq!(counter_a.object_id(), server.counter_id);

    assert_eq!(increment(&counter_a, 5).await.unwrap(), 5);
    assert_eq!(increment(&counter_a, 3).await.unwrap(), 8);
    assert_eq!(counter_a.get_property::<i32>("value").await.unwrap(), 8);

    let conn_b = server.connect().await;
    assert_ne!(conn_a.client_id(), conn_b.client_id());
    let id = conn_b.lookup(COUNTER_PATH, COUNTER_INTERFACE).await.unwrap();
    assert_eq!(id, counter_a.object_id());

    let counter_b = Proxy::without_signals(&conn_b, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    assert_eq!(counter_b.get_property::<i32>("value").await.unwrap(), 8);
}

#[tokio::test]
async fn test_read_only_property_rejects_set() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let counter = Proxy::without_signals(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();

    let err = counter.set_property("value", &1i32).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert!(!conn.is_poisoned());
}

#[tokio::test]
async fn test_unknown_object_is_no_such_object() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;

    let err = Proxy::new(&conn, "/demo/missing", COUNTER_INTERFACE)
        .await
        .unwrap_err();
    assert!(err.is_no_such_object());
    assert!(!err.is_stale_object());
}

#[tokio::test]
async fn test_replaced_object_is_stale() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let old = Proxy::without_signals(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();

    server.broker.unregister_object(server.counter_id).await.unwrap();
    let new_id = register_demo(&server.broker).await.unwrap();
    assert_ne!(new_id, server.counter_id);

    let err = increment(&old, 1).await.unwrap_err();
    assert!(err.is_stale_object());
    assert!(!err.is_no_such_object());
    assert_eq!(err.kind(), ErrorKind::Failed);

    let fresh = Proxy::without_signals(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    assert_eq!(fresh.object_id(), new_id);
    assert_eq!(increment(&fresh, 1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_introspect_through_proxy() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let counter = Proxy::without_signals(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();

    let doc = counter.introspect().await.unwrap();
    assert!(doc.contains("Increment"));

    let listing = conn.list_objects().await.unwrap();
    assert!(listing[COUNTER_PATH].contains(COUNTER_INTERFACE));
    assert!(listing[ECHO_PATH].contains(ECHO_INTERFACE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_cross_talk() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let echo = Arc::new(
        Proxy::without_signals(&conn, ECHO_PATH, ECHO_INTERFACE)
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for worker in 0..8u32 {
        let echo = Arc::clone(&echo);
        tasks.push(tokio::spawn(async move {
            for n in 0..50u32 {
                let tag = format!("worker-{worker}-call-{n}");
                let reply: String = echo.call_value("Echo", &tag).await.unwrap();
                assert_eq!(reply, tag);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(!conn.is_poisoned());
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn test_signal_reaches_handler() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let counter = Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    let seen = record_changes(&counter);

    increment(&counter, 4).await.unwrap();
    let signal = timeout(SIGNAL_WAIT, counter.dispatch())
        .await
        .expect("signal in time")
        .unwrap();

    assert_eq!(signal.name, "Changed");
    assert_eq!(*seen.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_closed_proxy_does_not_affect_other_channel() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let kept = Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    let dropped = Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    let client_id = conn.client_id();

    let dump = server.broker.dump_state().await;
    assert_eq!(dump.client(client_id).unwrap().signal_channels.len(), 2);

    drop(dropped);
    let dump = server
        .wait_for_state(|d| d.client(client_id).is_some_and(|c| c.signal_channels.len() == 1))
        .await;
    assert_eq!(dump.client(client_id).unwrap().signal_channels.len(), 1);

    let seen = record_changes(&kept);
    increment(&kept, 2).await.unwrap();
    timeout(SIGNAL_WAIT, kept.dispatch())
        .await
        .expect("signal in time")
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn test_flight_time_is_reported() {
    let server = TestServer::spawn_with(BrokerOptions {
        track_flight_time: true,
        ..BrokerOptions::default()
    })
    .await;
    let conn = server.connect().await;
    let counter = Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();

    increment(&counter, 1).await.unwrap();
    let signal = timeout(SIGNAL_WAIT, counter.dispatch()).await.unwrap().unwrap();
    assert!(signal.track_flight_time);

    let start = tokio::time::Instant::now();
    loop {
        let histogram = conn.flight_time_histogram().await.unwrap();
        if histogram.total() == 1 {
            break;
        }
        assert!(start.elapsed() < CLEANUP_WAIT, "flight time never recorded");
        sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Signal groups
// ============================================================================

#[tokio::test]
async fn test_group_times_out_without_signals() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();
    group
        .add(
            Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap()),
            DispatchMode::Auto,
        )
        .unwrap();

    let outcome = group.wait(Some(Duration::from_millis(50))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Timeout);
}

#[tokio::test]
async fn test_group_dispatches_auto_members() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();

    let first = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    let second = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    let seen_first = record_changes(&first);
    let seen_second = record_changes(&second);
    group.add(Arc::clone(&first), DispatchMode::Auto).unwrap();
    group.add(Arc::clone(&second), DispatchMode::Auto).unwrap();

    increment(&first, 7).await.unwrap();

    let mut dispatched_total = 0;
    while dispatched_total < 2 {
        match group.wait(Some(SIGNAL_WAIT)).await.unwrap() {
            WaitOutcome::Ready { dispatched, manual } => {
                assert!(manual.is_empty());
                dispatched_total += dispatched;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(*seen_first.lock().unwrap(), vec![7]);
    assert_eq!(*seen_second.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn test_group_reports_manual_members() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();

    let proxy = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    let seen = record_changes(&proxy);
    group.add(Arc::clone(&proxy), DispatchMode::Manual).unwrap();

    increment(&proxy, 9).await.unwrap();
    let outcome = group.wait(Some(SIGNAL_WAIT)).await.unwrap();
    assert_eq!(
        outcome,
        WaitOutcome::Ready {
            dispatched: 0,
            manual: vec![proxy.proxy_id()],
        }
    );
    assert!(seen.lock().unwrap().is_empty());

    proxy.dispatch().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![9]);
}

#[tokio::test]
async fn test_group_wait_after_auto_dispatch_honors_timeout() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();

    let proxy = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    let seen = record_changes(&proxy);
    group.add(Arc::clone(&proxy), DispatchMode::Auto).unwrap();

    increment(&proxy, 2).await.unwrap();
    let outcome = group.wait(Some(SIGNAL_WAIT)).await.unwrap();
    assert!(matches!(outcome, WaitOutcome::Ready { dispatched: 1, .. }));
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    // the pipe is drained; the next wait must come back on its own timeout
    let outcome = timeout(SIGNAL_WAIT, group.wait(Some(Duration::from_millis(200))))
        .await
        .expect("wait outlived its timeout")
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Timeout);

    increment(&proxy, 3).await.unwrap();
    let outcome = group.wait(Some(SIGNAL_WAIT)).await.unwrap();
    assert!(matches!(outcome, WaitOutcome::Ready { dispatched: 1, .. }));
    assert_eq!(*seen.lock().unwrap(), vec![2, 5]);
}

#[tokio::test]
async fn test_group_wait_after_manual_dispatch_honors_timeout() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();

    let proxy = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    group.add(Arc::clone(&proxy), DispatchMode::Manual).unwrap();

    increment(&proxy, 4).await.unwrap();
    let outcome = group.wait(Some(SIGNAL_WAIT)).await.unwrap();
    assert!(matches!(outcome, WaitOutcome::Ready { dispatched: 0, .. }));
    assert!(proxy.has_pending_signal());
    proxy.dispatch().await.unwrap();
    assert!(!proxy.has_pending_signal());

    let outcome = timeout(SIGNAL_WAIT, group.wait(Some(Duration::from_millis(200))))
        .await
        .expect("wait outlived its timeout")
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Timeout);
}

#[tokio::test]
async fn test_try_dispatch_never_waits() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let proxy = Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap();
    let seen = record_changes(&proxy);

    assert!(proxy.try_dispatch().await.unwrap().is_none());

    increment(&proxy, 6).await.unwrap();
    timeout(SIGNAL_WAIT, proxy.wait_readable())
        .await
        .unwrap()
        .unwrap();
    let signal = proxy.try_dispatch().await.unwrap().unwrap();
    assert_eq!(signal.name, "Changed");
    assert_eq!(*seen.lock().unwrap(), vec![6]);
    assert!(proxy.try_dispatch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_group_picks_up_member_added_while_waiting() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = Arc::new(SignalGroup::new());

    let waiter = {
        let group = Arc::clone(&group);
        tokio::spawn(async move { group.wait(Some(Duration::from_secs(5))).await })
    };
    sleep(Duration::from_millis(50)).await;

    let proxy = Arc::new(Proxy::new(&conn, COUNTER_PATH, COUNTER_INTERFACE).await.unwrap());
    group.add(Arc::clone(&proxy), DispatchMode::Auto).unwrap();
    increment(&proxy, 1).await.unwrap();

    let outcome = timeout(SIGNAL_WAIT, waiter).await.unwrap().unwrap().unwrap();
    assert!(matches!(outcome, WaitOutcome::Ready { dispatched: 1, .. }));
}

#[tokio::test]
async fn test_group_rejects_proxy_without_channel() {
    let server = TestServer::spawn().await;
    let conn = server.connect().await;
    let group = SignalGroup::new();
    let proxy = Arc::new(
        Proxy::without_signals(&conn, COUNTER_PATH, COUNTER_INTERFACE)
            .await
            .unwrap(),
    );

    assert!(matches!(
        group.add(proxy, DispatchMode::Auto),
        Err(ClientError::NoSignalChannel)
    ));
    assert!(group.is_empty());
}

// ============================================================================
// Disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_releases_ownership_and_channels() {
    let server = TestServer::spawn().await;

    let conn_a = server.connect().await;
    let counter_a = Proxy::without_signals(&conn_a, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();

    let conn_b = server.connect().await;
    let b_id = conn_b.client_id();
    let counter_b = Proxy::new(&conn_b, COUNTER_PATH, COUNTER_INTERFACE)
        .await
        .unwrap();
    counter_b.call_value::<_, ()>("Own", &()).await.unwrap();

    let err = increment(&counter_a, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let dump = server.broker.dump_state().await;
    assert_eq!(dump.subscriptions_of(b_id), 1);
    assert_eq!(dump.client(b_id).unwrap().signal_channels.len(), 1);

    drop(counter_b);
    drop(conn_b);
    let dump = server
        .wait_for_state(|d| d.client(b_id).is_none() && d.subscriptions_of(b_id) == 0)
        .await;
    assert!(dump.client(b_id).is_none());
    assert_eq!(dump.subscriptions_of(b_id), 0);

    let owner: Option<ClientId> = counter_a.call_value("GetOwner", &()).await.unwrap();
    assert_eq!(owner, None);
    assert_eq!(increment(&counter_a, 1).await.unwrap(), 1);
}
