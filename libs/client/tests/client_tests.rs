use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, BrokerConfig, BrokerHandle};
use courier_client::{Client, ClientConfig, ClientEvent, ClientState, Error, ErrorKind};
use courier_core::payload::{BroadcastAck, Registered};
use courier_core::{Envelope, ErrorCode, Kind};
use courier_fabric::codec::JsonCodec;
use courier_fabric::transport::{TcpTransportListener, UnixTransportListener};
use courier_fabric::{Channel, MemoryTransport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

fn spawn_broker() -> BrokerHandle {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    Broker::spawn(BrokerConfig::default().with_client_timeout(None))
}

fn quiet_config() -> ClientConfig {
    ClientConfig::default()
        .without_heartbeat()
        .with_request_timeout(Duration::from_secs(2))
}

async fn connect(broker: &BrokerHandle, name: &str) -> Client {
    let client = Client::new(quiet_config());
    client
        .connect(name, broker.open_port().unwrap())
        .await
        .unwrap();
    client
}

/// Wait for the first event matching `pred`
async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn get_clients_lists_everyone() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let _b = connect(&broker, "b").await;

    let list = a.get_clients().await.unwrap();
    assert_eq!(list.total, 2);
    assert!(list.contains("a"));
    assert!(list.contains("b"));
}

#[tokio::test]
async fn send_to_resolves_with_handler_reply() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("PING_APP", |_payload: Value, from: String| async move {
        assert_eq!(from, "a");
        Ok(json!({"ok": true}))
    });

    let reply = a.send_to("b", json!({"type": "PING_APP"})).await.unwrap();
    assert_eq!(reply, json!({"ok": true}));
}

#[tokio::test]
async fn send_to_self_runs_handler() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    a.on_message("NOTE", move |payload: Value, from: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(from, "a");
            assert_eq!(payload["text"], "remember");
            Ok(json!({"handled": true}))
        }
    });

    let reply = a
        .send_to("a", json!({"type": "NOTE", "text": "remember"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"handled": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn send_to_self_without_handler_is_rejected() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;

    match a.send_to("a", json!({"type": "NOTE"})).await {
        Err(Error::Remote { code, .. }) => assert_eq!(code, Some(ErrorCode::NoHandler)),
        other => panic!("Expected NO_HANDLER, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_target_rejects_with_not_found() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;

    match a.send_to("c", json!({"type": "HELLO"})).await {
        Err(Error::TargetNotFound(msg)) => assert!(msg.contains("not found")),
        other => panic!("Expected TargetNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_name_disconnects_previous_holder() {
    let broker = spawn_broker();
    let a = connect(&broker, "x").await;
    let mut events = a.subscribe();

    let d = connect(&broker, "x").await;
    assert!(d.is_connected());

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Disconnected {
            reason: "Duplicate connection".to_string()
        }
    );
    assert_eq!(a.state(), ClientState::Disconnected);
    assert!(matches!(a.ping().await, Err(Error::NotConnected)));

    // Fail-stop: no automatic re-registration
    let list = d.get_clients().await.unwrap();
    assert_eq!(list.names().collect::<Vec<_>>(), vec!["x"]);
}

#[tokio::test]
async fn broadcast_reports_dead_ports() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    b.on_message("NEWS", move |_payload: Value, _from: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    // c registers, then its read half goes away
    let (c_rx, _c_tx) = {
        let mut c = Channel::from_transport(broker.open_port().unwrap(), JsonCodec);
        c.send(&Envelope::register("c")).await.unwrap();
        let registered: Envelope = c.receive().await.unwrap();
        assert_eq!(registered.kind, Some(Kind::Registered));
        c.into_split()
    };
    drop(c_rx);

    let ack = a.broadcast(json!({"type": "NEWS", "msg": "hi"})).await.unwrap();
    assert_eq!(ack, BroadcastAck { delivered: 1, failed: 1 });

    let list = a.get_clients().await.unwrap();
    assert!(!list.contains("c"));
    assert_eq!(list.total, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ping_reports_latency() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;

    let pong = a.ping().await.unwrap();
    assert!(pong.latency >= Duration::ZERO);
    assert!(pong.timestamp.is_some());
}

#[tokio::test]
async fn operations_before_connect_fail() {
    let client = Client::default();
    assert_eq!(client.state(), ClientState::Idle);
    assert!(client.name().is_none());
    assert!(matches!(client.ping().await, Err(Error::NotConnected)));
    assert!(matches!(
        client.send_to("b", json!({})).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        client.post("b", json!({})).await,
        Err(Error::NotConnected)
    ));

    // Disconnecting an idle client is a no-op
    client.disconnect().await;
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn empty_name_is_rejected_locally() {
    let broker = spawn_broker();
    let client = Client::default();
    assert!(matches!(
        client.connect(" ", broker.open_port().unwrap()).await,
        Err(Error::InvalidClientName)
    ));
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn connect_twice_is_refused() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    assert!(matches!(
        a.connect("a2", broker.open_port().unwrap()).await,
        Err(Error::AlreadyConnected)
    ));
    assert_eq!(a.name().as_deref(), Some("a"));
}

#[tokio::test]
async fn concurrent_requests_keep_their_replies() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("ECHO", |payload: Value, _from: String| async move {
        let n = payload["n"].as_u64().unwrap_or(0);
        // Later requests answer first
        tokio::time::sleep(Duration::from_millis(50 - n * 5)).await;
        Ok(json!({"n": n}))
    });

    let calls = (0..8u64).map(|n| {
        let a = a.clone();
        async move { (n, a.send_to("b", json!({"type": "ECHO", "n": n})).await) }
    });
    for (n, reply) in futures_join_all(calls).await {
        assert_eq!(reply.unwrap(), json!({"n": n}));
    }
}

/// Minimal join_all over tokio tasks
async fn futures_join_all<F, T>(futures: impl Iterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}

#[tokio::test]
async fn timed_out_request_ignores_late_reply() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("SLOW", |_payload: Value, _from: String| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("late"))
    });
    b.on_message("FAST", |_payload: Value, _from: String| async move { Ok(json!("fast")) });

    let result = a
        .send_to_with_timeout("b", json!({"type": "SLOW"}), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));

    // Let the late reply arrive; it must not settle anything else
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        a.send_to("b", json!({"type": "FAST"})).await.unwrap(),
        json!("fast")
    );
    assert!(a.is_connected());
}

#[tokio::test]
async fn handler_errors_are_returned_to_the_sender() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("FETCH", |_payload: Value, _from: String| async move {
        Err(anyhow::anyhow!("feed unreachable"))
    });

    match a.send_to("b", json!({"type": "FETCH"})).await {
        Err(Error::Remote { code, message }) => {
            assert_eq!(code, Some(ErrorCode::HandlerFailed));
            assert!(message.contains("feed unreachable"));
        }
        other => panic!("Expected Remote, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_message_type_gets_no_handler() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("KNOWN", |_payload: Value, _from: String| async move { Ok(Value::Null) });
    assert!(b.off_message("KNOWN"));
    assert!(!b.off_message("KNOWN"));

    match a.send_to("b", json!({"type": "KNOWN"})).await {
        Err(Error::Remote { code, .. }) => assert_eq!(code, Some(ErrorCode::NoHandler)),
        other => panic!("Expected NO_HANDLER, got {:?}", other),
    }
    // b survives
    assert!(b.ping().await.is_ok());
}

#[derive(Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Sum {
    sum: i64,
}

#[tokio::test]
async fn typed_handlers_and_requests() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let calc = connect(&broker, "calc").await;
    calc.on_typed("ADD", |req: Add, _from: String| async move {
        Ok(Sum { sum: req.a + req.b })
    });

    let reply: Sum = a
        .request("calc", &json!({"type": "ADD", "a": 2, "b": 3}))
        .await
        .unwrap();
    assert_eq!(reply, Sum { sum: 5 });
}

#[tokio::test]
async fn post_runs_handler_without_reply() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.on_message("LOG", move |payload: Value, from: String| {
        let tx = tx.clone();
        async move {
            tx.send((from, payload["line"].clone())).ok();
            Ok(Value::Null)
        }
    });

    a.post("b", json!({"type": "LOG", "line": "started"})).await.unwrap();
    let (from, line) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, "a");
    assert_eq!(line, json!("started"));
}

#[tokio::test]
async fn membership_events_are_published() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let mut events = a.subscribe();

    let b = connect(&broker, "b").await;
    let joined = next_event(&mut events, |e| matches!(e, ClientEvent::ClientJoined { .. })).await;
    assert_eq!(
        joined,
        ClientEvent::ClientJoined {
            name: "b".to_string(),
            total_clients: 2
        }
    );

    b.disconnect().await;
    let left = next_event(&mut events, |e| matches!(e, ClientEvent::ClientLeft { .. })).await;
    assert_eq!(
        left,
        ClientEvent::ClientLeft {
            name: "b".to_string(),
            total_clients: 1
        }
    );
}

#[tokio::test]
async fn disconnect_is_idempotent_and_allows_reconnect() {
    let broker = spawn_broker();
    let a = Client::new(quiet_config());
    let mut events = a.subscribe();
    a.connect("a", broker.open_port().unwrap()).await.unwrap();
    assert!(matches!(
        next_event(&mut events, |_| true).await,
        ClientEvent::Connected { .. }
    ));

    a.disconnect().await;
    a.disconnect().await;
    assert_eq!(a.state(), ClientState::Disconnected);
    assert_eq!(
        next_event(&mut events, |_| true).await,
        ClientEvent::Disconnected {
            reason: "Client disconnected".to_string()
        }
    );
    assert!(matches!(a.get_stats().await, Err(Error::NotConnected)));

    a.connect("a", broker.open_port().unwrap()).await.unwrap();
    assert!(a.is_connected());
    assert!(broker.clients().await.unwrap().contains("a"));
}

#[tokio::test]
async fn broker_shutdown_rejects_pending_requests() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("NEVER", |_payload: Value, _from: String| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    });
    let mut events = a.subscribe();

    let pending = {
        let a = a.clone();
        tokio::spawn(async move {
            a.send_to_with_timeout("b", json!({"type": "NEVER"}), Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Disconnected(_))));

    let failed = next_event(&mut events, |e| matches!(e, ClientEvent::Error { .. })).await;
    assert!(matches!(
        failed,
        ClientEvent::Error {
            kind: ErrorKind::ChannelFailed,
            ..
        }
    ));
    assert_eq!(a.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn stats_only_grow() {
    let broker = spawn_broker();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    b.on_message("NOP", |_payload: Value, _from: String| async move { Ok(Value::Null) });

    let mut events = a.subscribe();

    let before = a.get_stats().await.unwrap();
    a.send_to("b", json!({"type": "NOP"})).await.unwrap();
    b.disconnect().await;
    next_event(&mut events, |e| matches!(e, ClientEvent::ClientLeft { .. })).await;
    let after = a.get_stats().await.unwrap();

    assert!(after.total_messages > before.total_messages);
    assert!(after.total_clients >= before.total_clients);
    assert_eq!(after.current_clients, 1);
}

/// Answers REGISTER, then goes silent
async fn mute_broker(port: MemoryTransport) -> Channel<JsonCodec> {
    let mut channel = Channel::from_transport(port, JsonCodec);
    let register: Envelope = channel.receive().await.unwrap();
    assert_eq!(register.kind, Some(Kind::Register));
    let name = register.name.clone().unwrap();
    let reply = Envelope::system(
        Kind::Registered,
        &Registered {
            name: name.clone(),
            clients: vec![name],
        },
    )
    .unwrap()
    .with_request_id(register.request_id);
    channel.send(&reply).await.unwrap();
    channel
}

#[tokio::test]
async fn heartbeat_failure_is_reported_without_disconnect() {
    let (client_end, broker_end) = MemoryTransport::pair();
    let fake = tokio::spawn(mute_broker(broker_end));

    let client = Client::new(
        ClientConfig::default()
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(50)),
    );
    let mut events = client.subscribe();
    client.connect("lonely", client_end).await.unwrap();
    let _fake = fake.await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Error { .. })).await;
    assert!(matches!(
        event,
        ClientEvent::Error {
            kind: ErrorKind::HeartbeatFailed,
            ..
        }
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn registration_times_out_without_reply() {
    let (client_end, _broker_end) = MemoryTransport::pair();
    let client = Client::new(
        quiet_config().with_registration_timeout(Duration::from_millis(100)),
    );

    match client.connect("early", client_end).await {
        Err(Error::RegistrationTimeout(after)) => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("Expected RegistrationTimeout, got {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn connects_over_tcp_and_unix_sockets() {
    let broker = spawn_broker();
    let tcp = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = tcp.local_addr().unwrap();
    broker.serve(tcp);

    let path = std::env::temp_dir().join(format!("courier-client-{}.sock", std::process::id()));
    broker.serve(UnixTransportListener::bind(&path).await.unwrap());

    let config = quiet_config()
        .with_connect_timeout(Some(Duration::from_secs(2)))
        .with_write_timeout(Some(Duration::from_secs(2)));

    let remote = Client::new(config.clone());
    remote.connect_tcp("remote", addr).await.unwrap();
    let local = Client::new(config);
    local.connect_unix("local", &path).await.unwrap();

    local.on_message("WHO", |_payload: Value, from: String| async move {
        Ok(json!({"asked_by": from}))
    });
    let reply = remote.send_to("local", json!({"type": "WHO"})).await.unwrap();
    assert_eq!(reply, json!({"asked_by": "remote"}));
}

#[tokio::test]
async fn unreachable_socket_leaves_client_disconnected() {
    let path = std::env::temp_dir().join(format!("courier-absent-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let client = Client::new(quiet_config().with_connect_timeout(Some(Duration::from_secs(1))));
    assert!(matches!(
        client.connect_unix("lonely", &path).await,
        Err(Error::Transport(_))
    ));
    assert_eq!(client.state(), ClientState::Disconnected);
}
