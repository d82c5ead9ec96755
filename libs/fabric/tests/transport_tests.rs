use std::path::PathBuf;
use std::time::Duration;

use courier_fabric::codec::JsonCodec;
use courier_fabric::transport::{
    TcpTransport, TcpTransportListener, UnixTransport, UnixTransportListener,
};
use courier_fabric::{Channel, Error, Transport, TransportListener};
use serde_json::{json, Value};

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("courier-fabric-{}-{}.sock", std::process::id(), tag))
}

async fn tcp_listener() -> (TcpTransportListener, std::net::SocketAddr) {
    let listener = TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn tcp_port_carries_envelopes_both_ways() {
    let (listener, addr) = tcp_listener().await;

    // Broker side: answer every ping with a pong carrying the same id
    tokio::spawn(async move {
        let transport = listener.accept().await.unwrap();
        let (mut rx, mut tx) = Channel::from_transport(transport, JsonCodec).into_split();
        while let Ok(ping) = rx.receive::<Value>().await {
            let pong = json!({"kind": "PONG", "requestId": ping["requestId"]});
            tx.send(&pong).await.unwrap();
        }
    });

    let transport = TcpTransport::builder(addr)
        .connect_timeout(Duration::from_secs(2))
        .send_timeout(Duration::from_secs(2))
        .connect()
        .await
        .unwrap();
    let mut channel = Channel::from_transport(transport, JsonCodec);

    for seq in 1..=3 {
        let id = format!("popup-{}", seq);
        channel
            .send(&json!({"kind": "PING", "requestId": id}))
            .await
            .unwrap();
        let pong: Value = channel.receive().await.unwrap();
        assert_eq!(pong, json!({"kind": "PONG", "requestId": id}));
    }
}

#[tokio::test]
async fn split_halves_run_on_separate_tasks() {
    let (listener, addr) = tcp_listener().await;

    let reader = tokio::spawn(async move {
        let transport = listener.accept().await.unwrap();
        let (mut rx, _tx) = Channel::from_transport(transport, JsonCodec).into_split();
        let mut seen = Vec::new();
        for _ in 0..50 {
            let envelope: Value = rx.receive().await.unwrap();
            seen.push(envelope["data"]["n"].as_u64().unwrap());
        }
        seen
    });

    let transport = TcpTransport::connect(addr).await.unwrap();
    let (_rx, mut tx) = Channel::from_transport(transport, JsonCodec).into_split();
    let writer = tokio::spawn(async move {
        for n in 0..50u64 {
            tx.send(&json!({"to": "background", "data": {"n": n}}))
                .await
                .unwrap();
        }
        tx
    });

    let _tx = writer.await.unwrap();
    assert_eq!(reader.await.unwrap(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn peer_shutdown_is_a_disconnect() {
    let (listener, addr) = tcp_listener().await;

    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        transport.close().await.unwrap();
        // Hold the socket open until the client has seen EOF
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let mut client = TcpTransport::connect(addr).await.unwrap();
    let err = client.receive().await.unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {}", err);
}

#[tokio::test]
async fn undecodable_frame_leaves_the_port_usable() {
    let (listener, addr) = tcp_listener().await;

    tokio::spawn(async move {
        let mut transport = listener.accept().await.unwrap();
        transport.send(b"{\"kind\": ").await.unwrap();
        transport.send(br#"{"kind":"PONG"}"#).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let transport = TcpTransport::connect(addr).await.unwrap();
    let (mut rx, _tx) = Channel::from_transport(transport, JsonCodec).into_split();

    let bytes = rx.receive_bytes().await.unwrap();
    assert!(matches!(rx.decode::<Value>(&bytes), Err(Error::Codec(_))));

    let next: Value = rx.receive().await.unwrap();
    assert_eq!(next, json!({"kind": "PONG"}));
}

#[tokio::test]
async fn unix_listener_replaces_stale_socket_and_cleans_up() {
    let path = socket_path("stale");
    std::fs::write(&path, b"left over").unwrap();

    let listener = UnixTransportListener::bind(&path).await.unwrap();
    let server = tokio::spawn(async move {
        let transport = listener.accept().await.unwrap();
        let mut channel = Channel::from_transport(transport, JsonCodec);
        let register: Value = channel.receive().await.unwrap();
        channel
            .send(&json!({"kind": "REGISTERED", "data": {"name": register["name"]}}))
            .await
            .unwrap();
        // Dropping the listener here removes the socket file
    });

    let transport = UnixTransport::builder(&path)
        .connect_timeout(Duration::from_secs(2))
        .connect()
        .await
        .unwrap();
    let mut channel = Channel::from_transport(transport, JsonCodec);
    channel
        .send(&json!({"kind": "REGISTER", "name": "sidebar"}))
        .await
        .unwrap();
    let registered: Value = channel.receive().await.unwrap();
    assert_eq!(registered["data"]["name"], "sidebar");

    server.await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn dialing_a_missing_socket_fails() {
    let path = socket_path("missing");
    let _ = std::fs::remove_file(&path);

    let err = match UnixTransport::builder(&path)
        .connect_timeout(Duration::from_secs(1))
        .connect()
        .await
    {
        Ok(_) => panic!("connected to a socket that does not exist"),
        Err(e) => e,
    };
    assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
}

#[tokio::test]
async fn send_timeout_bounds_writes_to_a_stalled_peer() {
    let path = socket_path("stalled");
    let listener = UnixTransportListener::bind(&path).await.unwrap();

    let transport = UnixTransport::builder(&path)
        .send_timeout(Duration::from_millis(50))
        .connect()
        .await
        .unwrap();
    // Accepted but never read from
    let _stalled = listener.accept().await.unwrap();

    let (_rx, mut tx) = Channel::from_transport(transport, JsonCodec).into_split();
    let bulky = json!({"to": "offscreen", "data": "x".repeat(1024 * 1024)});

    let mut outcome = Ok(());
    for _ in 0..64 {
        outcome = tx.send(&bulky).await;
        if outcome.is_err() {
            break;
        }
    }
    assert!(matches!(outcome, Err(Error::Timeout("Send"))));
}
