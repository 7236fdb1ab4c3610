
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    eventually, exchange, relay_config, RelayFixture, ScriptedBackend, TcpEchoBackend, REPLY,
    REQUEST,
};
use tcprelay::{AcceptMode, ConnectOn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn request_reaches_backend_and_reply_reaches_client() {
    let backend = ScriptedBackend::spawn(REPLY).await.unwrap();
    let relay = RelayFixture::spawn(relay_config(vec![backend.addr])).unwrap();

    let reply = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("relay exchange timed out")
        .unwrap();

    assert_eq!(reply, REPLY);
    assert_eq!(backend.requests(), vec![REQUEST.to_vec()]);

    let stats = relay.stats.clone();
    assert!(
        eventually(|| stats.sessions_freed.load(Ordering::Relaxed) == 1).await,
        "session never freed"
    );
    let snap = stats.snapshot();
    assert_eq!(snap.connections_accepted, 1);
    assert_eq!(snap.client_bytes_received, 9);
    assert_eq!(snap.backend_bytes_sent, 9);
    assert_eq!(snap.backend_bytes_received, 19);
    assert_eq!(snap.client_bytes_sent, 19);
    assert_eq!(snap.sessions_live, 0);
    assert_eq!(snap.blocked_directions, 0);
}

#[tokio::test]
async fn eager_connect_relays_the_same_exchange() {
    let backend = ScriptedBackend::spawn(REPLY).await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.connect_on = ConnectOn::Accept;
    let relay = RelayFixture::spawn(config).unwrap();

    let reply = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("relay exchange timed out")
        .unwrap();
    assert_eq!(reply, REPLY);
}

#[tokio::test]
async fn backends_are_selected_round_robin() {
    let first = ScriptedBackend::spawn(b"A").await.unwrap();
    let second = ScriptedBackend::spawn(b"B").await.unwrap();
    let relay = RelayFixture::spawn(relay_config(vec![first.addr, second.addr])).unwrap();

    let mut markers = Vec::new();
    for _ in 0..4 {
        let reply = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
            .await
            .expect("relay exchange timed out")
            .unwrap();
        markers.push(String::from_utf8(reply).unwrap());
    }

    assert_eq!(markers, vec!["A", "B", "A", "B"]);
    assert_eq!(first.connection_count(), 2);
    assert_eq!(second.connection_count(), 2);
}

#[tokio::test]
async fn client_half_close_still_gets_reply() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayFixture::spawn(relay_config(vec![backend.addr])).unwrap();

    let result = timeout(Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(relay.listen_addr).await?;
        stream.write_all(b"ping over a half-closed stream").await?;
        stream.shutdown().await?;
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await?;
        Ok::<_, std::io::Error>(echoed)
    })
    .await
    .expect("half-close exchange timed out")
    .unwrap();

    assert_eq!(result, b"ping over a half-closed stream");
}

#[tokio::test]
async fn large_payload_survives_small_buffers() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.packet_size = 512;
    config.cache_capacity = 4;
    config.max_pending_bytes = 2048;
    let relay = RelayFixture::spawn(config).unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    let stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let outgoing = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&outgoing).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::with_capacity(payload.len());
    timeout(Duration::from_secs(20), reader.read_to_end(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    writer_task.await.unwrap();

    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "echoed bytes differ from payload");
    assert_eq!(backend.bytes_received.load(Ordering::Relaxed), 1_000_000);
}

#[tokio::test]
async fn dispatch_mode_spreads_sessions_over_workers() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.accept_mode = AcceptMode::Dispatch;
    config.workers = 2;
    let relay = RelayFixture::spawn(config).unwrap();

    for i in 0..4u8 {
        let payload = vec![b'a' + i; 32];
        let echoed = timeout(Duration::from_secs(5), async {
            let mut stream = TcpStream::connect(relay.listen_addr).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await?;
            let mut echoed = Vec::new();
            stream.read_to_end(&mut echoed).await?;
            Ok::<_, std::io::Error>(echoed)
        })
        .await
        .expect("dispatch exchange timed out")
        .unwrap();
        assert_eq!(echoed, payload);
    }

    assert_eq!(backend.connection_count(), 4);
    assert_eq!(relay.stats.snapshot().connections_accepted, 4);
}

/// Open every client before any of them is accepted, then relay them all.
async fn relay_queued_clients(relay: &RelayFixture, clients: usize) {
    let mut streams = Vec::with_capacity(clients);
    for _ in 0..clients {
        streams.push(TcpStream::connect(relay.listen_addr).await.unwrap());
    }

    let mut tasks = Vec::with_capacity(clients);
    for mut stream in streams {
        tasks.push(tokio::spawn(async move {
            stream.write_all(REQUEST).await?;
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        }));
    }
    for task in tasks {
        let reply = timeout(Duration::from_secs(5), task)
            .await
            .expect("queued client never relayed")
            .unwrap()
            .unwrap();
        assert_eq!(reply, REPLY);
    }
}

#[tokio::test]
async fn queued_clients_drain_one_accept_per_turn() {
    let backend = ScriptedBackend::spawn(REPLY).await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.accept_batch = 1;
    let relay = RelayFixture::spawn(config).unwrap();

    relay_queued_clients(&relay, 8).await;

    assert_eq!(backend.connection_count(), 8);
    assert_eq!(relay.stats.snapshot().connections_accepted, 8);
}

#[tokio::test]
async fn dispatcher_drains_queued_clients_one_accept_per_turn() {
    let backend = ScriptedBackend::spawn(REPLY).await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.accept_batch = 1;
    config.accept_mode = AcceptMode::Dispatch;
    config.workers = 2;
    let relay = RelayFixture::spawn(config).unwrap();

    relay_queued_clients(&relay, 8).await;

    assert_eq!(backend.connection_count(), 8);
    assert_eq!(relay.stats.snapshot().connections_accepted, 8);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn splice_mode_relays_request_and_reply() {
    let backend = ScriptedBackend::spawn(REPLY).await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.zero_copy = tcprelay::ZeroCopyMode::Splice;
    let relay = RelayFixture::spawn(config).unwrap();

    let reply = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("splice exchange timed out")
        .unwrap();

    assert_eq!(reply, REPLY);
    assert_eq!(backend.requests(), vec![REQUEST.to_vec()]);

    let stats = relay.stats.clone();
    assert!(eventually(|| stats.sessions_freed.load(Ordering::Relaxed) == 1).await);
    assert_eq!(stats.snapshot().client_bytes_sent, 19);
}
