
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    dead_addr, eventually, exchange, relay_config, RelayFixture, ScriptedBackend, TcpEchoBackend,
    REPLY, REQUEST,
};
use tcprelay::{ProxyConfig, Relay, RelayError, ZeroCopyMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn echo_once(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[tokio::test]
async fn sessions_beyond_ceiling_are_closed_without_payload() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut config = relay_config(vec![backend.addr]);
    config.max_sessions = 1;
    let relay = RelayFixture::spawn(config).unwrap();

    let mut held = TcpStream::connect(relay.listen_addr).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), echo_once(&mut held, b"hold"))
        .await
        .expect("first session timed out")
        .unwrap();
    assert_eq!(echoed, b"hold");

    let mut rejected = TcpStream::connect(relay.listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), rejected.read(&mut buf))
        .await
        .expect("rejected client never closed");
    assert!(matches!(read, Ok(0) | Err(_)), "rejected client got payload");

    let stats = relay.stats.clone();
    assert_eq!(stats.snapshot().connections_rejected, 1);
    assert_eq!(stats.snapshot().sessions_live, 1);

    drop(held);
    assert!(
        eventually(|| stats.sessions_live.load(Ordering::Relaxed) == 0).await,
        "held session never freed"
    );

    let mut next = TcpStream::connect(relay.listen_addr).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), echo_once(&mut next, b"again"))
        .await
        .expect("session after release timed out")
        .unwrap();
    assert_eq!(echoed, b"again");
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn failed_backend_dial_closes_client() {
    let backend = dead_addr().await;
    let relay = RelayFixture::spawn(relay_config(vec![backend])).unwrap();

    let reply = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("client never closed");
    match reply {
        Ok(bytes) => assert!(bytes.is_empty(), "client got payload from a dead backend"),
        Err(_) => {}
    }

    let stats = relay.stats.clone();
    assert!(
        eventually(|| stats.backend_dial_failed.load(Ordering::Relaxed) == 1).await,
        "dial failure not counted"
    );
    assert!(eventually(|| stats.sessions_live.load(Ordering::Relaxed) == 0).await);
}

#[tokio::test]
async fn dead_backend_is_skipped_by_the_next_selection() {
    let live = ScriptedBackend::spawn(REPLY).await.unwrap();
    let relay =
        RelayFixture::spawn(relay_config(vec![dead_addr().await, live.addr])).unwrap();

    let first = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("first exchange timed out")
        .unwrap_or_default();
    assert!(first.is_empty());

    let second = timeout(Duration::from_secs(5), exchange(relay.listen_addr, REQUEST))
        .await
        .expect("second exchange timed out")
        .unwrap();
    assert_eq!(second, REPLY);
}

#[tokio::test]
async fn empty_backend_list_is_rejected_at_startup() {
    let config = ProxyConfig::new("127.0.0.1:0".parse().unwrap(), Vec::new());
    let err = Relay::bind(config).unwrap_err();
    assert_eq!(err.reason_code(), "config_error");
}

#[tokio::test]
async fn kernel_module_zero_copy_is_rejected_at_startup() {
    let mut config = relay_config(vec!["127.0.0.1:9".parse().unwrap()]);
    config.zero_copy = ZeroCopyMode::KernelModule;
    assert!(matches!(Relay::bind(config), Err(RelayError::Config(_))));
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = RelayFixture::spawn(relay_config(vec![backend.addr])).unwrap();
    let addr = relay.listen_addr;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), echo_once(&mut stream, b"before"))
        .await
        .expect("echo before shutdown timed out")
        .unwrap();
    assert_eq!(echoed, b"before");

    timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || relay.stop()),
    )
    .await
    .expect("shutdown timed out")
    .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
