
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{UdpEchoBackend, UdpRelayHandle};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn datagrams_echo_through_one_session() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = UdpRelayHandle::spawn(backend.addr, Duration::from_secs(5), 16)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay.listen_addr).await.unwrap();

    let mut buf = vec![0u8; 1500];
    for payload in [&b"ping-1"[..], &b"ping-2"[..]] {
        client.send(payload).await.unwrap();
        let n = timeout(TEST_TIMEOUT, client.recv(&mut buf))
            .await
            .expect("echo should come back")
            .unwrap();
        assert_eq!(&buf[..n], payload);
    }

    // Both datagrams flowed through a single peer session.
    assert_eq!(backend.datagrams_received.load(Ordering::Relaxed), 2);
    assert_eq!(relay.stats.sessions_opened.load(Ordering::Relaxed), 1);
    assert_eq!(relay.stats.packets_to_upstream.load(Ordering::Relaxed), 2);
    assert_eq!(relay.stats.packets_from_upstream.load(Ordering::Relaxed), 2);
    assert_eq!(relay.stats.bytes_to_upstream.load(Ordering::Relaxed), 12);
}

#[tokio::test]
async fn idle_sessions_are_swept() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = UdpRelayHandle::spawn(backend.addr, Duration::from_millis(100), 16)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay.listen_addr).await.unwrap();
    client.send(b"hello").await.unwrap();

    let mut buf = vec![0u8; 64];
    timeout(TEST_TIMEOUT, client.recv(&mut buf))
        .await
        .expect("echo should come back")
        .unwrap();

    // Idle well past the timeout so at least one sweep runs.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(relay.stats.sessions_expired.load(Ordering::Relaxed), 1);
    assert_eq!(relay.stats.sessions_active.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn full_session_table_drops_new_peers() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = UdpRelayHandle::spawn(backend.addr, Duration::from_secs(5), 1)
        .await
        .unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first.connect(relay.listen_addr).await.unwrap();
    first.send(b"seat taken").await.unwrap();

    let mut buf = vec![0u8; 64];
    timeout(TEST_TIMEOUT, first.recv(&mut buf))
        .await
        .expect("first peer should get an echo")
        .unwrap();

    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second.connect(relay.listen_addr).await.unwrap();
    second.send(b"no room").await.unwrap();

    // The second peer's datagram is dropped, not relayed.
    assert!(timeout(Duration::from_millis(300), second.recv(&mut buf))
        .await
        .is_err());
    assert_eq!(relay.stats.sessions_rejected.load(Ordering::Relaxed), 1);
    assert_eq!(relay.stats.sessions_opened.load(Ordering::Relaxed), 1);
    assert_eq!(backend.datagrams_received.load(Ordering::Relaxed), 1);
}
