//! End-to-end uTP tests over real loopback UDP sockets: handshake,
//! ordered transfer, graceful shutdown, and RESET behavior.

use std::time::Duration;

use gosh_core::{ConnectionState, CoreError, NetworkErrorKind, UtpMux, UtpSettings};

async fn mux_pair() -> (UtpMux, UtpMux) {
    let a = UtpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let b = UtpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn handshake_connects_both_ends() {
    let (a, b) = mux_pair().await;

    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_eq!(client.peer_addr(), b.local_addr());
    assert_eq!(server.peer_addr(), a.local_addr());

    assert_eq!(a.status().num_connected, 1);
    assert_eq!(b.status().num_connected, 1);
}

#[tokio::test]
async fn ordered_bulk_transfer() {
    let (a, b) = mux_pair().await;
    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();

    // Payload large enough to span many packets and several
    // congestion-window growth rounds
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client
    });

    let mut received = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(30), server.read_exact(&mut received))
        .await
        .expect("transfer timed out")
        .unwrap();

    // Bytes arrive exactly as sent, in order
    assert_eq!(received, expected);

    let client = writer.await.unwrap();
    let stats = client.stats();
    assert!(stats.bytes_sent >= expected.len() as u64);
}

#[tokio::test]
async fn bidirectional_transfer() {
    let (a, b) = mux_pair().await;
    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();

    client.write_all(b"request").await.unwrap();

    let mut buf = [0u8; 7];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request");

    server.write_all(b"response").await.unwrap();

    let mut buf = [0u8; 8];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    assert_eq!(&buf, b"response");
}

#[tokio::test]
async fn fin_delivers_eof_after_data() {
    let (a, b) = mux_pair().await;
    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();

    client.write_all(b"last words").await.unwrap();
    client.shutdown();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), server.read(&mut chunk))
            .await
            .expect("read timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    // All data precedes the EOF
    assert_eq!(buf, b"last words");
}

#[tokio::test]
async fn connect_refused_by_reset() {
    let a = UtpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let refusing = UtpMux::bind_with_settings(
        "127.0.0.1:0".parse().unwrap(),
        UtpSettings {
            enable_incoming: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), a.connect(refusing.local_addr()))
        .await
        .expect("connect neither succeeded nor failed")
        .expect_err("connect should be refused");

    match err {
        CoreError::Network { kind, .. } => {
            assert_eq!(kind, NetworkErrorKind::ConnectionReset);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn dropped_handle_resets_peer() {
    let (a, b) = mux_pair().await;
    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();

    drop(client);

    // The peer sees the reset as a read error
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), server.read(&mut buf))
        .await
        .expect("read never resolved");
    assert!(result.is_err(), "expected a reset, got {result:?}");
}

#[tokio::test]
async fn deleted_sockets_are_garbage_collected() {
    let (a, b) = mux_pair().await;
    let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();
    assert_eq!(a.socket_count(), 1);

    drop(client);
    drop(server);

    // The reset connections pass through the tick's collector
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.socket_count() > 0 || b.socket_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("sockets were never collected");
}

#[tokio::test]
async fn many_connections_share_one_socket() {
    let (a, b) = mux_pair().await;

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for i in 0..8 {
        let (client, server) = tokio::try_join!(a.connect(b.local_addr()), b.accept()).unwrap();
        client.write_all(format!("hello {i}").as_bytes()).await.unwrap();
        clients.push(client);
        servers.push(server);
    }

    assert_eq!(a.status().num_connected, 8);
    assert_eq!(b.status().num_connected, 8);

    for (i, server) in servers.iter().enumerate() {
        let expected = format!("hello {i}");
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), server.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(buf, expected.as_bytes());
    }
}
