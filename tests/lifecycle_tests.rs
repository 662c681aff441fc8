//! Lifecycle tests: single-start guarantee, idempotent stop, restart gating.

use waypost::{DiscoveryServer, ServerConfig, ServerError};
use waypost_integration_tests::{init_tracing, local_config, reserved_addr, wait_for_bound_addr};

#[tokio::test]
async fn racing_starts_produce_exactly_one_winner() {
    init_tracing();
    let server = DiscoveryServer::new(local_config()).unwrap();

    let a = server.clone();
    let b = server.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.start().await }),
        tokio::spawn(async move { b.start().await }),
    );
    let results = [first.unwrap(), second.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one start call may win");
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(ServerError::AlreadyRunning)))
    );

    // Only one socket exists: the winner's address is the server's address.
    let winner = results.into_iter().find_map(Result::ok).unwrap();
    assert_eq!(server.local_addr(), Some(winner.local_addr()));

    server.stop().await;
}

#[tokio::test]
async fn start_stop_start_reuses_the_server() {
    init_tracing();
    let server = DiscoveryServer::new(local_config()).unwrap();

    let first = server.start().await.unwrap();
    server.stop().await;
    assert!(first.is_closed());
    assert!(!server.is_running());

    let second = server.start().await.unwrap();
    assert!(!second.is_closed());
    assert!(server.is_running());
    server.stop().await;
}

#[tokio::test]
async fn fixed_port_survives_stop_and_restart_cycles() {
    init_tracing();
    let addr = reserved_addr().await;
    let config = ServerConfig {
        listen_addr: addr,
        ..local_config()
    };
    let server = DiscoveryServer::new(config).unwrap();

    // The caller holds on to every channel handle it is given; none of them
    // may keep the port occupied once its channel is closed.
    let first = server.start().await.unwrap();
    assert_eq!(first.local_addr(), addr);
    server.stop().await;

    let second = server.start().await.unwrap();
    assert_eq!(second.local_addr(), addr);

    // Unexpected closure: the automatic rebind also gets the port back.
    second.close();
    let rebound = wait_for_bound_addr(&server).await;
    assert_eq!(rebound, addr);

    server.stop().await;
    drop(first);
    drop(second);
}

#[tokio::test]
async fn double_stop_is_harmless() {
    init_tracing();
    let server = DiscoveryServer::new(local_config()).unwrap();
    server.start().await.unwrap();

    server.stop().await;
    server.stop().await;
    assert!(!server.is_running());
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn subscribing_before_start_is_allowed() {
    init_tracing();
    let server = DiscoveryServer::new(local_config()).unwrap();
    let mut packets = server.incoming_packets();

    let channel = server.start().await.unwrap();
    let addr = channel.local_addr();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"early bird", addr).await.unwrap();

    let envelope = waypost_integration_tests::recv_or_die(&mut packets).await;
    assert_eq!(envelope.payload, b"early bird");

    server.stop().await;
}
