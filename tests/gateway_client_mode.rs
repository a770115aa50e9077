//! Client-mode behaviour: the gateway owns the outbound connection and a
//! supervisor keeps it alive with scheduled retry.

use std::net::SocketAddr;

use framegate::{FactoryConfig, InboundGateway, QueueChannel, TcpClientFactory};
use rstest::rstest;
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    time::{Duration, sleep, timeout},
};

use crate::gateway_helpers::{DEADLINE, expect_closed, free_port, read_exactly, serve_echo};


fn client_gateway(addr: SocketAddr, requests: QueueChannel) -> InboundGateway {
    InboundGateway::client(TcpClientFactory::new(addr, FactoryConfig::new()), requests)
        .retry_interval(Duration::from_millis(100))
        .stop_grace(Duration::from_millis(50))
}

#[rstest]
#[tokio::test]
async fn pipelined_requests_from_the_peer_are_both_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let addr = listener.local_addr().expect("peer address");

    let (requests, inbound) = QueueChannel::bounded(8);
    let gateway = client_gateway(addr, requests);
    gateway.start().await.expect("start");

    let (mut peer, _) = timeout(DEADLINE, listener.accept())
        .await
        .expect("gateway dials within deadline")
        .expect("accept");

    // Two requests back-to-back without waiting for a reply.
    peer.write_all(b"Test1\r\nTest2\r\n")
        .await
        .expect("write both requests");

    serve_echo(inbound, 2).await;

    assert_eq!(
        read_exactly(&mut peer, 24).await,
        b"Echo:Test1\r\nEcho:Test2\r\n"
    );

    // The supervisor kept the connection and the gateway alive throughout.
    assert!(gateway.is_running());

    gateway.stop().await;
    expect_closed(&mut peer).await;
    assert!(!gateway.is_running());
}

#[rstest]
#[tokio::test]
async fn connect_retries_until_a_listener_appears(free_port: SocketAddr) {
    let (requests, inbound) = QueueChannel::bounded(8);
    let gateway = client_gateway(free_port, requests);

    // Nothing listens yet; start succeeds and the supervisor begins
    // retrying.
    gateway.start().await.expect("start");
    assert!(gateway.is_running());

    // Let at least one connect attempt fail before the listener exists.
    sleep(Duration::from_millis(50)).await;
    let listener = TcpListener::bind(free_port).await.expect("bind retry target");

    let (mut peer, _) = timeout(DEADLINE, listener.accept())
        .await
        .expect("gateway retries within deadline")
        .expect("accept");

    peer.write_all(b"Test1\r\n").await.expect("write request");
    serve_echo(inbound, 1).await;
    assert_eq!(read_exactly(&mut peer, 12).await, b"Echo:Test1\r\n");

    gateway.stop().await;
}

#[rstest]
#[tokio::test]
async fn supervisor_reconnects_after_the_connection_is_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let addr = listener.local_addr().expect("peer address");

    let (requests, inbound) = QueueChannel::bounded(8);
    let gateway = client_gateway(addr, requests);
    gateway.start().await.expect("start");

    let (first_peer, _) = timeout(DEADLINE, listener.accept())
        .await
        .expect("first dial within deadline")
        .expect("accept");
    drop(first_peer);

    // The supervisor notices the loss and dials again after the retry
    // interval.
    let (mut second_peer, _) = timeout(DEADLINE, listener.accept())
        .await
        .expect("reconnect within deadline")
        .expect("accept");

    second_peer.write_all(b"Test1\r\n").await.expect("write request");
    serve_echo(inbound, 1).await;
    assert_eq!(read_exactly(&mut second_peer, 12).await, b"Echo:Test1\r\n");

    gateway.stop().await;
}
