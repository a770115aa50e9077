//! Error-flow behaviour: processing failures become replies routed to the
//! connection that sent the failing request.

use std::net::SocketAddr;

use bytes::Bytes;
use framegate::{
    BoxError,
    Envelope,
    ErrorChannelFn,
    FactoryConfig,
    GatewayFailure,
    HandlerChannel,
    InboundGateway,
    TcpServerFactory,
};
use rstest::rstest;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::Duration};

use crate::gateway_helpers::{expect_closed, listen_addr, read_exactly};


/// A downstream service that always fails, echoing the payload into the
/// error description so each failure is distinguishable.
fn failing_service() -> HandlerChannel {
    HandlerChannel::new(|envelope: Envelope| async move {
        let payload = String::from_utf8_lossy(envelope.payload()).into_owned();
        Err::<Bytes, BoxError>(format!("failed:{payload}").into())
    })
}

#[rstest]
#[tokio::test]
async fn concurrent_failures_each_reach_their_own_peer(listen_addr: SocketAddr) {
    let error_channel = ErrorChannelFn::new(|failure: GatewayFailure| async move {
        let text = format!("error({})", failure.description());
        failure
            .reply_to()
            .reply(Bytes::from(text))
            .expect("error reply accepted");
    });
    let gateway = InboundGateway::server(
        TcpServerFactory::new(listen_addr, FactoryConfig::new().single_use(true)),
        failing_service(),
    )
    .error_channel(error_channel)
    .stop_grace(Duration::from_millis(50));
    gateway.start().await.expect("start");
    let addr = gateway.local_addr().expect("bound address");

    let mut first = TcpStream::connect(addr).await.expect("connect first");
    let mut second = TcpStream::connect(addr).await.expect("connect second");
    first.write_all(b"Test1\r\n").await.expect("write first");
    second.write_all(b"Test2\r\n").await.expect("write second");

    let expected_first = b"error(failed:Test1)\r\n";
    let expected_second = b"error(failed:Test2)\r\n";
    assert_eq!(
        read_exactly(&mut first, expected_first.len()).await,
        expected_first
    );
    assert_eq!(
        read_exactly(&mut second, expected_second.len()).await,
        expected_second
    );

    // The error reply completes the single-use cycle.
    expect_closed(&mut first).await;
    expect_closed(&mut second).await;

    gateway.stop().await;
    assert_eq!(gateway.pending_replies(), 0);
}

#[rstest]
#[tokio::test]
async fn without_error_channel_the_peer_sees_only_a_close(listen_addr: SocketAddr) {
    let gateway = InboundGateway::server(
        TcpServerFactory::new(listen_addr, FactoryConfig::new().single_use(true)),
        failing_service(),
    )
    .stop_grace(Duration::from_millis(50));
    gateway.start().await.expect("start");
    let addr = gateway.local_addr().expect("bound address");

    let mut socket = TcpStream::connect(addr).await.expect("connect");
    socket.write_all(b"Test1\r\n").await.expect("write");

    // No distorted response: the connection closes without a reply.
    expect_closed(&mut socket).await;

    gateway.stop().await;
    assert_eq!(gateway.pending_replies(), 0);
}

#[rstest]
#[tokio::test]
async fn translated_failure_carries_the_original_payload(listen_addr: SocketAddr) {
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<(String, Bytes)>(1);
    let error_channel = ErrorChannelFn::new(move |failure: GatewayFailure| {
        let seen_tx = seen_tx.clone();
        async move {
            let payload = failure.payload().clone();
            let description = failure.description().to_owned();
            seen_tx
                .send((description, payload))
                .await
                .expect("record failure");
            failure
                .reply_to()
                .reply(Bytes::from_static(b"sorry"))
                .expect("error reply accepted");
        }
    });
    let gateway = InboundGateway::server(
        TcpServerFactory::new(listen_addr, FactoryConfig::new().single_use(true)),
        failing_service(),
    )
    .error_channel(error_channel)
    .stop_grace(Duration::from_millis(50));
    gateway.start().await.expect("start");
    let addr = gateway.local_addr().expect("bound address");

    let mut socket = TcpStream::connect(addr).await.expect("connect");
    socket.write_all(b"Test1\r\n").await.expect("write");

    assert_eq!(read_exactly(&mut socket, 7).await, b"sorry\r\n");
    let (description, payload) = seen_rx.recv().await.expect("failure recorded");
    assert_eq!(description, "failed:Test1");
    assert_eq!(payload, Bytes::from_static(b"Test1"));

    gateway.stop().await;
}
