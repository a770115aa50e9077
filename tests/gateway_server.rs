//! Server-role behaviour of the inbound gateway, for both factory
//! implementations.

use std::net::SocketAddr;

use framegate::{
    FactoryConfig,
    GatewayError,
    InboundGateway,
    QueueChannel,
    ReactorServerFactory,
    TcpServerFactory,
};
use rstest::rstest;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::{Duration, timeout},
};

use crate::gateway_helpers::{
    DEADLINE,
    echo_reply,
    expect_closed,
    listen_addr,
    read_exactly,
    serve_echo,
};


#[derive(Clone, Copy, Debug)]
enum ServerKind {
    Dedicated,
    Reactor,
}

fn gateway_for(
    kind: ServerKind,
    addr: SocketAddr,
    config: FactoryConfig,
    requests: QueueChannel,
) -> InboundGateway {
    match kind {
        ServerKind::Dedicated => {
            InboundGateway::server(TcpServerFactory::new(addr, config), requests)
        }
        ServerKind::Reactor => {
            InboundGateway::server(ReactorServerFactory::new(addr, config), requests)
        }
    }
    .stop_grace(Duration::from_millis(50))
}

async fn connect(addr: SocketAddr) -> TcpStream {
    timeout(DEADLINE, TcpStream::connect(addr))
        .await
        .expect("connect within deadline")
        .expect("connect succeeds")
}

#[rstest]
#[case::dedicated(ServerKind::Dedicated)]
#[case::reactor(ServerKind::Reactor)]
#[tokio::test]
async fn single_use_connections_each_receive_their_reply(
    listen_addr: SocketAddr,
    #[case] kind: ServerKind,
) {
    let (requests, inbound) = QueueChannel::bounded(8);
    let gateway = gateway_for(
        kind,
        listen_addr,
        FactoryConfig::new().single_use(true),
        requests,
    );
    gateway.start().await.expect("start");
    assert!(gateway.is_running());
    let addr = gateway.local_addr().expect("bound address");

    let mut first = connect(addr).await;
    first.write_all(b"Test1\r\n").await.expect("write first");
    let mut second = connect(addr).await;
    second.write_all(b"Test2\r\n").await.expect("write second");

    serve_echo(inbound, 2).await;

    assert_eq!(read_exactly(&mut first, 12).await, b"Echo:Test1\r\n");
    assert_eq!(read_exactly(&mut second, 12).await, b"Echo:Test2\r\n");

    // Single-use: one request/reply cycle, then the gateway closes.
    expect_closed(&mut first).await;
    expect_closed(&mut second).await;

    gateway.stop().await;
    assert!(!gateway.is_running());
    assert_eq!(gateway.pending_replies(), 0);
}

#[rstest]
#[case::dedicated(ServerKind::Dedicated)]
#[case::reactor(ServerKind::Reactor)]
#[tokio::test]
async fn persistent_connection_receives_replies_in_request_order(
    listen_addr: SocketAddr,
    #[case] kind: ServerKind,
) {
    let (requests, mut inbound) = QueueChannel::bounded(8);
    let gateway = gateway_for(kind, listen_addr, FactoryConfig::new(), requests);
    gateway.start().await.expect("start");
    let addr = gateway.local_addr().expect("bound address");

    let mut socket = connect(addr).await;
    socket
        .write_all(b"Test1\r\nTest2\r\n")
        .await
        .expect("write both requests");

    let env_a = timeout(DEADLINE, inbound.recv())
        .await
        .expect("first envelope within deadline")
        .expect("channel open");
    let env_b = timeout(DEADLINE, inbound.recv())
        .await
        .expect("second envelope within deadline")
        .expect("channel open");
    // Publication order across the worker pool is not part of the contract;
    // identify the requests by payload.
    let (first, second) = if env_a.payload() == &b"Test1"[..] {
        (env_a, env_b)
    } else {
        (env_b, env_a)
    };
    assert_eq!(first.payload(), &b"Test1"[..]);
    assert_eq!(second.payload(), &b"Test2"[..]);

    // Resolve the later request first; the wire order must still follow the
    // request order.
    second
        .reply_to()
        .reply(echo_reply(&second))
        .expect("reply second");
    first
        .reply_to()
        .reply(echo_reply(&first))
        .expect("reply first");

    assert_eq!(
        read_exactly(&mut socket, 24).await,
        b"Echo:Test1\r\nEcho:Test2\r\n"
    );

    // The connection stays open for further requests.
    socket.write_all(b"Test3\r\n").await.expect("write third");
    let third = timeout(DEADLINE, inbound.recv())
        .await
        .expect("third envelope within deadline")
        .expect("channel open");
    third
        .reply_to()
        .reply(echo_reply(&third))
        .expect("reply third");
    assert_eq!(read_exactly(&mut socket, 12).await, b"Echo:Test3\r\n");

    gateway.stop().await;
    assert_eq!(gateway.pending_replies(), 0);
}

#[rstest]
#[tokio::test]
async fn start_is_idempotent_and_stop_is_terminal(listen_addr: SocketAddr) {
    let (requests, _inbound) = QueueChannel::bounded(1);
    let gateway = gateway_for(
        ServerKind::Dedicated,
        listen_addr,
        FactoryConfig::new(),
        requests,
    );

    gateway.start().await.expect("first start");
    gateway.start().await.expect("second start is a no-op");
    assert!(gateway.is_running());

    gateway.stop().await;
    assert!(!gateway.is_running());
    gateway.stop().await;

    let err = gateway
        .start()
        .await
        .expect_err("restart after stop is rejected");
    assert!(matches!(err, GatewayError::Stopped));
}

#[rstest]
#[case::dedicated(ServerKind::Dedicated)]
#[case::reactor(ServerKind::Reactor)]
#[tokio::test]
async fn bind_conflict_is_fatal_at_start(#[case] kind: ServerKind) {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("hold a port");
    let addr = holder.local_addr().expect("held address");

    let (requests, _inbound) = QueueChannel::bounded(1);
    let gateway = gateway_for(kind, addr, FactoryConfig::new(), requests);

    let err = gateway.start().await.expect_err("bind must fail");
    assert!(matches!(err, GatewayError::Bind { .. }));
    assert!(!gateway.is_running());
}

#[rstest]
#[case::dedicated(ServerKind::Dedicated)]
#[case::reactor(ServerKind::Reactor)]
#[tokio::test]
async fn oversized_frame_closes_only_the_offending_connection(
    listen_addr: SocketAddr,
    #[case] kind: ServerKind,
) {
    let (requests, inbound) = QueueChannel::bounded(8);
    let gateway = gateway_for(
        kind,
        listen_addr,
        FactoryConfig::new().max_frame_length(8),
        requests,
    );
    gateway.start().await.expect("start");
    let addr = gateway.local_addr().expect("bound address");

    let mut offender = connect(addr).await;
    let mut innocent = connect(addr).await;

    offender
        .write_all(b"this line is far beyond the frame limit")
        .await
        .expect("write oversized");
    expect_closed(&mut offender).await;

    innocent.write_all(b"Test1\r\n").await.expect("write normal");
    serve_echo(inbound, 1).await;
    assert_eq!(read_exactly(&mut innocent, 12).await, b"Echo:Test1\r\n");

    gateway.stop().await;
}
