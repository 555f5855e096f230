// tests/session_handshake_test.rs

//! End-to-end handshake between an initiator and an acceptor session over
//! a real loopback TCP socket, exercising version negotiation and
//! byte-order detection together (spec.md §4.1, §4.4).

use clustercache::channel::LinkRole;
use clustercache::session::{Session, SessionState};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn initiator_and_acceptor_complete_the_hello_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let acceptor_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        Session::handshake(stream, LinkRole::Acceptor, 1, 1, 0, 1, 0, 2, addr.port())
            .await
            .unwrap()
    });

    let initiator_stream = TcpStream::connect(addr).await.unwrap();
    let initiator = Session::handshake(initiator_stream, LinkRole::Initiator, 2, 1, 0, 1, 0, 1, addr.port())
        .await
        .unwrap();

    let acceptor = acceptor_task.await.unwrap();

    assert_eq!(initiator.state(), SessionState::Active);
    assert_eq!(acceptor.state(), SessionState::Active);
}

#[tokio::test]
async fn mismatched_major_versions_fail_the_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let acceptor_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        Session::handshake(stream, LinkRole::Acceptor, 1, 9, 0, 9, 0, 2, addr.port()).await
    });

    let initiator_stream = TcpStream::connect(addr).await.unwrap();
    let initiator_result =
        Session::handshake(initiator_stream, LinkRole::Initiator, 2, 1, 0, 1, 0, 1, addr.port()).await;

    let acceptor_result = acceptor_task.await.unwrap();
    assert!(initiator_result.is_err() || acceptor_result.is_err());
}
