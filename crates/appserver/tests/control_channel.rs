//! Drives the control-channel server with raw frames over its Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use appserver::AppKey;
use appserver::Gateway;
use appserver::Server;
use appserver::server::Error;
use appwire::FailureReason;
use appwire::Frame;
use appwire::Request;
use appwire::Response;
use appwire::read_frame;
use appwire::write_frame;
use overlay::Addr;
use overlay::DMSG_NET;
use overlay::Network;
use overlay::generate_keypair;
use overlay::mem::MemoryHub;
use overlay::network::TRANSPORT_PORT;
use tokio::net::UnixStream;

fn network(hub: &MemoryHub) -> Arc<Network> {
    let (pub_key, sec_key) = generate_keypair();
    let conf = overlay::network::Config {
        pub_key,
        sec_key,
        tp_networks: vec![DMSG_NET.to_string()],
        dmsg_disc_addr: "mem://discovery".to_string(),
        dmsg_min_srvs: 1,
    };
    Arc::new(Network::new(conf, Box::new(hub.client(pub_key))))
}

fn sock_path(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("appserver-cc-{}-{}", std::process::id(), test));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("app.sock")
}

struct Harness {
    server: Arc<Server>,
    serving: tokio::task::JoinHandle<appserver::server::Result<()>>,
    key: AppKey,
    sock: PathBuf,
}

fn start(test: &str, net: Arc<Network>) -> Harness {
    let sock = sock_path(test);
    let key = AppKey::generate();
    let gateway = Arc::new(Gateway::new(tracing::Span::none(), net));
    let server = Arc::new(Server::new(tracing::Span::none(), &sock, key.clone(), gateway).unwrap());
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_and_serve().await })
    };
    Harness { server, serving, key, sock }
}

async fn session(h: &Harness, key: &str) -> UnixStream {
    let mut stream = UnixStream::connect(&h.sock).await.unwrap();
    write_frame(&mut stream, &Frame::Hello { key: key.to_string() }).await.unwrap();
    stream
}

async fn call(stream: &mut UnixStream, seq: u64, request: Request) -> Result<Response, FailureReason> {
    write_frame(stream, &Frame::Call { seq, request }).await.unwrap();
    match read_frame(stream).await.unwrap() {
        Some(Frame::Reply { seq: got, status }) => {
            assert_eq!(got, seq);
            status
        }
        other => panic!("expected a reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_calls_are_answered() {
    let hub = MemoryHub::default();
    let (host, peer) = (network(&hub), network(&hub));
    let h = start("answered", host);
    let mut stream = session(&h, h.key.as_str()).await;

    let listener = peer.listen(DMSG_NET, TRANSPORT_PORT).await.unwrap();
    let remote = Addr::new(peer.local_pk(), TRANSPORT_PORT);
    let dialed = call(&mut stream, 1, Request::Dial { net: DMSG_NET.into(), remote }).await;
    let Ok(Response::Dialed { conn_id, .. }) = dialed else {
        panic!("dial failed: {:?}", dialed);
    };
    let accepted = listener.accept_conn().await.unwrap();

    let written = call(&mut stream, 2, Request::Write { conn_id, data: b"abc".to_vec() }).await;
    assert_eq!(written, Ok(Response::Written(3)));
    let mut buf = [0u8; 3];
    accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abc");

    let unknown = call(&mut stream, 3, Request::Read { conn_id: conn_id + 1, max: 8 }).await;
    assert_eq!(unknown, Err(FailureReason::NoSuchConnection));

    let closed = call(&mut stream, 4, Request::CloseConn { conn_id }).await;
    assert_eq!(closed, Ok(Response::Closed));
}

#[tokio::test]
async fn test_blocked_read_does_not_hold_up_other_calls() {
    let hub = MemoryHub::default();
    let (host, peer) = (network(&hub), network(&hub));
    let h = start("blocked", host);
    let mut stream = session(&h, h.key.as_str()).await;

    let listener = peer.listen(DMSG_NET, TRANSPORT_PORT).await.unwrap();
    let remote = Addr::new(peer.local_pk(), TRANSPORT_PORT);
    let Ok(Response::Dialed { conn_id, .. }) =
        call(&mut stream, 1, Request::Dial { net: DMSG_NET.into(), remote }).await
    else {
        panic!("dial failed");
    };
    let accepted = listener.accept_conn().await.unwrap();

    // Nothing to read yet; the reply to seq 2 arrives after seq 3's.
    write_frame(&mut stream, &Frame::Call { seq: 2, request: Request::Read { conn_id, max: 8 } })
        .await
        .unwrap();
    let written = call(&mut stream, 3, Request::Write { conn_id, data: b"x".to_vec() }).await;
    assert_eq!(written, Ok(Response::Written(1)));

    accepted.write(b"late").await.unwrap();
    let reply = read_frame(&mut stream).await.unwrap();
    assert_eq!(
        reply,
        Some(Frame::Reply { seq: 2, status: Ok(Response::Data(b"late".to_vec())) })
    );
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let hub = MemoryHub::default();
    let h = start("wrong-key", network(&hub));
    let mut stream = session(&h, "not-the-key").await;

    write_frame(&mut stream, &Frame::Call { seq: 1, request: Request::CloseConn { conn_id: 1 } })
        .await
        .ok();
    let reply = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
        .await
        .unwrap();
    assert!(matches!(reply, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_session_must_open_with_hello() {
    let hub = MemoryHub::default();
    let h = start("no-hello", network(&hub));
    let mut stream = UnixStream::connect(&h.sock).await.unwrap();

    write_frame(&mut stream, &Frame::Call { seq: 1, request: Request::CloseConn { conn_id: 1 } })
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
        .await
        .unwrap();
    assert!(matches!(reply, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_close_ends_serving_and_sessions() {
    let hub = MemoryHub::default();
    let (host, peer) = (network(&hub), network(&hub));
    let h = start("close", host.clone());
    let mut stream = session(&h, h.key.as_str()).await;

    let listen = call(&mut stream, 1, Request::Listen { net: DMSG_NET.into(), port: 45 }).await;
    assert!(matches!(listen, Ok(Response::Listening { .. })));
    assert_eq!(h.server.gateway().listener_count(), 1);

    h.server.close().await.unwrap();
    assert!(h.server.is_closed());
    assert!(!h.sock.exists());

    let served = tokio::time::timeout(Duration::from_secs(5), h.serving).await.unwrap().unwrap();
    assert!(served.is_ok());
    assert_eq!(h.server.gateway().listener_count(), 0);

    let reply = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
        .await
        .unwrap();
    assert!(matches!(reply, Ok(None) | Err(_)));

    // The listener's port was released with the server.
    assert!(peer.dial(DMSG_NET, host.local_pk(), 45).await.is_err());
    host.listen(DMSG_NET, 45).await.unwrap();

    h.server.close().await.unwrap();
    assert!(h.server.listen_and_serve().await.is_ok());
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let sock = sock_path("stale");
    drop(std::os::unix::net::UnixListener::bind(&sock).unwrap());
    assert!(sock.exists());

    let hub = MemoryHub::default();
    let gateway = Arc::new(Gateway::new(tracing::Span::none(), network(&hub)));
    let server = Server::new(tracing::Span::none(), &sock, AppKey::generate(), gateway);
    assert!(server.is_ok());
}

#[tokio::test]
async fn test_socket_path_must_not_be_a_file() {
    let sock = sock_path("occupied");
    std::fs::write(&sock, b"data").unwrap();

    let hub = MemoryHub::default();
    let gateway = Arc::new(Gateway::new(tracing::Span::none(), network(&hub)));
    let server = Server::new(tracing::Span::none(), &sock, AppKey::generate(), gateway);
    assert!(matches!(server, Err(Error::PathOccupied(_))));
    assert!(sock.exists());
}

#[tokio::test]
async fn test_serve_twice() {
    let hub = MemoryHub::default();
    let h = start("twice", network(&hub));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(h.server.listen_and_serve().await, Err(Error::AlreadyServing)));
    h.server.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_session_does_not_cut_writes_short() {
    const LEN: usize = 200 * 1024;

    let hub = MemoryHub::default();
    let (host, peer) = (network(&hub), network(&hub));
    let h = start("mid-write", host);
    let mut stream = session(&h, h.key.as_str()).await;

    let listener = peer.listen(DMSG_NET, TRANSPORT_PORT).await.unwrap();
    let remote = Addr::new(peer.local_pk(), TRANSPORT_PORT);
    let Ok(Response::Dialed { conn_id, .. }) =
        call(&mut stream, 1, Request::Dial { net: DMSG_NET.into(), remote }).await
    else {
        panic!("dial failed");
    };
    let accepted = listener.accept_conn().await.unwrap();

    // The peer is not reading yet, so the write stalls; then the app goes away.
    let big = Request::Write { conn_id, data: vec![7; LEN] };
    write_frame(&mut stream, &Frame::Call { seq: 2, request: big }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(stream);

    let mut again = session(&h, h.key.as_str()).await;
    let mut received = 0;
    let mut buf = vec![0u8; 16 * 1024];
    while received < LEN {
        let n = tokio::time::timeout(Duration::from_secs(5), accepted.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().all(|b| *b == 7));
        received += n;
    }

    let written = call(&mut again, 3, Request::Write { conn_id, data: b"tail".to_vec() }).await;
    assert_eq!(written, Ok(Response::Written(4)));
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"tail");
}

#[tokio::test]
async fn test_concurrent_close_returns_after_teardown() {
    let hub = MemoryHub::default();
    let (host, peer) = (network(&hub), network(&hub));
    let h = start("close-race", host);
    let mut stream = session(&h, h.key.as_str()).await;

    let _listener = peer.listen(DMSG_NET, TRANSPORT_PORT).await.unwrap();
    let remote = Addr::new(peer.local_pk(), TRANSPORT_PORT);
    let dialed = call(&mut stream, 1, Request::Dial { net: DMSG_NET.into(), remote }).await;
    assert!(dialed.is_ok());
    assert_eq!(h.server.gateway().conn_count(), 1);

    let gateway = h.server.gateway().clone();
    let check = |res: appserver::server::Result<()>| {
        assert!(res.is_ok());
        assert!(gateway.is_closed());
        assert_eq!(gateway.conn_count(), 0);
    };
    let (first, second) = tokio::join!(h.server.close(), h.server.close());
    check(first);
    check(second);
    assert!(!h.sock.exists());
}
