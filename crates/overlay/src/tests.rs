//! Tests for the address codec, the network and its connection wrappers,
//! using the in-memory transport.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::addr::Addr;
use crate::addr::AddrError;
use crate::addr::disassemble_addr;
use crate::cipher::KeyError;
use crate::cipher::PubKey;
use crate::cipher::generate_keypair;
use crate::conn::AddrConn;
use crate::mem::MemoryHub;
use crate::mem::MemoryStream;
use crate::network::Config;
use crate::network::DMSG_NET;
use crate::network::Error;
use crate::network::Network;
use crate::network::TRANSPORT_PORT;
use crate::transport;
use crate::transport::OverlayClient;
use crate::transport::RawListener;
use crate::transport::RawStream;
use crate::transport::TransportError;

fn config() -> Config {
    let (pub_key, sec_key) = generate_keypair();
    Config {
        pub_key,
        sec_key,
        tp_networks: vec![DMSG_NET.to_string()],
        dmsg_disc_addr: "mem://discovery".to_string(),
        dmsg_min_srvs: 1,
    }
}

fn network(hub: &MemoryHub) -> Network {
    let conf = config();
    let client = hub.client(conf.pub_key);
    Network::new(conf, Box::new(client))
}

// --- Address codec ---

#[test]
fn test_addr_round_trip() {
    for port in [0u16, 1, 45, 136, u16::MAX] {
        let (pk, _) = generate_keypair();
        let addr = Addr::new(pk, port);
        let parsed: Addr = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.port, Some(port));
    }
}

#[test]
fn test_addr_sentinel() {
    let (pk, _) = generate_keypair();
    let text = format!("{}:~", pk);
    let parsed: Addr = text.parse().unwrap();
    assert_eq!(parsed.pk, pk);
    assert_eq!(parsed.port, None);
    assert_eq!(parsed.port_or_zero(), 0);
    assert_eq!(parsed.to_string(), text);
}

#[test]
fn test_addr_malformed() {
    let (pk, _) = generate_keypair();
    let cases = [
        (String::new(), AddrError::SegmentCount(1)),
        (pk.to_string(), AddrError::SegmentCount(1)),
        (format!("{}:45:46", pk), AddrError::SegmentCount(3)),
        (format!("{}:", pk), AddrError::EmptySegment),
        (":45".to_string(), AddrError::EmptySegment),
        (format!("{}:abc", pk), AddrError::InvalidPort("abc".into())),
        (format!("{}:-1", pk), AddrError::InvalidPort("-1".into())),
        (format!("{}:+5", pk), AddrError::InvalidPort("+5".into())),
        (format!("{}:70000", pk), AddrError::InvalidPort("70000".into())),
        ("zz:45".to_string(), AddrError::InvalidKey(KeyError::InvalidHex)),
        ("abcd:45".to_string(), AddrError::InvalidKey(KeyError::InvalidLength(2))),
    ];

    for (text, expected) in cases {
        let err = text.parse::<Addr>().expect_err(&text);
        assert_eq!(err, expected, "input: {:?}", text);
    }
}

#[test]
fn test_disassemble_addr_defect() {
    let defect = disassemble_addr("not-an-addr").unwrap_err();
    assert_eq!(defect.addr, "not-an-addr");
    assert_eq!(defect.reason, AddrError::SegmentCount(1));
    assert!(defect.to_string().starts_with("network.disassemble_addr"));
}

#[test]
fn test_pubkey_text_round_trip() {
    let (pk, sk) = generate_keypair();
    assert_eq!(sk.pub_key(), pk);
    assert_eq!(pk.to_string().len(), 64);
    assert_eq!(pk.to_string().parse::<PubKey>().unwrap(), pk);
    assert!(!format!("{:?}", sk).contains(&hex::encode(sk.as_bytes())));
}

// --- Network ---

/// Transport that counts every call it receives.
#[derive(Default)]
struct CountingClient {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl OverlayClient for CountingClient {
    async fn initiate_server_connections(&self, _min: usize) -> transport::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dial(&self, _pk: PubKey, _port: u16) -> transport::Result<Box<dyn RawStream>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::ConnectionRefused("counting".into()))
    }

    async fn listen(&self, port: u16) -> transport::Result<Box<dyn RawListener>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::PortInUse(port))
    }

    async fn close(&self) -> transport::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_unknown_network_never_reaches_transport() {
    let client = CountingClient::default();
    let calls = client.calls.clone();
    let net = Network::new(config(), Box::new(client));
    let (pk, _) = generate_keypair();

    for name in ["tcp", "", "DMSG", "dmsg "] {
        let err = net.dial(name, pk, 45).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNetwork(ref n) if n == name));
        let err = net.listen(name, 45).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNetwork(_)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transport_errors_pass_through() {
    let hub = MemoryHub::default();
    let a = network(&hub);
    let b = network(&hub);

    let err = a.dial(DMSG_NET, b.local_pk(), 7).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::ConnectionRefused(_))));

    let _lis = a.listen(DMSG_NET, 7).await.unwrap();
    let err = a.listen(DMSG_NET, 7).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::PortInUse(7))));
}

#[tokio::test]
async fn test_listen_accept_dial_mirror() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);

    let listener = server.listen(DMSG_NET, TRANSPORT_PORT).await.unwrap();
    assert_eq!(listener.local_pk(), server.local_pk());
    assert_eq!(listener.local_port(), TRANSPORT_PORT);
    assert_eq!(listener.network(), DMSG_NET);

    let (accepted, dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), TRANSPORT_PORT),
    );
    let accepted = accepted.unwrap();
    let dialed = dialed.unwrap();

    assert_eq!(accepted.local_pk(), dialed.remote_pk());
    assert_eq!(accepted.local_port(), dialed.remote_port());
    assert_eq!(accepted.remote_pk(), dialed.local_pk());
    assert_eq!(accepted.remote_port(), dialed.local_port());
    assert_eq!(dialed.local_pk(), client.local_pk());
    assert_eq!(dialed.remote_port(), TRANSPORT_PORT);
    assert_eq!(accepted.network(), dialed.network());
}

#[tokio::test]
async fn test_conn_data_and_end_of_stream() -> anyhow::Result<()> {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let listener = server.listen(DMSG_NET, 80).await?;

    let (accepted, dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), 80),
    );
    let (accepted, dialed) = (accepted?, dialed?);

    assert_eq!(dialed.write(b"hello").await?, 5);
    let mut buf = [0u8; 16];
    let n = accepted.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"hello");

    dialed.close().await?;
    assert_eq!(accepted.read(&mut buf).await?, 0);
    Ok(())
}

/// Exercises a connection only through the generic capability set.
async fn ping(conn: &dyn AddrConn, peer: &dyn AddrConn) -> std::io::Result<Vec<u8>> {
    conn.write(b"ping").await?;
    let mut buf = [0u8; 4];
    let n = peer.read(&mut buf).await?;
    Ok(buf[..n].to_vec())
}

#[tokio::test]
async fn test_conn_as_addr_conn() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let listener = server.listen(DMSG_NET, 81).await.unwrap();

    let (accepted, dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), 81),
    );
    let (accepted, dialed) = (accepted.unwrap(), dialed.unwrap());

    assert_eq!(ping(&dialed, &accepted).await.unwrap(), b"ping");
    assert_eq!(AddrConn::remote_addr(&dialed), AddrConn::local_addr(&accepted));

    AddrConn::close(&dialed).await.unwrap();
    let err = AddrConn::write(&dialed, b"x").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

#[tokio::test]
async fn test_conn_close_is_idempotent() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let listener = server.listen(DMSG_NET, 82).await.unwrap();

    let (_accepted, dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), 82),
    );
    let dialed = Arc::new(dialed.unwrap());

    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    dialed.set_release_hook(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut closers = Vec::new();
    for _ in 0..8 {
        let conn = dialed.clone();
        closers.push(tokio::spawn(async move { conn.close().await }));
    }
    for closer in closers {
        closer.await.unwrap().unwrap();
    }
    dialed.close().await.unwrap();

    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(dialed.is_closed());
    assert!(matches!(dialed.write(b"late").await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_unblocks_pending_read() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let listener = server.listen(DMSG_NET, 83).await.unwrap();

    let (accepted, _dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), 83),
    );
    let accepted = Arc::new(accepted.unwrap());

    let reader = accepted.clone();
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    accepted.close().await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert!(matches!(res, Err(Error::Closed)));
}

#[tokio::test]
async fn test_close_releases_stream_for_peer() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let listener = server.listen(DMSG_NET, 87).await.unwrap();

    let (accepted, dialed) = tokio::join!(
        listener.accept_conn(),
        client.dial(DMSG_NET, server.local_pk(), 87),
    );
    let (accepted, dialed) = (accepted.unwrap(), dialed.unwrap());

    // The closed side stays referenced; the peer must still see it gone.
    accepted.close().await.unwrap();

    let big = vec![7u8; 256 * 1024];
    let res = tokio::time::timeout(Duration::from_secs(2), dialed.write(&big))
        .await
        .expect("peer write blocked after close");
    assert!(matches!(res, Err(Error::Io(_))));

    let mut buf = [0u8; 8];
    assert_eq!(dialed.read(&mut buf).await.unwrap(), 0);
    assert!(matches!(accepted.read(&mut buf).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_listener_close_unblocks_accept() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let listener = Arc::new(server.listen(DMSG_NET, 84).await.unwrap());

    let acceptor = listener.clone();
    let pending = tokio::spawn(async move { acceptor.accept_conn().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.close().await.unwrap();
    listener.close().await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert!(matches!(res, Err(Error::Closed)));

    // The port is free again.
    let _again = server.listen(DMSG_NET, 84).await.unwrap();
}

#[tokio::test]
async fn test_init_waits_for_min_servers() {
    let hub = MemoryHub::new(0);
    let mut conf = config();
    conf.dmsg_min_srvs = 2;
    let net = Network::new(conf.clone(), Box::new(hub.client(conf.pub_key)));

    let err = net.init(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
    assert!(err.to_string().contains("failed to initiate 'dmsg'"));

    let feeder = hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        feeder.add_server();
        feeder.add_server();
    });
    net.init(Duration::from_secs(5)).await.unwrap();
    assert_eq!(hub.servers(), 2);
}

#[tokio::test]
async fn test_network_close() {
    let hub = MemoryHub::default();
    let server = network(&hub);
    let client = network(&hub);
    let _listener = server.listen(DMSG_NET, 85).await.unwrap();

    server.close().await.unwrap();
    server.close().await.unwrap();

    assert!(matches!(server.listen(DMSG_NET, 86).await, Err(Error::Closed)));
    let err = client.dial(DMSG_NET, server.local_pk(), 85).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::ConnectionRefused(_))));
}

/// Transport whose teardown takes a while.
#[derive(Default)]
struct SlowCloseClient {
    torn_down: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl OverlayClient for SlowCloseClient {
    async fn initiate_server_connections(&self, _min: usize) -> transport::Result<()> {
        Ok(())
    }

    async fn dial(&self, _pk: PubKey, _port: u16) -> transport::Result<Box<dyn RawStream>> {
        Err(TransportError::Closed)
    }

    async fn listen(&self, _port: u16) -> transport::Result<Box<dyn RawListener>> {
        Err(TransportError::Closed)
    }

    async fn close(&self) -> transport::Result<()> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_close_waits_for_teardown() {
    let client = SlowCloseClient::default();
    let torn_down = client.torn_down.clone();
    let net = Arc::new(Network::new(config(), Box::new(client)));

    let first = {
        let net = net.clone();
        tokio::spawn(async move { net.close().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    net.close().await.unwrap();
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);

    first.await.unwrap().unwrap();
    net.close().await.unwrap();
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_accessor_reaches_transport() {
    let client = CountingClient::default();
    let calls = client.calls.clone();
    let net = Network::new(config(), Box::new(client));

    let res = net.client().listen(9).await;
    assert!(matches!(res, Err(TransportError::PortInUse(9))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Transport that reports endpoints outside the overlay text forms.
struct MalformedClient;

#[async_trait::async_trait]
impl OverlayClient for MalformedClient {
    async fn initiate_server_connections(&self, _min: usize) -> transport::Result<()> {
        Ok(())
    }

    async fn dial(&self, _pk: PubKey, _port: u16) -> transport::Result<Box<dyn RawStream>> {
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(MemoryStream::with_endpoints(near, "127.0.0.1:80:1", "garbage")))
    }

    async fn listen(&self, _port: u16) -> transport::Result<Box<dyn RawListener>> {
        Err(TransportError::Io("unsupported".into()))
    }

    async fn close(&self) -> transport::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_malformed_endpoint_is_a_defect() {
    let net = Network::new(config(), Box::new(MalformedClient));
    let (pk, _) = generate_keypair();

    let err = net.dial(DMSG_NET, pk, 45).await.unwrap_err();
    let Error::Defect(defect) = err else {
        panic!("expected a defect, got {:?}", err);
    };
    assert_eq!(defect.addr, "127.0.0.1:80:1");
    assert_eq!(defect.reason, AddrError::SegmentCount(3));
}
