//! End-to-end scenarios: a scripted MySQL "server" on one side, a
//! scripted client on the other, the proxy in between.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tollgate::config::Config;
use tollgate::proxy::ProxyPolicy;
use tollgate::server::Proxy;

use clap::Parser;
use tollgate_core::backend::{BackendRegistry, BackendState};
use tollgate_core::protocol::connect::{AuthResponse, Handshake};
use tollgate_core::protocol::response::OkPacket;
use tollgate_core::protocol::Capabilities;

const CHALLENGE: &[u8; 20] = b"abcdefghijklmnopqrst";

// ---- wire helpers --------------------------------------------------

async fn write_frame(stream: &mut TcpStream, seq: u8, payload: &[u8]) {
    let mut header = [0u8; 4];
    header[..3].copy_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    header[3] = seq;

    stream.write_all(&header).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    Ok((header[3], payload))
}

fn handshake_payload() -> Vec<u8> {
    let handshake = Handshake::synthesized("5.5.12", 1, CHALLENGE.to_vec()).unwrap();

    let mut buf = Vec::new();
    handshake.encode(&mut buf);
    buf
}

fn auth_payload(username: &str) -> Vec<u8> {
    let auth = AuthResponse {
        capabilities: Capabilities::base(),
        max_packet_size: 0x0100_0000,
        charset: 8,
        username: username.into(),
        // empty password scrambles to nothing
        scramble: Vec::new(),
        database: None,
        auth_plugin: None,
    };

    let mut buf = Vec::new();
    auth.encode(&mut buf);
    buf
}

fn ok_payload() -> Vec<u8> {
    let mut buf = Vec::new();
    OkPacket::new().encode(&mut buf);
    buf
}

// ---- harness -------------------------------------------------------

async fn spawn_backend<F, Fut>(script: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&accepted);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };

            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(script(stream));
        }
    });

    (addr, accepted)
}

struct ProxyHandle {
    addr: SocketAddr,
    registry: Arc<BackendRegistry>,
    _shutdown: Arc<watch::Sender<bool>>,
}

async fn start_proxy(backends: &[SocketAddr], extra_args: &[&str]) -> ProxyHandle {
    // grab a free port for the listener
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let backend_list = backends
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut args = vec![
        "tollgate".to_string(),
        "--proxy-address".to_string(),
        format!("127.0.0.1:{port}"),
        "--proxy-backend-addresses".to_string(),
        backend_list,
    ];
    args.extend(extra_args.iter().map(ToString::to_string));

    let config = Config::parse_from(args);
    let proxy = Proxy::bind(config, Arc::new(ProxyPolicy)).await.unwrap();

    let handle = ProxyHandle {
        addr: proxy.local_addr().unwrap(),
        registry: proxy.registry(),
        _shutdown: proxy.shutdown_handle(),
    };

    tokio::spawn(proxy.serve());

    handle
}

/// Log in through the proxy with an empty password; returns the
/// connected client stream past the OK packet.
async fn login(addr: SocketAddr, username: &str) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();

    let (seq, greeting) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 0);
    assert_eq!(greeting[0], 10, "protocol version 10");

    write_frame(&mut client, 1, &auth_payload(username)).await;

    let (seq, result) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 2);
    assert_eq!(result[0], 0x00, "login must succeed: {result:02x?}");

    client
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("gave up waiting for {what}");
}

// ---- scenarios -----------------------------------------------------

#[tokio::test]
async fn empty_password_login_single_query_clean_close() {
    let (backend, _) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (seq, _auth) = read_frame(&mut stream).await.unwrap();
        assert_eq!(seq, 1);
        write_frame(&mut stream, 2, &ok_payload()).await;

        let (seq, query) = read_frame(&mut stream).await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&query[..], b"\x03SELECT 1");

        // column count, field def, EOF, one row, EOF
        write_frame(&mut stream, 1, b"\x01").await;
        write_frame(
            &mut stream,
            2,
            b"\x03def\x00\x00\x00\x011\x00\x0c\x3f\x00\x01\x00\x00\x00\x08\x81\x00\x00\x00\x00",
        )
        .await;
        write_frame(&mut stream, 3, b"\xfe\x00\x00\x02\x00").await;
        write_frame(&mut stream, 4, b"\x011").await;
        write_frame(&mut stream, 5, b"\xfe\x00\x00\x02\x00").await;

        let (seq, ping) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, ping[0]), (0, 0x0E));
        write_frame(&mut stream, 1, &ok_payload()).await;

        // hold the line open; COM_QUIT is absorbed by the proxy
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(&[backend], &[]).await;
    let mut client = login(proxy.addr, "root").await;

    write_frame(&mut client, 0, b"\x03SELECT 1").await;

    let mut seqs = Vec::new();
    let mut payloads = Vec::new();
    for _ in 0..5 {
        let (seq, payload) = read_frame(&mut client).await.unwrap();
        seqs.push(seq);
        payloads.push(payload);
    }

    assert_eq!(seqs, [1, 2, 3, 4, 5]);
    assert_eq!(payloads[0], b"\x01");
    assert_eq!(payloads[3], b"\x011");
    assert_eq!(payloads[4][0], 0xFE);

    // the connection survives for the next command
    write_frame(&mut client, 0, b"\x0e").await; // COM_PING
    let (seq, pong) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(pong[0], 0x00);

    write_frame(&mut client, 0, b"\x01").await; // COM_QUIT
}

#[tokio::test]
async fn backend_selection_skips_refused_backend() {
    // a port with nothing behind it
    let dead = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        addr
    };

    let (live, _) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (_, _auth) = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, 2, &ok_payload()).await;

        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(&[dead, live], &[]).await;
    let client = login(proxy.addr, "root").await;

    let backends = proxy.registry.backends();
    assert_eq!(backends[0].state(), BackendState::Down);
    assert_eq!(backends[0].connected_clients(), 0);
    assert_eq!(backends[1].state(), BackendState::Up);
    assert_eq!(backends[1].connected_clients(), 1);

    drop(client);
}

#[tokio::test]
async fn pooled_connection_serves_second_client() {
    let (backend, accepted) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (_, _auth) = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, 2, &ok_payload()).await;

        // first client's query
        let (seq, query) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, &query[..]), (0, &b"\x03SELECT 1"[..]));
        write_frame(&mut stream, 1, &ok_payload()).await;

        // second client's query arrives on the same connection
        let (seq, query) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, &query[..]), (0, &b"\x03SELECT 2"[..]));
        write_frame(&mut stream, 1, &ok_payload()).await;

        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(
        &[backend],
        &["--proxy-pool-connections", "--proxy-pool-no-change-user"],
    )
    .await;

    // client A logs in, queries, quits; its server socket is pooled
    let mut a = login(proxy.addr, "root").await;
    write_frame(&mut a, 0, b"\x03SELECT 1").await;
    let (_, result) = read_frame(&mut a).await.unwrap();
    assert_eq!(result[0], 0x00);

    write_frame(&mut a, 0, b"\x01").await; // COM_QUIT
    drop(a);

    let pool = proxy.registry.backends()[0].pool.clone();
    eventually("the connection to be pooled", || pool.len() == 1).await;
    assert_eq!(proxy.registry.total_connected(), 0);

    // client B gets the cached challenge and skips the backend entirely
    // for auth
    let mut b = TcpStream::connect(proxy.addr).await.unwrap();

    let (seq, greeting) = read_frame(&mut b).await.unwrap();
    assert_eq!(seq, 0);
    let synthesized = Handshake::decode(&greeting).unwrap();
    assert_eq!(synthesized.challenge, CHALLENGE.to_vec());

    write_frame(&mut b, 1, &auth_payload("root")).await;
    let (seq, result) = read_frame(&mut b).await.unwrap();
    assert_eq!(seq, 2);
    assert_eq!(result[0], 0x00);

    write_frame(&mut b, 0, b"\x03SELECT 2").await;
    let (seq, result) = read_frame(&mut b).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(result[0], 0x00);

    // one physical backend connection carried both clients
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_identity_on_pooled_connection() {
    let (backend, _) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (_, _auth) = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, 2, &ok_payload()).await;

        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(
        &[backend],
        &["--proxy-pool-connections", "--proxy-pool-no-change-user"],
    )
    .await;

    let mut a = login(proxy.addr, "root").await;
    write_frame(&mut a, 0, b"\x01").await; // COM_QUIT
    drop(a);

    let pool = proxy.registry.backends()[0].pool.clone();
    eventually("the connection to be pooled", || pool.len() == 1).await;

    // a different username cannot ride the cached credentials
    let mut b = TcpStream::connect(proxy.addr).await.unwrap();
    let (_, _greeting) = read_frame(&mut b).await.unwrap();

    write_frame(&mut b, 1, &auth_payload("other")).await;
    let (_, result) = read_frame(&mut b).await.unwrap();
    assert_eq!(result[0], 0xFF);

    let code = u16::from_le_bytes([result[1], result[2]]);
    assert_eq!(code, 1045);
}

#[tokio::test]
async fn load_data_local_infile_round_trip() {
    let (backend, _) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (_, _auth) = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, 2, &ok_payload()).await;

        let (seq, query) = read_frame(&mut stream).await.unwrap();
        assert_eq!(seq, 0);
        assert!(query.starts_with(b"\x03LOAD DATA"));

        // ask the client for the file
        write_frame(&mut stream, 1, b"\xfbdata.csv").await;

        let (seq, chunk) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, &chunk[..]), (2, &b"1,foo\n"[..]));

        let (seq, chunk) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, &chunk[..]), (3, &b"2,bar\n"[..]));

        let (seq, done) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, done.len()), (4, 0));

        write_frame(&mut stream, 5, &ok_payload()).await;

        let (seq, ping) = read_frame(&mut stream).await.unwrap();
        assert_eq!((seq, ping[0]), (0, 0x0E));
        write_frame(&mut stream, 1, &ok_payload()).await;

        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(&[backend], &[]).await;
    let mut client = login(proxy.addr, "root").await;

    write_frame(&mut client, 0, b"\x03LOAD DATA LOCAL INFILE 'data.csv' INTO TABLE t").await;

    let (seq, request) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(request[0], 0xFB);

    write_frame(&mut client, 2, b"1,foo\n").await;
    write_frame(&mut client, 3, b"2,bar\n").await;
    write_frame(&mut client, 4, b"").await;

    let (seq, result) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 5);
    assert_eq!(result[0], 0x00);

    // back in the command phase
    write_frame(&mut client, 0, b"\x0e").await;
    let (_, pong) = read_frame(&mut client).await.unwrap();
    assert_eq!(pong[0], 0x00);
}

#[tokio::test]
async fn overlong_query_is_forwarded_in_consecutive_frames() {
    const MAX: usize = 0x00FF_FFFF;

    let (backend, _) = spawn_backend(|mut stream| async move {
        write_frame(&mut stream, 0, &handshake_payload()).await;

        let (_, _auth) = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, 2, &ok_payload()).await;

        let (seq, first) = read_frame(&mut stream).await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(first.len(), MAX);
        assert_eq!(first[0], 0x03);

        let (seq, rest) = read_frame(&mut stream).await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(rest.len(), 100);

        write_frame(&mut stream, 2, &ok_payload()).await;

        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;

    let proxy = start_proxy(&[backend], &[]).await;
    let mut client = login(proxy.addr, "root").await;

    let mut first = vec![b' '; MAX];
    first[0] = 0x03;
    write_frame(&mut client, 0, &first).await;
    write_frame(&mut client, 1, &vec![b' '; 100]).await;

    let (seq, result) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 2);
    assert_eq!(result[0], 0x00);
}

#[tokio::test]
async fn invalid_server_version_closes_with_an_error() {
    let (backend, _) = spawn_backend(|mut stream| async move {
        // protocol 10 but a version string that parses to nothing
        let mut payload = vec![10u8];
        payload.extend_from_slice(b"abc\x00");
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&CHALLENGE[..8]);
        payload.push(0);
        payload.extend_from_slice(&0x0200u16.to_le_bytes()); // PROTOCOL_41 only
        payload.push(8);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&[0u8; 13]);

        write_frame(&mut stream, 0, &payload).await;

        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink).await;
    })
    .await;

    let proxy = start_proxy(&[backend], &[]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let (_, err) = read_frame(&mut client).await.unwrap();
    assert_eq!(err[0], 0xFF);

    // nothing was pooled for reuse
    assert!(proxy.registry.backends()[0].pool.is_empty());

    // and the proxy hangs up
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn all_backends_down_yields_a_pre41_error() {
    let dead = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        addr
    };

    let proxy = start_proxy(&[dead], &[]).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let (seq, err) = read_frame(&mut client).await.unwrap();
    assert_eq!(seq, 0);
    assert_eq!(err[0], 0xFF);

    // pre-4.1 encoding: code, then the message with no sqlstate marker
    assert_eq!(&err[3..], b"(proxy) all backends are down");
}
