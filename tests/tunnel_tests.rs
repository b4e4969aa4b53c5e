//! End-to-end upgrade tests: the tunnel is driven over raw sockets on both
//! sides so the handshake and the relayed bytes are fully visible.

mod support;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use support::{read_until, spawn_proxy, split_response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use windgate::Forwarder;

fn upgrade_request(path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         host: client.test\r\n\
         connection: Upgrade\r\n\
         upgrade: websocket\r\n\
         sec-websocket-version: 13\r\n\
         sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         \r\n",
        path
    )
}

/// Origin accepting one raw connection: completes the upgrade handshake,
/// waits for a `ping`, answers `ok`, and closes.
async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut head = Vec::new();
        read_until(&mut stream, &mut head, b"\r\n\r\n").await;

        let head_text = String::from_utf8_lossy(&head).to_ascii_lowercase();
        assert!(head_text.contains("upgrade: websocket"), "head: {}", head_text);
        assert!(head_text.contains("connection: upgrade"), "head: {}", head_text);
        assert!(head_text.contains("sec-websocket-key"), "head: {}", head_text);

        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        stream.write_all(b"ok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    addr
}

/// hyper origin that refuses every upgrade with 403 and records each request
/// path it sees.
async fn spawn_refusing_origin() -> (SocketAddr, UnboundedReceiver<String>) {
    let (tx, rx) = unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(req.uri().path().to_string());
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::FORBIDDEN)
                                .body(Full::new(Bytes::from("access denied")))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx)
}

#[tokio::test]
async fn test_forwards_websocket_traffic() {
    let _ = env_logger::builder().is_test(true).try_init();

    let origin = spawn_echo_origin().await;
    let forwarder = Arc::new(Forwarder::new().unwrap());
    let metrics = forwarder.metrics();
    let proxy = spawn_proxy(forwarder, origin, false).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(upgrade_request("/ws").as_bytes())
        .await
        .unwrap();

    let mut collected = Vec::new();
    read_until(&mut stream, &mut collected, b"\r\n\r\n").await;
    let head = String::from_utf8_lossy(&collected).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101"), "head: {}", head);
    assert!(head.contains("upgrade: websocket"), "head: {}", head);
    assert!(head.contains("sec-websocket-accept"), "head: {}", head);

    // Opaque bytes flow both ways once the handshake completes.
    stream.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ok");

    // Origin closes after the reply; teardown propagates to our side.
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    assert_eq!(metrics.websocket_upgrades_total(), 1);
}

#[tokio::test]
async fn test_failed_upgrade_seals_connection() {
    let (origin, mut seen) = spawn_refusing_origin().await;
    let forwarder = Arc::new(Forwarder::new().unwrap());
    let proxy = spawn_proxy(forwarder, origin, false).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(upgrade_request("/ws").as_bytes())
        .await
        .unwrap();

    // The refusal reaches the client with its status and body intact.
    let mut collected = Vec::new();
    read_until(&mut stream, &mut collected, b"access denied").await;
    let (status, head, _) = split_response(&collected);
    assert_eq!(status, 403);
    assert!(head.contains("connection: close"), "head: {}", head);

    let first = tokio::time::timeout(Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "/ws");

    // A follow-up request on the same client connection must never reach the
    // origin: the proxy has sealed the connection.
    let _ = stream
        .write_all(b"GET / HTTP/1.1\r\nhost: client.test\r\n\r\n")
        .await;
    let mut rest = Vec::new();
    let eof = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(eof.is_ok(), "proxy did not close the sealed connection");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        seen.try_recv().is_err(),
        "request crossed a sealed connection"
    );
}

#[tokio::test]
async fn test_upgrade_dial_failure_maps_to_bad_gateway() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let forwarder = Arc::new(Forwarder::new().unwrap());
    let proxy = spawn_proxy(forwarder, dead_addr, false).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(upgrade_request("/ws").as_bytes())
        .await
        .unwrap();

    let mut collected = Vec::new();
    read_until(&mut stream, &mut collected, b"\r\n\r\n").await;
    let (status, _, _) = split_response(&collected);
    assert_eq!(status, 502);
}
