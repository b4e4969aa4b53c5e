//! Shared harness: real listeners for the proxy and the origin, plus a raw
//! TCP client for full control over what goes on the wire.

use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::HeaderMap;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use windgate::{Forwarder, RelayBody, RequestContext};

/// What the origin observed for one request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HeaderMap,
}

/// Serves the forwarder behind a real listener. Every request is routed to
/// `target` (the upstream authority), the way an outer dispatcher would.
pub async fn spawn_proxy(forwarder: Arc<Forwarder>, target: SocketAddr, tls: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let authority: Authority = target.to_string().parse().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, remote)) = listener.accept().await else {
                break;
            };
            let forwarder = forwarder.clone();
            let authority = authority.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let forwarder = forwarder.clone();
                    let authority = authority.clone();
                    async move {
                        let mut parts = req.uri().clone().into_parts();
                        parts.scheme = Some(Scheme::HTTP);
                        parts.authority = Some(authority);
                        if parts.path_and_query.is_none() {
                            parts.path_and_query = Some(PathAndQuery::from_static("/"));
                        }
                        *req.uri_mut() = Uri::from_parts(parts).unwrap();

                        let ctx = RequestContext::new(remote, tls);
                        Ok::<Response<RelayBody>, Infallible>(forwarder.serve(req, ctx).await)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// Origin that records every request it sees and replies `200 hello`.
pub async fn spawn_origin() -> (SocketAddr, UnboundedReceiver<CapturedRequest>) {
    let (tx, rx) = unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx: UnboundedSender<CapturedRequest> = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(CapturedRequest {
                            path: req
                                .uri()
                                .path_and_query()
                                .map(|pq| pq.as_str().to_string())
                                .unwrap_or_default(),
                            headers: req.headers().clone(),
                        });
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("hello"))))
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

/// Writes one raw request and reads the whole response until the server
/// closes. Requests should carry `Connection: close` so the read terminates.
pub async fn raw_round_trip(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    raw
}

/// Splits a raw HTTP/1.1 response into status code, lowercased header
/// section, and body bytes.
pub fn split_response(raw: &[u8]) -> (u16, String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no header terminator");
    let head = String::from_utf8_lossy(&raw[..pos]).to_ascii_lowercase();
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("response has no status line");
    (status, head, raw[pos + 4..].to_vec())
}

/// Reads from `stream` until `needle` has appeared in the accumulated bytes.
/// Panics on EOF or after five seconds, whichever comes first.
pub async fn read_until(stream: &mut TcpStream, collected: &mut Vec<u8>, needle: &[u8]) {
    let deadline = tokio::time::Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        let mut chunk = [0u8; 4096];
        while !collected
            .windows(needle.len().max(1))
            .any(|w| w == needle)
        {
            let n = stream.read(&mut chunk).await.expect("read failed");
            assert!(n > 0, "connection closed before {:?} arrived", needle);
            collected.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", String::from_utf8_lossy(needle)));
}
