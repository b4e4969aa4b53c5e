use crate::body::RelayBody;
use crate::error::ForwardError;
use crate::metrics::{ForwarderMetrics, TunnelGuard};
use crate::transport::{Dialer, TunnelStream};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// How much of the origin's response head is read before the handshake is
/// considered invalid.
const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Relays a protocol upgrade: writes the rewritten handshake to a freshly
/// dialed origin connection, mirrors the origin's reply, and on `101`
/// reclaims the inbound connection for a full-duplex byte copy.
pub(crate) struct TunnelForwarder {
    dialer: Arc<dyn Dialer>,
    connection_tokens: Vec<String>,
    handshake_timeout: Duration,
    metrics: Arc<ForwarderMetrics>,
}

impl TunnelForwarder {
    pub(crate) fn new(
        dialer: Arc<dyn Dialer>,
        connection_tokens: Vec<String>,
        handshake_timeout: Duration,
        metrics: Arc<ForwarderMetrics>,
    ) -> Self {
        Self {
            dialer,
            connection_tokens,
            handshake_timeout,
            metrics,
        }
    }

    pub(crate) async fn forward(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<RelayBody>, ForwardError> {
        if req.extensions().get::<OnUpgrade>().is_none() {
            return Err(ForwardError::Hijack(
                "inbound connection exposes no upgrade capability".into(),
            ));
        }
        let on_upgrade = hyper::upgrade::on(&mut req);

        let mut upstream = self.dialer.dial(req.uri()).await?;
        let head = encode_request_head(&req, &self.connection_tokens);
        upstream.write_all(&head).await?;

        let (buf, header_len) = read_header_section(&mut upstream).await?;
        let (status, mut headers) = parse_response_head(&buf[..header_len])?;
        let leftover = buf[header_len..].to_vec();

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!("origin refused upgrade with {}, sealing connection", status);
            let body = self
                .read_handshake_body(&mut upstream, leftover, &headers)
                .await;
            let body = finalize_refusal_headers(&mut headers, body);

            let mut response = Response::new(RelayBody::Buffered(Full::new(Bytes::from(body))));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            // Upstream socket drops here; the close header seals the inbound
            // side so no follow-up request can reach the origin.
            return Ok(response);
        }

        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let _open = TunnelGuard::new(metrics);
            match on_upgrade.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if let Err(e) = client.write_all(&leftover).await {
                            error!("relaying buffered tunnel bytes failed: {}", e);
                            return;
                        }
                    }
                    match copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((up, down)) => {
                            debug!("tunnel closed: {} bytes upstream, {} bytes downstream", up, down)
                        }
                        Err(e) => debug!("tunnel terminated: {}", e),
                    }
                }
                Err(e) => error!("inbound upgrade failed: {}", e),
            }
        });

        let mut response = Response::new(RelayBody::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Drains the origin's refusal body so 403/400 negotiation failures reach
    /// the client. Bounded by the handshake timeout; a slow origin yields the
    /// partial body rather than stalling teardown.
    async fn read_handshake_body(
        &self,
        upstream: &mut Box<dyn TunnelStream>,
        mut body: Vec<u8>,
        headers: &HeaderMap,
    ) -> Vec<u8> {
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());

        let drain = async {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(len) = content_length {
                    if body.len() >= len {
                        break;
                    }
                }
                match upstream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("origin closed refusal body early: {}", e);
                        break;
                    }
                }
            }
        };

        if timeout(self.handshake_timeout, drain).await.is_err() {
            warn!("timed out draining upgrade refusal body");
        }
        body
    }
}

/// Serializes the rewritten request line and headers for the origin.
///
/// `Host` leads, the `Connection` value passes through verbatim with any
/// configured extra tokens appended, and the raw path and query are written
/// byte-identical to what the router supplied.
fn encode_request_head<B>(req: &Request<B>, extra_connection_tokens: &[String]) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    let host = req
        .headers()
        .get(HOST)
        .map(|v| v.as_bytes().to_vec())
        .or_else(|| req.uri().authority().map(|a| a.as_str().as_bytes().to_vec()));
    if let Some(host) = host {
        head.extend_from_slice(b"host: ");
        head.extend_from_slice(&host);
        head.extend_from_slice(b"\r\n");
    }

    let connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    if !connection.is_empty() {
        head.extend_from_slice(b"connection: ");
        head.extend_from_slice(connection.as_bytes());
        for token in extra_connection_tokens {
            head.extend_from_slice(b", ");
            head.extend_from_slice(token.as_bytes());
        }
        head.extend_from_slice(b"\r\n");
    }

    for (name, value) in req.headers() {
        if name == &HOST || name == &CONNECTION {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Reads from the origin until the end of the response header section,
/// returning the buffer and the offset one past the blank line.
async fn read_header_section(
    upstream: &mut Box<dyn TunnelStream>,
) -> Result<(Vec<u8>, usize), ForwardError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok((buf, pos + 4));
        }
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(ForwardError::Handshake(
                "response header section too large".into(),
            ));
        }
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ForwardError::Handshake(
                "origin closed the connection during the handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parses the origin's status line and headers, relayed verbatim.
fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HeaderMap), ForwardError> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut parsed_headers);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ForwardError::Handshake("truncated response head".into()))
        }
        Err(e) => {
            return Err(ForwardError::Handshake(format!(
                "malformed response head: {}",
                e
            )))
        }
    }

    let code = parsed
        .code
        .ok_or_else(|| ForwardError::Handshake("response head carries no status".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| ForwardError::Handshake(format!("invalid status {}: {}", code, e)))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ForwardError::Handshake(format!("bad header name {:?}: {}", h.name, e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| ForwardError::Handshake(format!("bad value for {}: {}", name, e)))?;
        headers.append(name, value);
    }

    Ok((status, headers))
}

/// Shapes a refusal response for the inbound connection: decodes a chunked
/// body, pins a definite `Content-Length`, and seals the connection.
///
/// The relabeled length must describe exactly the bytes handed to the
/// client, so a chunked body whose framing cannot be decoded is never
/// forwarded raw; it is replaced with a generic refusal notice instead.
fn finalize_refusal_headers(headers: &mut HeaderMap, body: Vec<u8>) -> Vec<u8> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    let body = if chunked {
        match decode_chunked(&body) {
            Some(decoded) => decoded,
            None => {
                warn!("origin sent a malformed chunked refusal body, substituting notice");
                b"upgrade refused by origin".to_vec()
            }
        }
    } else {
        body
    };

    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.remove(CONNECTION);
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    body
}

/// Minimal chunked-transfer decode for refusal bodies; trailers are dropped.
///
/// A body cut off mid-stream (origin stalled past the handshake deadline)
/// decodes to the prefix that did arrive; `None` means the framing itself is
/// invalid and none of the payload can be trusted.
fn decode_chunked(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            // Cut off inside a size line.
            return Some(out);
        };
        let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size_field = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_field, 16).ok()?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if rest.len() < size {
            // Cut off inside chunk data.
            out.extend_from_slice(rest);
            return Some(out);
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];
        match rest {
            [] | [b'\r'] => return Some(out),
            _ if rest.starts_with(b"\r\n") => rest = &rest[2..],
            _ => return None,
        }
    }
}
