use crate::body::RelayBody;
use crate::error::ForwardError;
use crate::headers::HOP_HEADERS;
use crate::transport::RoundTripper;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Version;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Relays a rewritten request over the round-tripper and shapes the response
/// for the inbound connection.
pub(crate) struct HttpForwarder {
    round_tripper: Arc<dyn RoundTripper>,
    flush_interval: Option<Duration>,
}

impl HttpForwarder {
    pub(crate) fn new(round_tripper: Arc<dyn RoundTripper>, flush_interval: Option<Duration>) -> Self {
        Self {
            round_tripper,
            flush_interval,
        }
    }

    /// Streaming rules:
    /// - a configured flush interval selects the frame-at-a-time body, so
    ///   slowly-pushed chunks reach the client as they arrive;
    /// - a chunked upstream response answered to an HTTP/1.1 client with no
    ///   flush interval is coalesced into a definite `Content-Length` body;
    /// - everything else streams through unchanged.
    pub(crate) async fn forward(
        &self,
        req: Request<Incoming>,
        inbound_version: Version,
    ) -> Result<Response<RelayBody>, ForwardError> {
        let response = self.round_tripper.round_trip(req).await?;
        let (mut parts, body) = response.into_parts();

        let chunked = is_chunked(&parts.headers);
        strip_hop_headers(&mut parts.headers);

        if self.flush_interval.is_some() {
            return Ok(Response::from_parts(parts, RelayBody::Streaming(body)));
        }

        if chunked && inbound_version == Version::HTTP_11 {
            let collected = body
                .collect()
                .await
                .map_err(|e| ForwardError::Upstream(format!("reading chunked body: {}", e)))?;
            let bytes = collected.to_bytes();
            debug!("coalesced chunked response into {} bytes", bytes.len());

            parts
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            return Ok(Response::from_parts(
                parts,
                RelayBody::Buffered(Full::new(bytes)),
            ));
        }

        Ok(Response::from_parts(parts, RelayBody::Streaming(body)))
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("chunked"))
}

/// Hop-by-hop response headers never cross the proxy; the inbound connection
/// negotiates its own framing and keep-alive.
fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS.iter() {
        headers.remove(name);
    }
}
