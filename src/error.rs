use crate::body::RelayBody;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Timed out waiting for upstream response headers")]
    UpstreamTimeout,

    #[error("Timed out dialing upstream")]
    DialTimeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Upgrade handshake failed: {0}")]
    Handshake(String),

    #[error("Inbound connection cannot be hijacked: {0}")]
    Hijack(String),

    #[error("Invalid upstream URI: {0}")]
    Uri(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Maps transport errors to the HTTP status surfaced to the client.
///
/// Only consulted while the response headers are still buffered; once bytes
/// have been flushed, failures close the connection without a status.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: &ForwardError) -> Response<RelayBody>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&ForwardError) -> Response<RelayBody> + Send + Sync,
{
    fn handle(&self, err: &ForwardError) -> Response<RelayBody> {
        self(err)
    }
}

/// Default error-to-status mapping: slow upstream headers become
/// `504 Gateway Timeout`, a non-hijackable inbound connection becomes
/// `500 Internal Server Error`, and every other transport failure is
/// `502 Bad Gateway`.
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, err: &ForwardError) -> Response<RelayBody> {
        let status = match err {
            ForwardError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Hijack(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        status_response(status)
    }
}

/// Canned plain-text response for an HTTP status.
pub fn status_response(status: StatusCode) -> Response<RelayBody> {
    let text = status.canonical_reason().unwrap_or("");
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(RelayBody::Buffered(Full::new(Bytes::from(text))))
        .unwrap()
}
