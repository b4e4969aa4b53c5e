use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use http_body_util::Full;
use std::pin::Pin;
use std::task::{Context, Poll};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified relay response body.
///
/// Buffered responses (error pages, coalesced chunked bodies, tunnel
/// handshake replies) carry their bytes in memory; streamed responses hand
/// each upstream frame to the server as it arrives, which is what pushes
/// slowly-produced chunks onto the wire without waiting for the body to end.
pub enum RelayBody {
    Buffered(Full<Bytes>),
    Streaming(Incoming),
}

impl RelayBody {
    pub fn empty() -> Self {
        RelayBody::Buffered(Full::new(Bytes::new()))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        RelayBody::Buffered(Full::new(bytes.into()))
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut *self {
            RelayBody::Buffered(full) => Pin::new(full)
                .poll_frame(cx)
                .map_err(|e| Box::new(e) as BoxError),
            RelayBody::Streaming(incoming) => Pin::new(incoming)
                .poll_frame(cx)
                .map_err(|e| Box::new(e) as BoxError),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            RelayBody::Buffered(full) => full.is_end_stream(),
            RelayBody::Streaming(incoming) => incoming.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            RelayBody::Buffered(full) => full.size_hint(),
            RelayBody::Streaming(incoming) => incoming.size_hint(),
        }
    }
}

impl From<Full<Bytes>> for RelayBody {
    fn from(full: Full<Bytes>) -> Self {
        RelayBody::Buffered(full)
    }
}
