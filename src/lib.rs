//! Reverse-proxy forwarding engine.
//!
//! Given an inbound request that an outer dispatcher routed here (with an
//! absolute upstream URI already set), the engine classifies it as standard
//! HTTP or a WebSocket upgrade, rewrites headers (hop-by-hop removal,
//! `X-Forwarded-*` synthesis under a trust policy), and relays it: buffered
//! or streamed over a pooled round-tripper for HTTP, or as a hijacked
//! full-duplex byte tunnel for upgrades.
//!
//! ```no_run
//! use windgate::{Forwarder, HeaderRewriter, RequestContext};
//!
//! # fn demo() -> Result<(), windgate::ForwardError> {
//! let forwarder = Forwarder::builder()
//!     .rewriter(HeaderRewriter::new(false, "edge-1"))
//!     .logger(log::Level::Info)
//!     .build()?;
//! # let _ = forwarder;
//! # Ok(())
//! # }
//! ```
//!
//! Listener management, TLS termination, routing, and authentication stay
//! with the embedding server; it hands each request to [`Forwarder::serve`]
//! along with a [`RequestContext`] describing the inbound connection.

pub mod body;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod metrics;
pub mod rewrite;
pub mod transport;

mod http_forward;
mod tunnel;

pub use body::RelayBody;
pub use config::ForwarderConfig;
pub use error::{DefaultErrorHandler, ErrorHandler, ForwardError};
pub use forwarder::{Forwarder, ForwarderBuilder, RequestContext};
pub use headers::is_websocket_upgrade;
pub use metrics::ForwarderMetrics;
pub use rewrite::HeaderRewriter;
pub use transport::{Dialer, HyperRoundTripper, RoundTripper, TcpDialer, TunnelStream};
