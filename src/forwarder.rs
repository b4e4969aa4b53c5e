use crate::body::RelayBody;
use crate::error::{DefaultErrorHandler, ErrorHandler, ForwardError};
use crate::headers::is_websocket_upgrade;
use crate::http_forward::HttpForwarder;
use crate::metrics::ForwarderMetrics;
use crate::rewrite::HeaderRewriter;
use crate::transport::{Dialer, HyperRoundTripper, RoundTripper, TcpDialer};
use crate::tunnel::TunnelForwarder;
use http::header::{HeaderName, HeaderValue, HOST};
use http::Version;
use hyper::body::Incoming;
use hyper::{Request, Response};
use log::{error, Level};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection-scoped facts the listener observed about the inbound client:
/// the remote address as reported by the transport, and whether the inbound
/// leg was TLS. Both feed the forwarded-header synthesis.
#[derive(Debug, Clone)]
pub struct RequestContext {
    remote_addr: String,
    tls: bool,
}

impl RequestContext {
    pub fn new(remote_addr: SocketAddr, tls: bool) -> Self {
        Self {
            remote_addr: remote_addr.to_string(),
            tls,
        }
    }

    /// For transports whose peer addresses are not `SocketAddr`s (or carry
    /// IPv6 zone identifiers the std type cannot represent).
    pub fn from_parts(remote_addr: impl Into<String>, tls: bool) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            tls,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn tls(&self) -> bool {
        self.tls
    }
}

/// The forwarding engine. Immutable after construction and safe to share
/// across every request task of the surrounding server.
///
/// Per request: classify (standard vs. upgrade), rewrite headers, dispatch to
/// the HTTP or tunnel relay, and surface failures through the error handler.
/// The router in front of the engine must have set an absolute upstream URI
/// on the request.
pub struct Forwarder {
    rewriter: HeaderRewriter,
    http: HttpForwarder,
    tunnel: TunnelForwarder,
    error_handler: Arc<dyn ErrorHandler>,
    log_level: Option<Level>,
    pass_host_header: bool,
    metrics: Arc<ForwarderMetrics>,
}

impl Forwarder {
    /// Engine with default collaborators: pooled hyper round-tripper, TCP/TLS
    /// dialer, untrusting rewriter, default error mapping.
    pub fn new() -> Result<Self, ForwardError> {
        Self::builder().build()
    }

    pub fn builder() -> ForwarderBuilder {
        ForwarderBuilder::default()
    }

    pub fn metrics(&self) -> Arc<ForwarderMetrics> {
        self.metrics.clone()
    }

    pub async fn serve(&self, req: Request<Incoming>, ctx: RequestContext) -> Response<RelayBody> {
        let started = Instant::now();
        self.metrics.increment_requests();

        let method = req.method().clone();
        let uri = req.uri().clone();
        let websocket = is_websocket_upgrade(req.headers());

        let response = match self.dispatch(req, &ctx, websocket).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.increment_upstream_errors();
                error!("forwarding {} {} failed: {}", method, uri, err);
                self.error_handler.handle(&err)
            }
        };

        if let Some(level) = self.log_level {
            log::log!(
                level,
                "{} {} -> {} in {:?}{}{}",
                method,
                uri,
                response.status(),
                started.elapsed(),
                if websocket { " [websocket]" } else { "" },
                if ctx.tls() { " [tls]" } else { "" },
            );
        }
        response
    }

    async fn dispatch(
        &self,
        mut req: Request<Incoming>,
        ctx: &RequestContext,
        websocket: bool,
    ) -> Result<Response<RelayBody>, ForwardError> {
        let authority = match req.uri().authority() {
            Some(authority) if req.uri().scheme().is_some() => authority.clone(),
            _ => {
                return Err(ForwardError::Uri(format!(
                    "router must supply an absolute upstream URI, got {}",
                    req.uri()
                )))
            }
        };
        let inbound_version = req.version();

        self.rewriter.rewrite(&mut req, ctx);

        if !self.pass_host_header {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }

        if websocket {
            self.metrics.increment_upgrades();
            self.tunnel.forward(req).await
        } else {
            *req.version_mut() = Version::HTTP_11;
            self.http.forward(req, inbound_version).await
        }
    }
}

/// Configuration for a [`Forwarder`], populated before construction.
pub struct ForwarderBuilder {
    rewriter: HeaderRewriter,
    round_tripper: Option<Arc<dyn RoundTripper>>,
    dialer: Option<Arc<dyn Dialer>>,
    error_handler: Arc<dyn ErrorHandler>,
    log_level: Option<Level>,
    flush_interval: Option<Duration>,
    websocket_connection_headers: Vec<String>,
    pass_host_header: bool,
    dial_timeout: Duration,
    response_header_timeout: Option<Duration>,
}

impl Default for ForwarderBuilder {
    fn default() -> Self {
        Self {
            rewriter: HeaderRewriter::default(),
            round_tripper: None,
            dialer: None,
            error_handler: Arc::new(DefaultErrorHandler),
            log_level: None,
            flush_interval: None,
            websocket_connection_headers: Vec::new(),
            pass_host_header: false,
            dial_timeout: Duration::from_secs(30),
            response_header_timeout: None,
        }
    }
}

impl ForwarderBuilder {
    /// Replaces the default header rewriter.
    pub fn rewriter(mut self, rewriter: HeaderRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Supplies the upstream HTTP client capability.
    pub fn round_tripper(mut self, round_tripper: impl RoundTripper + 'static) -> Self {
        self.round_tripper = Some(Arc::new(round_tripper));
        self
    }

    /// Supplies the raw-connection capability used by tunnel mode.
    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Overrides the default error-to-status mapping.
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Emits a per-request outcome line at `level` through the `log` facade.
    pub fn logger(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Streams response bodies frame-at-a-time so slowly-pushed chunks reach
    /// the client no later than `interval` after the upstream produced them.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Extra tokens appended to the outbound `Connection` header on upgrade
    /// handshakes.
    pub fn websocket_connection_header<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.websocket_connection_headers
            .extend(tokens.into_iter().map(Into::into));
        self
    }

    /// When true the inbound `Host` header is preserved; otherwise it is
    /// overwritten with the upstream authority.
    pub fn pass_host_header(mut self, pass: bool) -> Self {
        self.pass_host_header = pass;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Deadline on the wait for upstream response headers in HTTP mode,
    /// enforced by the default round-tripper.
    pub fn response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = Some(timeout);
        self
    }

    /// Fails fast on invalid configuration rather than at serve time.
    pub fn build(self) -> Result<Forwarder, ForwardError> {
        if let Some(interval) = self.flush_interval {
            if interval.is_zero() {
                return Err(ForwardError::Config(
                    "flush interval must be non-zero".into(),
                ));
            }
        }
        if self.dial_timeout.is_zero() {
            return Err(ForwardError::Config("dial timeout must be non-zero".into()));
        }
        if !self.rewriter.hostname.is_empty()
            && HeaderValue::from_str(&self.rewriter.hostname).is_err()
        {
            return Err(ForwardError::Config(format!(
                "hostname {:?} is not a valid header value",
                self.rewriter.hostname
            )));
        }
        for token in &self.websocket_connection_headers {
            if HeaderName::from_bytes(token.as_bytes()).is_err() {
                return Err(ForwardError::Config(format!(
                    "websocket connection header {:?} is not a valid header name",
                    token
                )));
            }
        }

        let round_tripper = self.round_tripper.unwrap_or_else(|| {
            Arc::new(HyperRoundTripper::new(
                self.dial_timeout,
                self.response_header_timeout,
            ))
        });
        let dialer = self
            .dialer
            .unwrap_or_else(|| Arc::new(TcpDialer::new(self.dial_timeout)));
        let metrics = Arc::new(ForwarderMetrics::new());

        Ok(Forwarder {
            rewriter: self.rewriter,
            http: HttpForwarder::new(round_tripper, self.flush_interval),
            tunnel: TunnelForwarder::new(
                dialer,
                self.websocket_connection_headers,
                self.dial_timeout,
                metrics.clone(),
            ),
            error_handler: self.error_handler,
            log_level: self.log_level,
            pass_host_header: self.pass_host_header,
            metrics,
        })
    }
}
