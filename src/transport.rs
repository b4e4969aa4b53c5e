use crate::error::ForwardError;
use async_trait::async_trait;
use http::Uri;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::debug;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Upstream HTTP exchange capability: send one request, receive one response.
///
/// The implementation owns connection pooling and transport timeouts; the
/// engine treats it opaquely so tests can substitute fakes.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>, ForwardError>;
}

/// Raw byte stream to an upstream origin, used by the tunnel forwarder.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Capability to open a raw connection to the origin named by a request URI.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, uri: &Uri) -> Result<Box<dyn TunnelStream>, ForwardError>;
}

/// Default round-tripper: a pooled hyper client reaching `http://` upstreams
/// over plain TCP and `https://` upstreams through TLS, with an optional
/// deadline on the wait for upstream response headers.
pub struct HyperRoundTripper {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    response_header_timeout: Option<Duration>,
}

impl HyperRoundTripper {
    pub fn new(connect_timeout: Duration, response_header_timeout: Option<Duration>) -> Self {
        Self::with_pool(
            connect_timeout,
            response_header_timeout,
            10,
            Duration::from_secs(90),
        )
    }

    /// `pool_max_idle_per_host == 0` disables connection reuse entirely.
    pub fn with_pool(
        connect_timeout: Duration,
        response_header_timeout: Option<Duration>,
        pool_max_idle_per_host: usize,
        pool_idle_timeout: Duration,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        // The TLS layer handles https URIs; the inner connector must let
        // them through.
        connector.enforce_http(false);
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_client_config())
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let mut builder = Client::builder(TokioExecutor::new());
        if pool_max_idle_per_host == 0 {
            builder.pool_max_idle_per_host(0);
        } else {
            builder.pool_max_idle_per_host(pool_max_idle_per_host);
            builder.pool_idle_timeout(pool_idle_timeout);
            builder.pool_timer(TokioTimer::new());
        }

        Self {
            client: builder.build(connector),
            response_header_timeout,
        }
    }
}

#[async_trait]
impl RoundTripper for HyperRoundTripper {
    async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>, ForwardError> {
        let pending = self.client.request(req);
        let result = match self.response_header_timeout {
            Some(deadline) => timeout(deadline, pending)
                .await
                .map_err(|_| ForwardError::UpstreamTimeout)?,
            None => pending.await,
        };
        result.map_err(|e| ForwardError::Upstream(e.to_string()))
    }
}

/// Default dialer: TCP with a connect deadline, wrapped in TLS for
/// `wss`/`https` origins.
pub struct TcpDialer {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: TlsConnector::from(Arc::new(tls_client_config())),
        }
    }
}

/// Client TLS configuration shared by the round-tripper and the dialer.
fn tls_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, uri: &Uri) -> Result<Box<dyn TunnelStream>, ForwardError> {
        let (host, port, tls) = target_addr(uri)?;
        debug!("dialing {}:{} (tls={})", host, port, tls);

        let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ForwardError::DialTimeout)??;
        let _ = stream.set_nodelay(true);

        if tls {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| ForwardError::Tls(e.to_string()))?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| ForwardError::Tls(e.to_string()))?;
            Ok(Box::new(stream))
        } else {
            Ok(Box::new(stream))
        }
    }
}

/// Splits a request URI into connectable host, port, and TLS flag, inferring
/// the port from the scheme when absent.
fn target_addr(uri: &Uri) -> Result<(String, u16, bool), ForwardError> {
    let authority = uri
        .authority()
        .ok_or_else(|| ForwardError::Uri(format!("no authority in {}", uri)))?;

    let tls = matches!(uri.scheme_str(), Some("wss") | Some("https"));
    let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    Ok((host, port, tls))
}
