use crate::forwarder::{Forwarder, ForwarderBuilder};
use crate::rewrite::HeaderRewriter;
use crate::transport::HyperRoundTripper;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_dial_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

/// Declarative engine configuration, for embedders that construct forwarders
/// from a config file instead of wiring the builder directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Keep `X-Forwarded-*` values supplied by the previous hop.
    #[serde(default)]
    pub trust_forward_header: bool,

    /// Value written to `X-Forwarded-Server`; empty skips the header.
    #[serde(default)]
    pub hostname: String,

    /// Preserve the inbound `Host` header instead of the upstream authority.
    #[serde(default)]
    pub pass_host_header: bool,

    /// Enables frame-at-a-time response streaming when set.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Deadline on the wait for upstream response headers.
    #[serde(default)]
    pub response_header_timeout_secs: Option<u64>,

    /// Extra tokens for the outbound `Connection` header on upgrades.
    #[serde(default)]
    pub websocket_connection_headers: Vec<String>,

    /// Zero disables upstream connection reuse.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            trust_forward_header: false,
            hostname: String::new(),
            pass_host_header: false,
            flush_interval_ms: None,
            dial_timeout_secs: default_dial_timeout_secs(),
            response_header_timeout_secs: None,
            websocket_connection_headers: Vec::new(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

impl ForwarderConfig {
    /// Builder pre-populated from this configuration; collaborators such as
    /// a custom error handler can still be attached before `build()`.
    pub fn builder(&self) -> ForwarderBuilder {
        let dial_timeout = Duration::from_secs(self.dial_timeout_secs);
        let response_header_timeout = self
            .response_header_timeout_secs
            .map(Duration::from_secs);

        let mut builder = Forwarder::builder()
            .rewriter(HeaderRewriter::new(
                self.trust_forward_header,
                self.hostname.clone(),
            ))
            .pass_host_header(self.pass_host_header)
            .dial_timeout(dial_timeout)
            .round_tripper(HyperRoundTripper::with_pool(
                dial_timeout,
                response_header_timeout,
                self.pool_max_idle_per_host,
                Duration::from_secs(self.pool_idle_timeout_secs),
            ));

        if let Some(ms) = self.flush_interval_ms {
            builder = builder.flush_interval(Duration::from_millis(ms));
        }
        if let Some(timeout) = response_header_timeout {
            builder = builder.response_header_timeout(timeout);
        }
        if !self.websocket_connection_headers.is_empty() {
            builder =
                builder.websocket_connection_header(self.websocket_connection_headers.clone());
        }
        builder
    }
}
