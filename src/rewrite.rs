use crate::forwarder::RequestContext;
use crate::headers::{
    canonical_ip, is_websocket_upgrade, FORWARDED_HEADERS, HOP_HEADERS, X_FORWARDED_FOR,
    X_FORWARDED_HOST, X_FORWARDED_PROTO, X_FORWARDED_SERVER, X_REAL_IP,
};
use http::header::{HeaderValue, HOST};
use http::Request;
use log::debug;

/// Rewrites an outbound request's headers before it is relayed upstream.
///
/// Stateless across calls; one instance serves every request of a
/// [`Forwarder`](crate::forwarder::Forwarder).
#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    /// Whether `X-Forwarded-*` values supplied by the previous hop are kept.
    /// When false they are purged and re-synthesized from observed state.
    pub trust_forward_header: bool,
    /// Value written to `X-Forwarded-Server`. Skipped when empty.
    pub hostname: String,
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self {
            trust_forward_header: false,
            hostname: String::new(),
        }
    }
}

impl HeaderRewriter {
    pub fn new(trust_forward_header: bool, hostname: impl Into<String>) -> Self {
        Self {
            trust_forward_header,
            hostname: hostname.into(),
        }
    }

    /// Applies forwarded-header synthesis and the hop-by-hop discipline.
    ///
    /// On upgrade requests `Connection` and `Upgrade` pass through verbatim
    /// and the remaining hop headers are left in place, since they carry the
    /// handshake the origin needs to see.
    pub fn rewrite<B>(&self, req: &mut Request<B>, ctx: &RequestContext) {
        let websocket = is_websocket_upgrade(req.headers());
        let inbound_host = req.headers().get(HOST).cloned();
        let headers = req.headers_mut();

        if !self.trust_forward_header {
            for name in FORWARDED_HEADERS.iter() {
                if headers.remove(name).is_some() {
                    debug!("dropped untrusted {} from previous hop", name);
                }
            }
        }

        let client_ip = canonical_ip(ctx.remote_addr());
        if !client_ip.is_empty() {
            let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
                _ => client_ip.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(&X_FORWARDED_FOR, value);
            }

            if !headers.contains_key(&X_REAL_IP) {
                if let Ok(value) = HeaderValue::from_str(&client_ip) {
                    headers.insert(&X_REAL_IP, value);
                }
            }
        }

        if !headers.contains_key(&X_FORWARDED_PROTO) {
            let proto = match (websocket, ctx.tls()) {
                (true, true) => "wss",
                (true, false) => "ws",
                (false, true) => "https",
                (false, false) => "http",
            };
            headers.insert(&X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        }

        if !headers.contains_key(&X_FORWARDED_HOST) {
            if let Some(host) = inbound_host {
                headers.insert(&X_FORWARDED_HOST, host);
            }
        }

        if !self.hostname.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.hostname) {
                headers.insert(&X_FORWARDED_SERVER, value);
            }
        }

        if !websocket {
            for name in HOP_HEADERS.iter() {
                headers.remove(name);
            }
        }
    }
}
