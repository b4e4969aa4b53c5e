use http::header::{HeaderMap, HeaderName, CONNECTION, UPGRADE};

// Custom header names for X-Forwarded-* headers
pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub static X_FORWARDED_SERVER: HeaderName = HeaderName::from_static("x-forwarded-server");
pub static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Hop-by-hop headers, scoped to a single transport connection. These are
/// removed from forwarded requests and responses unless the request is a
/// protocol upgrade, where `Connection` and `Upgrade` carry the handshake.
pub static HOP_HEADERS: [HeaderName; 8] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailers"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

/// The `X-Forwarded-*` family describing the original client. Purged from
/// inbound requests when the rewriter does not trust the previous hop.
pub static FORWARDED_HEADERS: [HeaderName; 5] = [
    HeaderName::from_static("x-forwarded-for"),
    HeaderName::from_static("x-forwarded-host"),
    HeaderName::from_static("x-forwarded-proto"),
    HeaderName::from_static("x-forwarded-server"),
    HeaderName::from_static("x-real-ip"),
];

/// Determines if an HTTP request is attempting to upgrade to a WebSocket
/// connection: `Connection` must carry an `upgrade` token and `Upgrade` must
/// name the websocket protocol.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let websocket = headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("websocket"));

    wants_upgrade && websocket
}

/// Canonicalizes an observed remote address into a bare IP literal.
///
/// Strips an optional `:port` suffix (bracketed IPv6 and single-colon forms;
/// a bare multi-colon IPv6 literal carries no port), removes surrounding
/// brackets, and drops an IPv6 zone identifier from the first `%` onward.
/// Empty input stays empty.
pub fn canonical_ip(remote_addr: &str) -> String {
    if remote_addr.is_empty() {
        return String::new();
    }

    let host = if let Some(rest) = remote_addr.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if remote_addr.bytes().filter(|&b| b == b':').count() == 1 {
        // ipv4:port or host:port
        remote_addr.split(':').next().unwrap_or(remote_addr)
    } else {
        remote_addr
    };

    // Zone identifiers are meaningless outside the originating host.
    host.split('%').next().unwrap_or(host).to_string()
}
