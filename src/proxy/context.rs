use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

/// Per connection facts handed to every request served on it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_address: SocketAddr,
    /// Whether the client reached us through the TLS listener.
    pub tls: bool,
}

impl RequestContext {
    pub fn new(client_address: SocketAddr, tls: bool) -> Self {
        Self {
            client_address,
            tls,
        }
    }

    /// Address of the client as reported by the proxies in front of us, the
    /// socket address when there are none. Only meant for logging.
    pub fn real_ip(&self, headers: &HeaderMap) -> String {
        real_ip(headers, self.client_address.ip())
    }
}

/// First public address in `X-Forwarded-For`, then `X-Real-Ip`, then `peer`.
fn real_ip(headers: &HeaderMap, peer: IpAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header("x-forwarded-for") {
        let public = forwarded
            .split(',')
            .filter_map(|addr| addr.trim().parse::<IpAddr>().ok())
            .find(|addr| !is_private(addr));
        if let Some(addr) = public {
            return addr.to_string();
        }
    }
    if let Some(real) = header("x-real-ip") {
        return real.to_owned();
    }
    peer.to_string()
}

fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        // fc00::/7 is the unique local range.
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
