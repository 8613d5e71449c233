//! Forwarding of absolute-form `http://` requests to their origin.
//!
//! Every request gets a fresh origin connection which is dropped with the
//! response. Hop-by-hop headers are stripped both ways and the client address
//! is appended to `X-Forwarded-For`.

use std::{error::Error as StdError, io, net::IpAddr};

use http::{
    header, uri::PathAndQuery, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version,
};
use http_body_util::BodyExt;
use hyper::{body::Body, client::conn::http1};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{debug, error};

use super::{dial, empty_body, forbidden, request_host, Proxy, ProxyBody, RequestContext};

/// Headers that only concern a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request target {0} has no host")]
    MissingHost(Uri),
    #[error(transparent)]
    Dial(io::Error),
    #[error("HTTP exchange with the origin failed: {0}")]
    Exchange(#[from] hyper::Error),
}

pub async fn forward<B>(proxy: &Proxy, ctx: &RequestContext, mut req: Request<B>) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let host = request_host(&req);
    debug!(host, "Got HTTP request");
    if proxy.policy().is_forbidden(&host) {
        debug!(host, "Request is blocked");
        return forbidden();
    }
    debug!(client = %ctx.real_ip(req.headers()), "HTTP request IP");

    let result = match prepare_request(&mut req, ctx.client_address.ip()) {
        Ok(authority) => send_to_origin(proxy, &authority, req).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(resp) => resp,
        Err(err) => {
            error!(host, "http: proxy error: {err}");
            bad_gateway()
        }
    }
}

/// Status only, the body stays empty.
fn bad_gateway() -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

/// Turns a proxy request into the request the origin expects and returns the
/// `host:port` to connect to.
fn prepare_request<B>(req: &mut Request<B>, client: IpAddr) -> Result<String, ForwardError> {
    let uri = req.uri();
    let host = uri
        .host()
        .ok_or_else(|| ForwardError::MissingHost(uri.clone()))?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = format!("{host}:{port}");
    let host_header = match uri.authority() {
        Some(authority) => HeaderValue::from_str(authority.as_str()).ok(),
        None => None,
    };

    // The origin gets an origin-form target.
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    remove_hop_by_hop_headers(headers);

    // An absent User-Agent would otherwise be filled in by the HTTP client.
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
    }
    if !headers.contains_key(header::HOST) {
        if let Some(value) = host_header {
            headers.insert(header::HOST, value);
        }
    }
    append_forwarded_for(headers, client);

    Ok(authority)
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop as well.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {client}", prior.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

async fn send_to_origin<B>(
    proxy: &Proxy,
    authority: &str,
    req: Request<B>,
) -> Result<Response<ProxyBody>, ForwardError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let stream = dial(authority, proxy.config().dest_dial_timeout)
        .await
        .map_err(ForwardError::Dial)?;

    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;
    let origin = authority.to_owned();
    proxy.tasks().spawn(async move {
        if let Err(err) = conn.await {
            debug!(origin, "Origin connection failed: {err}");
        }
    });

    let mut resp = sender.send_request(req).await?;
    remove_hop_by_hop_headers(resp.headers_mut());
    Ok(resp.map(|body| body.boxed()))
}
