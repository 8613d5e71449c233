//! CONNECT tunnels.
//!
//! References:
//! - https://docs.rs/hyper/latest/hyper/upgrade/index.html
//! - https://github.com/hyperium/hyper/blob/master/examples/http_proxy.rs

use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::{
    deadline::Deadlines,
    dial, forbidden,
    hijack::Hijack,
    relay::{relay, TransferResult},
    request_host, text_response, tunnel_established, Proxy, ProxyBody,
};

/// Answers a CONNECT request. On success the client gets an empty 200 and the
/// connection is handed over to two relay tasks, one per direction.
pub async fn establish_tunnel<B>(proxy: &Proxy, mut req: Request<B>) -> Response<ProxyBody> {
    let host = request_host(&req);
    if proxy.policy().is_forbidden(&host) {
        info!("Request to {host} is blocked");
        return forbidden();
    }

    if req.method() != Method::CONNECT {
        debug!(
            "Unsupported HTTP method `{}` received for {host}",
            req.method()
        );
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            StatusCode::METHOD_NOT_ALLOWED
                .canonical_reason()
                .unwrap_or("Method Not Allowed"),
        );
    }

    let config = proxy.config();
    let destination = match dial(&host, config.dest_dial_timeout).await {
        Ok(destination) => destination,
        Err(err) => {
            error!("Connecting to {host} failed: {err}");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string());
        }
    };

    // Checked before answering: once the 200 is out there is no way to report
    // a failure to the client anymore.
    let Some(hijack) = Hijack::take(&mut req) else {
        error!("Connection for {host} cannot be hijacked");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
    };

    let timeouts = TunnelTimeouts {
        client_read: config.client_read_timeout,
        client_write: config.client_write_timeout,
        dest_read: config.dest_read_timeout,
        dest_write: config.dest_write_timeout,
    };
    let stats = proxy.stats().clone();
    let tasks = proxy.tasks().clone();
    let span = tracing::debug_span!("tunnel", host = %host);

    proxy.tasks().spawn(
        async move {
            let client = match hijack.into_stream().await {
                Ok(client) => client,
                Err(err) => {
                    error!("Taking over the client connection failed: {err}");
                    return;
                }
            };

            let now = Instant::now();
            let (client_read, client_write) = tokio::io::split(client);
            let (dest_read, dest_write) = destination.into_split();
            let client_read = with_deadlines(client_read, now, timeouts.client_read, Duration::ZERO);
            let client_write = with_deadlines(client_write, now, Duration::ZERO, timeouts.client_write);
            let dest_read = with_deadlines(dest_read, now, timeouts.dest_read, Duration::ZERO);
            let dest_write = with_deadlines(dest_write, now, Duration::ZERO, timeouts.dest_write);

            let guard = stats.open_tunnel();
            let close = CancellationToken::new();
            debug!("Tunnel established");

            let downstream = {
                let stats = stats.clone();
                let guard = guard.clone();
                let close = close.clone();
                async move {
                    let result = relay(client_write, dest_read, close).await;
                    stats.record_transfer(result.bytes);
                    log_transfer("destination to client", &result);
                    drop(guard);
                }
            };
            let upstream = async move {
                let result = relay(dest_write, client_read, close).await;
                stats.record_transfer(result.bytes);
                log_transfer("client to destination", &result);
                drop(guard);
            };

            tasks.spawn(downstream.in_current_span());
            tasks.spawn(upstream.in_current_span());
        }
        .instrument(span),
    );

    tunnel_established()
}

#[derive(Debug, Clone, Copy)]
struct TunnelTimeouts {
    client_read: Duration,
    client_write: Duration,
    dest_read: Duration,
    dest_write: Duration,
}

fn with_deadlines<S>(stream: S, now: Instant, read: Duration, write: Duration) -> Deadlines<S> {
    let mut stream = Deadlines::new(stream);
    if let Err(err) = stream.set_read_deadline(now, read) {
        error!("Setting the read deadline failed: {err}");
    }
    if let Err(err) = stream.set_write_deadline(now, write) {
        error!("Setting the write deadline failed: {err}");
    }
    stream
}

fn log_transfer(direction: &str, result: &TransferResult) {
    match &result.error {
        None => debug!(bytes = result.bytes, "{direction} finished"),
        Some(err) => debug!(bytes = result.bytes, "{direction} stopped: {err}"),
    }
}
