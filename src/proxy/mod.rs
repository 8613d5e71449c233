use std::{convert::Infallible, error::Error as StdError, io, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{header, uri::Scheme, HeaderValue, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{body::Body, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn, Instrument};

use crate::{acl::AccessPolicy, config::ProxyConfig, state::Statistics};

mod context;
mod deadline;
mod hijack;
mod http_connect;
mod http_forward;
mod protocol_detect;
mod relay;
pub mod tls;

#[cfg(test)]
mod tests;

pub use context::RequestContext;
use protocol_detect::detect_tls;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("While detecting the header for TLS: {0}")]
    Detect(#[source] io::Error),
    #[error("Client sent nothing before the header read timeout")]
    DetectTimeout,
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("HTTP connection error: {0}")]
    Http(#[from] hyper::Error),
}

/// Entry point of every request: classifies it and hands it to the plaintext
/// forwarder or to the tunnel establisher.
pub struct Proxy {
    config: ProxyConfig,
    policy: AccessPolicy,
    stats: Arc<Statistics>,
    tasks: TaskTracker,
}

impl Proxy {
    pub fn new(config: ProxyConfig, stats: Arc<Statistics>) -> Self {
        Self {
            policy: AccessPolicy::new(config.avoid.clone()),
            config,
            stats,
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Connections and tunnels still running.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub async fn dispatch<B>(&self, ctx: &RequestContext, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        info!(
            host = %request_host(&req),
            client = %ctx.real_ip(req.headers()),
            tls = ctx.tls,
            "Incoming request"
        );

        // Plain HTTP can be rewritten and replayed. Anything else has to go
        // through a CONNECT tunnel since TLS records cannot be modified.
        if req.uri().scheme() == Some(&Scheme::HTTP) {
            http_forward::forward(self, ctx, req).await
        } else {
            http_connect::establish_tunnel(self, req).await
        }
    }

    /// Stops tracking new work and waits up to `grace` for running
    /// connections and tunnels. Whatever is left afterwards is abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.tasks.close();
        debug!(pending = self.tasks.len(), "waiting for connections and tunnels");
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => debug!("all connections closed cleanly"),
            Err(_) => warn!(
                remaining = self.tasks.len(),
                "not all connections closed in time, abandoning them"
            ),
        }
    }
}

/// Host the client asked for: the request target authority, or the `Host`
/// header for origin-form targets.
pub(crate) fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.as_str().to_owned();
    }
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Opens a TCP connection to `authority`. A zero timeout waits for the
/// operating system to give up.
pub(crate) async fn dial(authority: &str, timeout: Duration) -> io::Result<TcpStream> {
    let connect = TcpStream::connect(authority);
    let result = if timeout.is_zero() {
        connect.await
    } else {
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")),
        }
    };
    result.map_err(|err| io::Error::new(err.kind(), format!("dial tcp {authority}: {err}")))
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain text error reply, newline terminated.
pub(crate) fn text_response(status: StatusCode, message: impl AsRef<str>) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(format!("{}\n", message.as_ref())));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    resp
}

/// Reply for hosts matching the avoid pattern. The "Forbidden" text goes out
/// with a 405 status code; clients rely on this exact pairing.
pub(crate) fn forbidden() -> Response<ProxyBody> {
    text_response(
        StatusCode::METHOD_NOT_ALLOWED,
        StatusCode::FORBIDDEN.canonical_reason().unwrap_or("Forbidden"),
    )
}

pub(crate) fn tunnel_established() -> Response<ProxyBody> {
    Response::new(empty_body())
}

/// Serves HTTP/1.1 on one client connection until it closes or `shutdown`
/// fires, in which case the connection finishes its current request first.
pub async fn serve_connection<S>(
    proxy: Arc<Proxy>,
    ctx: RequestContext,
    stream: S,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let mut builder = http1::Builder::new();
    builder.preserve_header_case(true).title_case_headers(true);
    if !header_read_timeout.is_zero() {
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout);
    }

    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(proxy.dispatch(&ctx, req).await) }
    });

    let conn = builder.serve_connection(io, service).with_upgrades();
    tokio::pin!(conn);

    let finished = tokio::select! {
        res = conn.as_mut() => Some(res),
        _ = shutdown.cancelled() => None,
    };
    match finished {
        Some(res) => res?,
        None => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }

    Ok(())
}

async fn handle_socket(
    proxy: Arc<Proxy>,
    ctx: RequestContext,
    socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let Some(acceptor) = acceptor else {
        return serve_connection(proxy, ctx, socket, header_read_timeout, shutdown).await;
    };

    let is_tls = if header_read_timeout.is_zero() {
        detect_tls(&socket).await
    } else {
        tokio::time::timeout(header_read_timeout, detect_tls(&socket))
            .await
            .map_err(|_| ProxyError::DetectTimeout)?
    }
    .map_err(ProxyError::Detect)?;

    if is_tls {
        let stream = acceptor
            .accept(socket)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        let ctx = RequestContext::new(ctx.client_address, true);
        serve_connection(proxy, ctx, stream, header_read_timeout, shutdown).await
    } else {
        serve_connection(proxy, ctx, socket, header_read_timeout, shutdown).await
    }
}

/// Accepts clients until `shutdown` fires. Each connection runs in its own
/// task tracked by the proxy.
pub async fn start(
    proxy: Arc<Proxy>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Failed to accept a connection: {err}");
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let conn_proxy = proxy.clone();
        let acceptor = tls_acceptor.clone();
        let shutdown = shutdown.clone();
        let ctx = RequestContext::new(addr, false);

        proxy.tasks().spawn(
            async move {
                if let Err(e) =
                    handle_socket(conn_proxy, ctx, socket, acceptor, header_read_timeout, shutdown).await
                {
                    debug!("Proxy error from {addr}: {e}");
                }
            }
            .instrument(tracing::debug_span!("conn", client = %addr)),
        );
    }

    info!("Stopped accepting connections");
    Ok(())
}
