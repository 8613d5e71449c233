use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{start, Proxy, RequestContext};
use crate::{config::ProxyConfig, state::Statistics};

// -- Test helpers --

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestProxy {
    addr: SocketAddr,
    proxy: Arc<Proxy>,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Config with every deadline disabled, so only the tested one applies.
fn config_without_deadlines() -> ProxyConfig {
    ProxyConfig {
        avoid: String::new(),
        dest_dial_timeout: Duration::from_secs(5),
        dest_read_timeout: Duration::ZERO,
        dest_write_timeout: Duration::ZERO,
        client_read_timeout: Duration::ZERO,
        client_write_timeout: Duration::ZERO,
    }
}

async fn spawn_proxy(config: ProxyConfig) -> Result<TestProxy> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let proxy = Arc::new(Proxy::new(config, Statistics::new()));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(start(
        proxy.clone(),
        listener,
        None,
        HEADER_READ_TIMEOUT,
        shutdown.clone(),
    ));
    Ok(TestProxy {
        addr,
        proxy,
        shutdown,
        task,
    })
}

/// TCP server writing back everything it receives.
async fn spawn_echo_server() -> Result<SocketAddr> {
    Ok(spawn_counting_echo_server().await?.0)
}

/// Echo server that also counts the connections it accepted.
async fn spawn_counting_echo_server() -> Result<(SocketAddr, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, accepted))
}

/// Address nothing listens on.
async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Reads a response head byte by byte so that tunneled bytes stay unread.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<ResponseHead> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            bail!("connection closed inside the response head");
        }
        buf.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response.parse(&buf)?;
    Ok(ResponseHead {
        status: response.code.context("missing status code")?,
        headers: response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_owned(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    })
}

/// Reads a `Content-Length` delimited body. No length means no body.
async fn read_body<S: AsyncRead + Unpin>(stream: &mut S, head: &ResponseHead) -> Result<String> {
    let len: usize = match head.header("content-length") {
        Some(len) => len.parse()?,
        None => return Ok(String::new()),
    };
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(String::from_utf8(body)?)
}

async fn send_connect(proxy: SocketAddr, target: &str) -> Result<(TcpStream, ResponseHead)> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;
    let head = read_response_head(&mut stream).await?;
    Ok((stream, head))
}

async fn send_raw(proxy: SocketAddr, request: &str) -> Result<(ResponseHead, String)> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(request.as_bytes()).await?;
    let head = read_response_head(&mut stream).await?;
    let body = read_body(&mut stream, &head).await?;
    Ok((head, body))
}

async fn wait_for_closed_tunnels(stats: &Statistics) -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while stats.open_tunnels() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("tunnels did not close in time")
}

// -- CONNECT tunnels --

#[tokio::test]
async fn test_tunnel_relays_both_directions() -> Result<()> {
    let (echo, accepted) = spawn_counting_echo_server().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let (mut client, head) = send_connect(proxy.addr, &echo.to_string()).await?;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("content-length"), None);

    client.write_all(b"ping over the tunnel").await?;
    let mut buf = [0u8; 20];
    client.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping over the tunnel");

    drop(client);
    wait_for_closed_tunnels(proxy.proxy.stats()).await?;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "destination dialed more than once");
    assert_eq!(proxy.proxy.stats().tunnels_established(), 1);
    assert_eq!(proxy.proxy.stats().bytes_relayed(), 40);
    Ok(())
}

#[tokio::test]
async fn test_destination_closing_ends_the_tunnel() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let destination = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(b"bye").await;
        }
    });
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let (mut client, head) = send_connect(proxy.addr, &destination.to_string()).await?;
    assert_eq!(head.status, 200);

    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut received)).await??;
    assert_eq!(received, b"bye");

    wait_for_closed_tunnels(proxy.proxy.stats()).await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_tunnels_are_independent() -> Result<()> {
    const TUNNELS: usize = 100;
    const PAYLOAD: usize = 100;

    let echo = spawn_echo_server().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let mut clients = Vec::new();
    for i in 0..TUNNELS {
        let addr = proxy.addr;
        clients.push(tokio::spawn(async move {
            let (mut client, head) = send_connect(addr, &echo.to_string()).await?;
            assert_eq!(head.status, 200);
            let payload = vec![i as u8; PAYLOAD];
            client.write_all(&payload).await?;
            let mut echoed = vec![0u8; PAYLOAD];
            client.read_exact(&mut echoed).await?;
            assert_eq!(echoed, payload);
            anyhow::Ok(())
        }));
    }
    for client in clients {
        client.await??;
    }

    wait_for_closed_tunnels(proxy.proxy.stats()).await?;
    let stats = proxy.proxy.stats();
    assert_eq!(stats.tunnels_established(), TUNNELS as u64);
    assert_eq!(stats.bytes_relayed(), (2 * PAYLOAD * TUNNELS) as u64);
    Ok(())
}

#[tokio::test]
async fn test_client_read_deadline_closes_idle_tunnel() -> Result<()> {
    let echo = spawn_echo_server().await?;
    let proxy = spawn_proxy(ProxyConfig {
        client_read_timeout: Duration::from_millis(200),
        ..config_without_deadlines()
    })
    .await?;

    let (mut client, head) = send_connect(proxy.addr, &echo.to_string()).await?;
    assert_eq!(head.status, 200);

    // The client stays silent; the tunnel must go away on its own.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TEST_TIMEOUT, client.read(&mut buf)).await??;
    assert_eq!(n, 0);
    wait_for_closed_tunnels(proxy.proxy.stats()).await?;
    Ok(())
}

#[tokio::test]
async fn test_forbidden_host_is_refused_before_dialing() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let destination = listener.local_addr()?;
    let proxy = spawn_proxy(ProxyConfig {
        avoid: "127.0.0".to_owned(),
        ..config_without_deadlines()
    })
    .await?;

    let (mut client, head) = send_connect(proxy.addr, &destination.to_string()).await?;
    assert_eq!(head.status, 405);
    assert_eq!(read_body(&mut client, &head).await?, "Forbidden\n");

    // Nothing ever connected to the destination.
    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err());
    assert_eq!(proxy.proxy.stats().tunnels_established(), 0);
    Ok(())
}

#[tokio::test]
async fn test_origin_form_request_is_not_a_tunnel() -> Result<()> {
    let proxy = spawn_proxy(ProxyConfig {
        avoid: "blocked".to_owned(),
        ..config_without_deadlines()
    })
    .await?;

    let (head, body) = send_raw(proxy.addr, "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await?;
    assert_eq!(head.status, 405);
    assert_eq!(body, "Method Not Allowed\n");
    assert_eq!(head.header("x-content-type-options"), Some("nosniff"));

    // The access policy is checked first.
    let (head, body) = send_raw(proxy.addr, "GET / HTTP/1.1\r\nHost: blocked.example\r\n\r\n").await?;
    assert_eq!(head.status, 405);
    assert_eq!(body, "Forbidden\n");
    Ok(())
}

#[tokio::test]
async fn test_unreachable_destination_is_unavailable() -> Result<()> {
    let destination = closed_port().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let (mut client, head) = send_connect(proxy.addr, &destination.to_string()).await?;
    assert_eq!(head.status, 503);
    let body = read_body(&mut client, &head).await?;
    assert!(
        body.starts_with(&format!("dial tcp {destination}: ")),
        "unexpected body {body:?}"
    );
    assert_eq!(proxy.proxy.stats().tunnels_established(), 0);
    Ok(())
}

#[tokio::test]
async fn test_request_without_hijack_support() -> Result<()> {
    let echo = spawn_echo_server().await?;
    let proxy = Proxy::new(config_without_deadlines(), Statistics::new());
    let ctx = RequestContext::new("127.0.0.1:40000".parse()?, false);

    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(echo.to_string())
        .body(Empty::<Bytes>::new())?;
    let resp = proxy.dispatch(&ctx, req).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = resp.into_body().collect().await?.to_bytes();
    assert_eq!(body, "Hijacking not supported\n");
    assert_eq!(proxy.stats().open_tunnels(), 0);
    Ok(())
}

// -- Plain HTTP forwarding --

/// Origin answering every request with the request head it received.
async fn spawn_mirror_origin() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: mirror\r\nConnection: close\r\nKeep-Alive: timeout=5\r\n\r\n",
                    head.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(&head).await;
            });
        }
    });
    Ok(addr)
}

#[tokio::test]
async fn test_plain_request_is_forwarded() -> Result<()> {
    let origin = spawn_mirror_origin().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let request = format!(
        "GET http://{origin}/path?q=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n"
    );
    let (head, body) = send_raw(proxy.addr, &request).await?;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("x-origin"), Some("mirror"));
    assert_eq!(head.header("keep-alive"), None);

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut seen = httparse::Request::new(&mut headers);
    seen.parse(body.as_bytes())?;
    assert_eq!(seen.method, Some("GET"));
    assert_eq!(seen.path, Some("/path?q=1"));
    let seen_header = |name: &str| {
        seen.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
    };
    assert_eq!(seen_header("user-agent").as_deref(), Some(""), "{body}");
    assert_eq!(seen_header("x-forwarded-for").as_deref(), Some("127.0.0.1"), "{body}");
    assert_eq!(seen_header("accept").as_deref(), Some("*/*"), "{body}");
    assert_eq!(seen_header("proxy-connection"), None, "{body}");
    assert_eq!(proxy.proxy.stats().tunnels_established(), 0);
    Ok(())
}

#[tokio::test]
async fn test_plain_request_to_forbidden_host() -> Result<()> {
    let origin = spawn_mirror_origin().await?;
    let proxy = spawn_proxy(ProxyConfig {
        avoid: origin.ip().to_string(),
        ..config_without_deadlines()
    })
    .await?;

    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let (head, body) = send_raw(proxy.addr, &request).await?;
    assert_eq!(head.status, 405);
    assert_eq!(body, "Forbidden\n");
    Ok(())
}

#[tokio::test]
async fn test_plain_request_to_unreachable_origin() -> Result<()> {
    let origin = closed_port().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let (head, body) = send_raw(proxy.addr, &request).await?;
    assert_eq!(head.status, 502);
    assert_eq!(body, "");
    Ok(())
}

#[tokio::test]
async fn test_forwarded_client_header_is_extended() -> Result<()> {
    let origin = spawn_mirror_origin().await?;
    let proxy = spawn_proxy(config_without_deadlines()).await?;

    let request = format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nX-Forwarded-For: 203.0.113.9\r\nX-Real-Ip: 203.0.113.9\r\n\r\n"
    );
    let (head, body) = send_raw(proxy.addr, &request).await?;
    assert_eq!(head.status, 200);
    let seen = body.to_ascii_lowercase();
    assert!(seen.contains("\r\nx-forwarded-for: 203.0.113.9, 127.0.0.1\r\n"), "{body}");
    assert!(seen.contains("\r\nx-real-ip: 203.0.113.9\r\n"), "{body}");
    Ok(())
}

// -- Lifecycle --

#[tokio::test]
async fn test_shutdown_stops_accepting() -> Result<()> {
    let mut proxy = spawn_proxy(config_without_deadlines()).await?;
    proxy.shutdown.cancel();
    tokio::time::timeout(TEST_TIMEOUT, &mut proxy.task).await???;
    tokio::time::timeout(TEST_TIMEOUT, proxy.proxy.shutdown(Duration::from_secs(1))).await?;
    assert!(TcpStream::connect(proxy.addr).await.is_err());
    Ok(())
}
