use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod acl;
mod config;
mod proxy;
mod state;
mod systemd;

/// Name of the socket-activated listener in the systemd socket unit.
const PROXY_SOCKET_NAME: &str = "proxy";

/// Forward HTTP proxy with CONNECT tunneling.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Refuse requests whose host contains this string
    #[arg(long)]
    avoid: Option<String>,

    /// Address to listen on when no socket is passed by systemd
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log debug messages, on unless set to false
    #[arg(short, long)]
    verbose: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = config::load_or_default(&cli.config)?;
    if let Some(avoid) = cli.avoid {
        settings.avoid = avoid;
    }
    if let Some(address) = cli.listen {
        settings.listener.address = address;
    }
    if let Some(verbose) = cli.verbose {
        settings.verbose = verbose;
    }

    let default_level = if settings.verbose { "debug" } else { "error" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt::fmt().with_env_filter(filter).init();

    debug!(config = ?cli.config, "settings loaded");

    let tls_acceptor = proxy::tls::build_tls_acceptor(&settings.listener)?;
    let listener = bind_listener(&settings).await?;
    info!(
        address = ?listener.local_addr().ok(),
        tls = tls_acceptor.is_some(),
        "Proxy started"
    );

    let stats = state::Statistics::new();
    let proxy = Arc::new(proxy::Proxy::new(settings.proxy_config(), stats.clone()));
    debug!(avoid = proxy.policy().avoid(), "access policy");
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match systemd::sd_notify_ready() {
        Ok(true) => debug!("notified systemd of readiness"),
        Ok(false) => {}
        Err(err) => warn!("{err}"),
    }

    proxy::start(
        proxy.clone(),
        listener,
        tls_acceptor,
        settings.timeouts.server_read_header,
        shutdown,
    )
    .await?;

    if let Err(err) = systemd::sd_notify_stopping() {
        warn!("{err}");
    }
    proxy.shutdown(settings.timeouts.shutdown_grace).await;

    info!(
        bytes = stats.bytes_relayed(),
        tunnels = stats.tunnels_established(),
        "Total data"
    );
    info!("Server stopped");

    Ok(())
}

/// Uses the socket passed by systemd when there is one, binds the configured
/// address otherwise.
async fn bind_listener(settings: &config::Settings) -> Result<TcpListener> {
    if let Some(fd) = systemd::listen_fds_named().get(PROXY_SOCKET_NAME) {
        debug!(fd, "using the socket passed by systemd");
        // SAFETY: systemd hands the descriptor over to this process, nothing
        // else owns it.
        let std = unsafe { std::net::TcpListener::from_raw_fd(*fd) };
        std.set_nonblocking(true)?;
        return Ok(TcpListener::from_std(std)?);
    }

    let address = settings.listener.address;
    TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to listen on {address}"))
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                return;
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    error!("Failed to listen for Ctrl-C: {err}");
                    terminate.recv().await;
                }
            }
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {err}");
        return;
    }

    info!("Shutting down");
    shutdown.cancel();
}
