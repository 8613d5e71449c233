use std::collections::HashMap;
use std::env;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::net::UnixDatagram;

use thiserror::Error;

const READY_MESSAGE: &str = "READY=1";
const STOPPING_MESSAGE: &str = "STOPPING=1";
/// First descriptor passed by socket activation.
const SD_LISTEN_FDS_START: RawFd = 3;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to create an unbound UNIX domain socket: {0}")]
    FailedCreate(io::Error),
    #[error("Failed to connect to the systemd notify socket: {0}")]
    FailedConnect(io::Error),
    #[error("Failed to send a notification to the systemd notify socket: {0}")]
    FailedSend(io::Error),
}

/// Notify systemd about things.
///
/// Returns `Ok(false)` when the process was not started by systemd, that is
/// when `$NOTIFY_SOCKET` is unset.
pub fn sd_notify(state: &str) -> Result<bool, NotifyError> {
    let Some(path) = env::var_os("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    let path = path.to_string_lossy();

    let sock = UnixDatagram::unbound().map_err(NotifyError::FailedCreate)?;
    connect_notify_socket(&sock, &path).map_err(NotifyError::FailedConnect)?;
    sock.send(state.as_bytes()).map_err(NotifyError::FailedSend)?;

    Ok(true)
}

#[cfg(target_os = "linux")]
fn connect_notify_socket(sock: &UnixDatagram, path: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    match path.strip_prefix('@') {
        Some(name) => sock.connect_addr(&SocketAddr::from_abstract_name(name.as_bytes())?),
        None => sock.connect(path),
    }
}

#[cfg(not(target_os = "linux"))]
fn connect_notify_socket(sock: &UnixDatagram, path: &str) -> io::Result<()> {
    sock.connect(path)
}

#[inline]
pub fn sd_notify_ready() -> Result<bool, NotifyError> {
    sd_notify(READY_MESSAGE)
}

#[inline]
pub fn sd_notify_stopping() -> Result<bool, NotifyError> {
    sd_notify(STOPPING_MESSAGE)
}

/// Sockets handed over by systemd socket activation, keyed by their
/// `FileDescriptorName=`. Empty when the process was not socket activated.
pub fn listen_fds_named() -> HashMap<String, RawFd> {
    parse_listen_fds(
        env::var("LISTEN_PID").ok().as_deref(),
        env::var("LISTEN_FDS").ok().as_deref(),
        env::var("LISTEN_FDNAMES").ok().as_deref(),
        std::process::id(),
    )
}

fn parse_listen_fds(
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    fd_names: Option<&str>,
    own_pid: u32,
) -> HashMap<String, RawFd> {
    let pid_ok = listen_pid
        .and_then(|v| v.parse::<u32>().ok())
        .is_some_and(|pid| pid == own_pid);
    if !pid_ok {
        return HashMap::new();
    }

    let n_fds = listen_fds
        .and_then(|v| v.parse::<RawFd>().ok())
        .unwrap_or(0);
    // FDNAMES are colon-separated
    let names: Vec<&str> = fd_names.unwrap_or_default().split(':').collect();

    let mut map = HashMap::new();
    for i in 0..n_fds {
        let fd = SD_LISTEN_FDS_START + i;
        let name = match names.get(i as usize) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("fd{fd}"),
        };
        map.insert(name, fd);
    }
    map
}
