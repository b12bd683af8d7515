//! Socket plumbing shared by every listener and dialer.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use veilgate_protocol::Address;

use crate::error::{Error, Result};

/// Resolves a wire address to a socket address, honoring `prefer_ipv4`.
pub async fn resolve_addr(addr: &Address, prefer_ipv4: bool) -> Result<SocketAddr> {
    if let Some(sa) = addr.to_socket_addr() {
        return Ok(sa);
    }
    let target = addr.to_string();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| Error::network_with_source(format!("cannot resolve {target}"), e))?
        .collect();
    let picked = if prefer_ipv4 {
        addrs.iter().find(|a| a.is_ipv4()).or(addrs.first())
    } else {
        addrs.first()
    };
    picked
        .copied()
        .ok_or_else(|| Error::network(format!("no address for {target}")))
}

/// Dials a destination for the outbound side of a session.
pub async fn dial(addr: &Address, prefer_ipv4: bool, no_delay: bool) -> Result<TcpStream> {
    let target = resolve_addr(addr, prefer_ipv4).await?;
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| Error::network_with_source(format!("cannot connect to {addr}"), e))?;
    if no_delay {
        stream.set_nodelay(true).ok();
    }
    Ok(stream)
}

/// Builds a listener with the configured socket options applied before bind.
pub fn listen(addr: SocketAddr, tcp: &crate::config::TcpConfig) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::network_with_source("cannot create socket", e))?;
    socket.set_reuse_address(true).ok();
    #[cfg(unix)]
    if tcp.reuse_port {
        socket.set_reuse_port(true).ok();
    }
    #[cfg(target_os = "linux")]
    if tcp.fast_open {
        set_tcp_fastopen(&socket);
    }
    #[cfg(not(target_os = "linux"))]
    if tcp.fast_open {
        tracing::warn!("tcp fast open is not supported on this platform");
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::network_with_source("cannot set non-blocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::network_with_source(format!("cannot bind {addr}"), e))?;
    socket
        .listen(1024)
        .map_err(|e| Error::network_with_source(format!("cannot listen on {addr}"), e))?;
    TcpListener::from_std(socket.into())
        .map_err(|e| Error::network_with_source("cannot register listener", e))
}

#[cfg(target_os = "linux")]
fn set_tcp_fastopen(socket: &Socket) {
    use std::os::fd::AsRawFd;
    let qlen: libc::c_int = 256;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "cannot enable tcp fast open"
        );
    }
}
