//! Transparent-proxy inbound for Linux (the `nat` run type).
//!
//! TCP listens with `IP_TRANSPARENT` and recovers the original destination
//! from `SO_ORIGINAL_DST`, falling back to the accepted socket's local
//! address under TPROXY rules. UDP uses `IP_RECVORIGDSTADDR` to learn each
//! datagram's original destination and tracks flows in the NAT table;
//! replies are sent from the original destination when the platform lets
//! us bind it, from an ordinary local socket otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Address, Command, RequestHeader, UdpPacket, MAX_PACKET_SIZE};

use crate::client::ClientContext;
use crate::error::{Error, Result};
use crate::nat::{NatConfig, NatEntry, UdpNatTable};
use crate::relay::relay_stream;

const TPROXY_UDP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(ctx: Arc<ClientContext>, cancel: CancellationToken) -> Result<()> {
    let addr = ctx.config.local_addr()?;
    let listener = transparent_tcp_listener(addr)?;
    let udp = Arc::new(TransparentUdp::bind(addr)?);
    tracing::info!(%addr, "transparent proxy listening");

    let (table, accept_rx) = UdpNatTable::new(NatConfig {
        timeout: TPROXY_UDP_TIMEOUT,
        capacity: 1024,
        queue_depth: 16,
    });
    tokio::spawn(Arc::clone(&table).run_reaper(cancel.child_token()));
    tokio::spawn(udp_session_loop(
        accept_rx,
        Arc::clone(&ctx),
        Arc::clone(&table),
        cancel.child_token(),
    ));
    tokio::spawn(udp_recv_loop(
        Arc::clone(&udp),
        Arc::clone(&table),
        cancel.child_token(),
    ));

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "tproxy accept failed");
                    continue;
                }
            },
        };
        let ctx = Arc::clone(&ctx);
        let session_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp(ctx, stream, session_cancel).await {
                tracing::debug!(%peer, error = %e, "tproxy session closed");
            }
        });
    }
    Ok(())
}

async fn handle_tcp(
    ctx: Arc<ClientContext>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let original = original_dst(&stream)?;
    let target = Address::from_socket_addr(original);
    tracing::debug!(target = %target, "tproxy tcp session");
    let Some(outbound) = ctx.open_outbound(&target).await? else {
        return Ok(());
    };
    relay_stream(stream, outbound, ctx.account(), cancel).await
}

async fn udp_recv_loop(
    udp: Arc<TransparentUdp>,
    table: Arc<UdpNatTable>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = udp.recv(&mut buf) => r,
        };
        match received {
            Ok((n, src, dst)) => {
                tracing::debug!(%src, %dst, "tproxy udp packet");
                table.on_inbound(src, dst, buf[..n].to_vec());
            }
            Err(e) => {
                tracing::warn!(error = %e, "tproxy udp receive failed");
                return;
            }
        }
    }
}

async fn udp_session_loop(
    mut accept_rx: tokio::sync::mpsc::Receiver<Arc<NatEntry>>,
    ctx: Arc<ClientContext>,
    table: Arc<UdpNatTable>,
    cancel: CancellationToken,
) {
    while let Some(entry) = tokio::select! {
        _ = cancel.cancelled() => None,
        entry = accept_rx.recv() => entry,
    } {
        let ctx = Arc::clone(&ctx);
        let table = Arc::clone(&table);
        let session_cancel = cancel.child_token();
        tokio::spawn(async move {
            let src = entry.source();
            if let Err(e) = handle_udp_session(entry, ctx, session_cancel).await {
                tracing::debug!(source = %src, error = %e, "tproxy udp session closed");
            }
            table.remove(&src);
        });
    }
}

async fn handle_udp_session(
    entry: Arc<NatEntry>,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let header = RequestHeader::new(
        Command::Associate,
        Address::from_socket_addr(entry.destination()),
    );
    let session = ctx.dialer.open(&header).await?;
    let (mut read_half, mut write_half) = tokio::io::split(session);
    let client = entry.source();

    let uplink = async {
        while let Some((dst, payload)) = entry.recv().await {
            let packet = UdpPacket::new(Address::from_socket_addr(dst), payload);
            packet.write_to(&mut write_half).await?;
        }
        Ok::<_, Error>(())
    };

    let downlink = async {
        // reply sockets bound to each origin, so the client sees answers
        // coming from the address it sent to
        let mut reply_sockets: HashMap<SocketAddr, UdpSocket> = HashMap::new();
        loop {
            let packet = match tokio::time::timeout(
                TPROXY_UDP_TIMEOUT,
                UdpPacket::read_from(&mut read_half),
            )
            .await
            {
                Err(_) => return Ok(()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(packet))) => packet,
                Ok(Err(e)) => return Err(Error::from(e)),
            };
            let Some(origin) = packet.address.clone().canonical().to_socket_addr() else {
                continue;
            };
            if !reply_sockets.contains_key(&origin) {
                match transparent_reply_socket(origin) {
                    Ok(socket) => {
                        reply_sockets.insert(origin, socket);
                    }
                    Err(e) => {
                        tracing::debug!(%origin, error = %e, "non-local bind unavailable");
                    }
                }
            }
            match reply_sockets.get(&origin) {
                Some(socket) => {
                    socket.send_to(&packet.payload, client).await?;
                }
                None => {
                    // platform without non-local bind: reply from a local
                    // socket instead
                    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
                    socket.send_to(&packet.payload, client).await?;
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = async { tokio::try_join!(uplink, downlink) } => r.map(|_| ()),
    }
}

fn set_transparent(socket: &Socket, addr: &SocketAddr) -> std::io::Result<()> {
    let (level, option) = match addr {
        SocketAddr::V4(_) => (libc::SOL_IP, libc::IP_TRANSPARENT),
        SocketAddr::V6(_) => (libc::SOL_IPV6, libc::IPV6_TRANSPARENT),
    };
    setsockopt_int(socket.as_raw_fd(), level, option, 1)
}

fn setsockopt_int(fd: i32, level: i32, option: i32, value: i32) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn transparent_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::network_with_source("cannot create socket", e))?;
    set_transparent(&socket, &addr)
        .map_err(|e| Error::network_with_source("IP_TRANSPARENT requires CAP_NET_ADMIN", e))?;
    socket.set_reuse_address(true).ok();
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

/// Original destination of a redirected TCP connection. REDIRECT rules
/// store it in `SO_ORIGINAL_DST`; under TPROXY the accepted socket is
/// already bound to it.
fn original_dst(stream: &TcpStream) -> Result<SocketAddr> {
    let fd = stream.as_raw_fd();
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret == 0 && addr.sin_family == libc::AF_INET as libc::sa_family_t {
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            return Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)));
        }
    }
    stream.local_addr().map_err(Error::from)
}

fn transparent_reply_socket(origin: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(origin), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    set_transparent(&socket, &origin)?;
    socket.set_nonblocking(true)?;
    socket.bind(&origin.into())?;
    UdpSocket::from_std(socket.into())
}

/// UDP socket that reports each datagram's original destination.
struct TransparentUdp {
    inner: AsyncFd<std::net::UdpSocket>,
}

impl TransparentUdp {
    fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::network_with_source("cannot create udp socket", e))?;
        socket.set_reuse_address(true).ok();
        set_transparent(&socket, &addr)
            .map_err(|e| Error::network_with_source("IP_TRANSPARENT requires CAP_NET_ADMIN", e))?;
        let fd = socket.as_raw_fd();
        let recv_option = match addr {
            SocketAddr::V4(_) => (libc::SOL_IP, libc::IP_RECVORIGDSTADDR),
            SocketAddr::V6(_) => (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR),
        };
        setsockopt_int(fd, recv_option.0, recv_option.1, 1)
            .map_err(|e| Error::network_with_source("cannot enable RECVORIGDSTADDR", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::network_with_source("cannot set non-blocking", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::network_with_source(format!("cannot bind {addr}"), e))?;
        let inner = AsyncFd::new(std::net::UdpSocket::from(socket))
            .map_err(|e| Error::network_with_source("cannot register udp socket", e))?;
        Ok(Self { inner })
    }

    /// Receives one datagram together with its source and original
    /// destination.
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|fd| recv_with_dst(fd.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_with_dst(fd: i32, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut name: libc::sockaddr_storage = std::mem::zeroed();
        let mut control = [0u8; 128];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let src = sockaddr_to_std(&name).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad source address")
        })?;

        let mut dst = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let is_v4 =
                hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVORIGDSTADDR;
            let is_v6 =
                hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVORIGDSTADDR;
            if is_v4 || is_v6 {
                let data = libc::CMSG_DATA(cmsg) as *const libc::sockaddr_storage;
                let mut storage: libc::sockaddr_storage = std::mem::zeroed();
                let len = if is_v4 {
                    std::mem::size_of::<libc::sockaddr_in>()
                } else {
                    std::mem::size_of::<libc::sockaddr_in6>()
                };
                std::ptr::copy_nonoverlapping(
                    data as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    len,
                );
                dst = sockaddr_to_std(&storage);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        let dst = dst.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "no original destination")
        })?;
        Ok((n as usize, src, dst))
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}
