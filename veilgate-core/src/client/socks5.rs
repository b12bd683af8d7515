//! Local SOCKS5 inbound (RFC 1928), no authentication.
//!
//! CONNECT and UDP ASSOCIATE are supported. The SOCKS5 address encoding is
//! the same tagged form the tunnel uses, so both directions share the
//! `Address` codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Address, Command, ProtocolError, RequestHeader, UdpPacket, MAX_PACKET_SIZE};

use crate::config::Policy;
use crate::error::{Error, Result};
use crate::net;
use crate::relay::relay_stream;

use super::ClientContext;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;

const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_COMMAND_UNSUPPORTED: u8 = 0x07;

pub(super) async fn serve(
    mut stream: TcpStream,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    greet(&mut stream).await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::network("not a socks5 request"));
    }
    let command = head[1];
    let target = Address::read_from_async(&mut stream).await?;

    match command {
        0x01 => handle_connect(stream, target, ctx, cancel).await,
        0x03 => handle_associate(stream, ctx, cancel).await,
        _ => {
            reply(&mut stream, REP_COMMAND_UNSUPPORTED).await?;
            Err(Error::network(format!("unsupported socks5 command {command}")))
        }
    }
}

async fn greet(stream: &mut TcpStream) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::network("not a socks5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;
    Ok(())
}

async fn reply<W: AsyncWrite + Unpin>(stream: &mut W, code: u8) -> Result<()> {
    // bound address is not meaningful for CONNECT replies
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

async fn reply_bound<W: AsyncWrite + Unpin>(stream: &mut W, bound: SocketAddr) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + 18);
    buf.put_u8(SOCKS_VERSION);
    buf.put_u8(REP_SUCCESS);
    buf.put_u8(0x00);
    Address::from_socket_addr(bound).write_to(&mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

async fn handle_connect(
    mut stream: TcpStream,
    target: Address,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let outbound = match ctx.open_outbound(&target).await {
        Ok(Some(outbound)) => outbound,
        Ok(None) => {
            reply(&mut stream, REP_NOT_ALLOWED).await?;
            return Ok(());
        }
        Err(e) => {
            reply(&mut stream, REP_FAILURE).await?;
            return Err(e);
        }
    };
    reply(&mut stream, REP_SUCCESS).await?;
    relay_stream(stream, outbound, ctx.account(), cancel).await
}

/// UDP ASSOCIATE: bind a relay socket next to the TCP connection, then
/// shuttle datagrams between the local client and the tunnel (or a direct
/// socket for bypassed targets) until the controlling TCP connection
/// closes.
async fn handle_associate(
    mut stream: TcpStream,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_ip = stream.local_addr()?.ip();
    let relay = UdpSocket::bind((local_ip, 0)).await?;
    let bound = relay.local_addr()?;
    reply_bound(&mut stream, bound).await?;
    tracing::debug!(%bound, "udp associate");

    let assoc = cancel.child_token();
    let run = run_associate(relay, ctx, assoc.clone());
    tokio::select! {
        r = run => r,
        _ = wait_for_eof(&mut stream) => Ok(()),
        _ = cancel.cancelled() => Ok(()),
    }
}

async fn wait_for_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn run_associate(
    relay: UdpSocket,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let relay = Arc::new(relay);
    let timeout = Duration::from_secs(ctx.config.udp_timeout);
    let mut client: Option<SocketAddr> = None;
    let mut tunnel: Option<TunnelUplink> = None;
    let mut direct: Option<Arc<UdpSocket>> = None;
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 512];

    loop {
        let (n, src) = match tokio::time::timeout(timeout, relay.recv_from(&mut buf)).await {
            Err(_) => return Ok(()),
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(Error::from(e)),
        };
        let client_addr = *client.get_or_insert(src);
        if src != client_addr {
            continue;
        }
        let Some((target, payload)) = decode_udp_request(&buf[..n]) else {
            continue;
        };

        match ctx.router.decide(&target) {
            Policy::Block => continue,
            Policy::Bypass => {
                if direct.is_none() {
                    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
                    spawn_direct_downlink(
                        Arc::clone(&socket),
                        Arc::clone(&relay),
                        client_addr,
                        cancel.child_token(),
                    );
                    direct = Some(socket);
                }
                let socket = direct.as_ref().expect("direct socket exists");
                let dst = net::resolve_addr(&target, ctx.config.tcp.prefer_ipv4).await?;
                socket.send_to(payload, dst).await?;
            }
            Policy::Proxy => {
                if tunnel.is_none() {
                    let header = RequestHeader::new(Command::Associate, target.clone());
                    let session = ctx.dialer.open(&header).await?;
                    let (read_half, write_half) = tokio::io::split(session);
                    spawn_tunnel_downlink(
                        read_half,
                        Arc::clone(&relay),
                        client_addr,
                        cancel.child_token(),
                    );
                    tunnel = Some(TunnelUplink { write_half });
                }
                let uplink = tunnel.as_mut().expect("tunnel session exists");
                let packet = UdpPacket::new(target.clone(), payload.to_vec());
                packet.write_to(&mut uplink.write_half).await?;
            }
        }
    }
}

struct TunnelUplink {
    write_half: tokio::io::WriteHalf<tokio_rustls::client::TlsStream<TcpStream>>,
}

fn spawn_tunnel_downlink(
    mut read_half: tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>>,
    relay: Arc<UdpSocket>,
    client: SocketAddr,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => return,
                p = UdpPacket::read_from(&mut read_half) => p,
            };
            match packet {
                Ok(Some(packet)) => {
                    let datagram = match encode_udp_response(&packet) {
                        Ok(datagram) => datagram,
                        Err(_) => continue,
                    };
                    if relay.send_to(&datagram, client).await.is_err() {
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    });
}

fn spawn_direct_downlink(
    socket: Arc<UdpSocket>,
    relay: Arc<UdpSocket>,
    client: SocketAddr,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                r = socket.recv_from(&mut buf) => r,
            };
            let Ok((n, from)) = received else { return };
            let packet = UdpPacket::new(Address::from_socket_addr(from), buf[..n].to_vec());
            let datagram = match encode_udp_response(&packet) {
                Ok(datagram) => datagram,
                Err(_) => continue,
            };
            if relay.send_to(&datagram, client).await.is_err() {
                return;
            }
        }
    });
}

/// Parses a SOCKS5 UDP request datagram: RSV(2) FRAG(1) ATYP addr port
/// data. Fragmented datagrams are dropped.
fn decode_udp_request(datagram: &[u8]) -> Option<(Address, &[u8])> {
    if datagram.len() < 4 || datagram[2] != 0 {
        return None;
    }
    let (target, consumed) = Address::read_from(&datagram[3..]).ok()?;
    Some((target, &datagram[3 + consumed..]))
}

/// Builds the SOCKS5 UDP response datagram around a tunnel packet.
fn encode_udp_response(packet: &UdpPacket) -> std::result::Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(3 + packet.address.serialized_len() + packet.payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    packet.address.write_to(&mut buf)?;
    buf.extend_from_slice(&packet.payload);
    Ok(buf)
}
