//! Local HTTP CONNECT inbound.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use veilgate_protocol::Address;

use crate::error::{Error, Result};
use crate::relay::relay_stream;

use super::ClientContext;

const MAX_HEADER: usize = 8 * 1024;

pub(super) async fn serve(
    mut stream: TcpStream,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) -> Result<()> {
    let head = read_header(&mut stream).await?;
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or_else(|| Error::network("empty http request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if !method.eq_ignore_ascii_case("CONNECT") {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let address = parse_authority(target)
        .ok_or_else(|| Error::network(format!("bad CONNECT target {target}")))?;
    let outbound = match ctx.open_outbound(&address).await {
        Ok(Some(outbound)) => outbound,
        Ok(None) => {
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }
        Err(e) => {
            stream
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                .await?;
            return Err(e);
        }
    };
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    relay_stream(stream, outbound, ctx.account(), cancel).await
}

async fn read_header(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::network("client closed during http header"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEADER {
            return Err(Error::network("http header too large"));
        }
    }
    String::from_utf8(buf).map_err(|_| Error::network("http header is not valid UTF-8"))
}

/// Parses `host:port`, including `[v6]:port`.
fn parse_authority(target: &str) -> Option<Address> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?.parse().ok()?;
        let ip: std::net::Ipv6Addr = host.parse().ok()?;
        return Some(Address::Ipv6(ip, port));
    }
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => Some(Address::Ipv4(ip, port)),
        Err(_) => Some(Address::Domain(host.to_string(), port)),
    }
}
