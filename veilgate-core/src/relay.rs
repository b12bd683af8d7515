//! The byte pump between an inbound and an outbound session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Address, UdpPacket, MAX_PACKET_SIZE};

use crate::auth::UserStat;
use crate::error::Result;
use crate::meter::{NullMeter, TrafficMeter};
use crate::net::resolve_addr;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Where copied bytes are charged. Uploads are client-to-destination bytes.
#[derive(Clone)]
pub struct Account {
    stat: Option<Arc<UserStat>>,
    meter: Arc<dyn TrafficMeter>,
}

impl Account {
    pub fn unmetered() -> Self {
        Self {
            stat: None,
            meter: Arc::new(NullMeter),
        }
    }

    pub fn for_user(stat: Arc<UserStat>, meter: Arc<dyn TrafficMeter>) -> Self {
        Self {
            stat: Some(stat),
            meter,
        }
    }

    fn sent(&self, n: u64) {
        if let Some(stat) = &self.stat {
            stat.add_sent(n);
            self.meter.count(stat.hash(), n, 0);
        }
    }

    fn recv(&self, n: u64) {
        if let Some(stat) = &self.stat {
            stat.add_recv(n);
            self.meter.count(stat.hash(), 0, n);
        }
    }
}

/// Full-duplex pump. Each direction runs its own copy loop with its own
/// buffer; EOF on one direction half-closes the peer's write side so it can
/// drain; an error or cancellation tears down both.
pub async fn relay_stream<A, B>(
    inbound: A,
    outbound: B,
    account: Account,
    cancel: CancellationToken,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_in, mut write_in) = tokio::io::split(inbound);
    let (mut read_out, mut write_out) = tokio::io::split(outbound);

    let up = copy_half(&mut read_in, &mut write_out, &account, true);
    let down = copy_half(&mut read_out, &mut write_in, &account, false);

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = async { tokio::try_join!(up, down) } => r.map(|_| ()),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    account: &Account,
    upload: bool,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // let the peer drain before the session closes
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        if upload {
            account.sent(n as u64);
        } else {
            account.recv(n as u64);
        }
    }
}

/// Packet pump for an Associate session: frames from the stream become
/// datagrams on the socket and vice versa. Either direction going idle for
/// `timeout` ends the session.
pub async fn relay_udp<S>(
    stream: S,
    socket: UdpSocket,
    account: Account,
    cancel: CancellationToken,
    timeout: Duration,
    prefer_ipv4: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let socket = Arc::new(socket);
    let downlink_socket = Arc::clone(&socket);

    let uplink = async {
        loop {
            let packet = match tokio::time::timeout(timeout, UdpPacket::read_from(&mut reader)).await
            {
                Err(_) => return Ok(()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(packet))) => packet,
                Ok(Err(e)) => return Err(crate::error::Error::from(e)),
            };
            let dst = resolve_addr(&packet.address, prefer_ipv4).await?;
            socket.send_to(&packet.payload, dst).await?;
            account.sent(packet.payload.len() as u64);
        }
    };

    let downlink = async {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, src) = match tokio::time::timeout(timeout, downlink_socket.recv_from(&mut buf))
                .await
            {
                Err(_) => return Ok(()),
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(crate::error::Error::from(e)),
            };
            let packet = UdpPacket::new(Address::from_socket_addr(src), buf[..n].to_vec());
            packet.write_to(&mut writer).await?;
            account.recv(n as u64);
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = async { tokio::try_join!(uplink, downlink) } => r.map(|_| ()),
    }
}
