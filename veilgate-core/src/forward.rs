//! The `forward` run type: a local port tunneled to one fixed destination.
//!
//! Every accepted TCP connection becomes a Connect session toward the
//! configured target; local UDP datagrams are tracked per source in the
//! NAT table and carried over Associate sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Address, Command, RequestHeader, UdpPacket, MAX_PACKET_SIZE};

use crate::client::ClientContext;
use crate::error::{Error, Result};
use crate::nat::{NatConfig, NatEntry, UdpNatTable};
use crate::relay::relay_stream;

pub async fn run(ctx: Arc<ClientContext>, cancel: CancellationToken) -> Result<()> {
    let addr = ctx.config.local_addr()?;
    let target = target_address(&ctx);
    let listener = crate::net::listen(addr, &ctx.config.tcp)?;
    tracing::info!(%addr, target = %target, "forwarding");

    let udp = Arc::new(UdpSocket::bind(addr).await?);
    let (table, accept_rx) = UdpNatTable::new(NatConfig {
        timeout: Duration::from_secs(ctx.config.udp_timeout),
        capacity: 1024,
        queue_depth: 16,
    });
    tokio::spawn(Arc::clone(&table).run_reaper(cancel.child_token()));
    tokio::spawn(udp_session_loop(
        accept_rx,
        Arc::clone(&ctx),
        Arc::clone(&table),
        Arc::clone(&udp),
        target.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(udp_recv_loop(
        Arc::clone(&udp),
        Arc::clone(&table),
        Arc::clone(&ctx),
        cancel.child_token(),
    ));

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "forward accept failed");
                    continue;
                }
            },
        };
        if ctx.config.tcp.no_delay {
            stream.set_nodelay(true).ok();
        }
        let ctx = Arc::clone(&ctx);
        let target = target.clone();
        let session_cancel = cancel.child_token();
        tokio::spawn(async move {
            let header = RequestHeader::new(Command::Connect, target);
            let result = async {
                let outbound = ctx.open_tunnel(header).await?;
                relay_stream(stream, outbound, ctx.account(), session_cancel).await
            }
            .await;
            if let Err(e) = result {
                tracing::debug!(%peer, error = %e, "forward session closed");
            }
        });
    }
    Ok(())
}

fn target_address(ctx: &ClientContext) -> Address {
    match ctx.config.target_host.parse::<std::net::IpAddr>() {
        Ok(ip) => Address::from((ip, ctx.config.target_port)),
        Err(_) => Address::Domain(ctx.config.target_host.clone(), ctx.config.target_port),
    }
}

async fn udp_recv_loop(
    udp: Arc<UdpSocket>,
    table: Arc<UdpNatTable>,
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
) {
    // the NAT entry records where datagrams were heading; for forward mode
    // that is always the fixed target
    let dst = match crate::config::resolve_host(
        &ctx.config.target_host,
        ctx.config.target_port,
        ctx.config.tcp.prefer_ipv4,
    ) {
        Ok(dst) => dst,
        Err(e) => {
            tracing::warn!(error = %e, "cannot resolve forward target, udp disabled");
            return;
        }
    };
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = udp.recv_from(&mut buf) => r,
        };
        match received {
            Ok((n, src)) => table.on_inbound(src, dst, buf[..n].to_vec()),
            Err(e) => {
                tracing::warn!(error = %e, "forward udp receive failed");
                return;
            }
        }
    }
}

async fn udp_session_loop(
    mut accept_rx: tokio::sync::mpsc::Receiver<Arc<NatEntry>>,
    ctx: Arc<ClientContext>,
    table: Arc<UdpNatTable>,
    udp: Arc<UdpSocket>,
    target: Address,
    cancel: CancellationToken,
) {
    while let Some(entry) = tokio::select! {
        _ = cancel.cancelled() => None,
        entry = accept_rx.recv() => entry,
    } {
        let ctx = Arc::clone(&ctx);
        let table = Arc::clone(&table);
        let udp = Arc::clone(&udp);
        let target = target.clone();
        let session_cancel = cancel.child_token();
        tokio::spawn(async move {
            let src = entry.source();
            if let Err(e) =
                handle_udp_session(entry, ctx, udp, target, session_cancel).await
            {
                tracing::debug!(source = %src, error = %e, "forward udp session closed");
            }
            table.remove(&src);
        });
    }
}

async fn handle_udp_session(
    entry: Arc<NatEntry>,
    ctx: Arc<ClientContext>,
    udp: Arc<UdpSocket>,
    target: Address,
    cancel: CancellationToken,
) -> Result<()> {
    let timeout = Duration::from_secs(ctx.config.udp_timeout);
    let header = RequestHeader::new(Command::Associate, target.clone());
    let session = ctx.dialer.open(&header).await?;
    let (mut read_half, mut write_half) = tokio::io::split(session);
    let client = entry.source();

    let uplink = async {
        while let Some((_dst, payload)) = entry.recv().await {
            let packet = UdpPacket::new(target.clone(), payload);
            packet.write_to(&mut write_half).await?;
        }
        Ok::<_, Error>(())
    };

    let downlink = async {
        loop {
            match tokio::time::timeout(timeout, UdpPacket::read_from(&mut read_half)).await {
                Err(_) => return Ok(()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(packet))) => {
                    udp.send_to(&packet.payload, client).await?;
                }
                Ok(Err(e)) => return Err(Error::from(e)),
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = async { tokio::try_join!(uplink, downlink) } => r.map(|_| ()),
    }
}
