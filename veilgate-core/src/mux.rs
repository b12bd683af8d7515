//! Stream multiplexing over one authenticated tunnel session.
//!
//! The on-wire protocol is yamux: both sides get collision-free stream ids
//! (client odd, server even), per-stream flow control, and ping keepalives
//! without anything bespoke on top. Each substream carries one compact
//! request header followed by payload bytes, and is accounted to the same
//! user as the physical session that carries it.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{
    Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt,
};
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Command, RequestHeader};

use crate::auth::UserStat;
use crate::config::{MuxConfig, TcpConfig};
use crate::error::{Error, Result};
use crate::meter::TrafficMeter;
use crate::net;
use crate::relay::{relay_stream, Account};
use crate::router::Router;

/// Byte-stream object the mux layer runs over.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// Opens new physical tunnel sessions for the client-side pool.
#[async_trait]
pub trait MuxDialer: Send + Sync {
    async fn dial_mux(&self) -> Result<Box<dyn StreamIo>>;
}

/// Server side: accept substreams off an authenticated session whose
/// command was Mux and dispatch each inner request as a Connect. A session
/// with no substreams for `idle_timeout` is closed.
#[allow(clippy::too_many_arguments)]
pub async fn serve<S>(
    stream: S,
    stat: Arc<UserStat>,
    meter: Arc<dyn TrafficMeter>,
    router: Arc<Router>,
    tcp: TcpConfig,
    mux: MuxConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = Duration::from_secs(mux.idle_timeout.max(1));
    let mut conn = yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Server);
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(idle, poll_fn(|cx| conn.poll_next_inbound(cx))) => next,
        };
        match next {
            Err(_) => {
                if active.load(Ordering::Acquire) == 0 {
                    tracing::debug!(user = %stat.hash(), "mux session idle, closing");
                    break;
                }
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "mux session error");
                break;
            }
            Ok(Some(Ok(substream))) => {
                if active.load(Ordering::Acquire) >= mux.concurrency {
                    tracing::warn!(
                        limit = mux.concurrency,
                        "mux concurrency exceeded, refusing substream"
                    );
                    drop(substream);
                    continue;
                }
                active.fetch_add(1, Ordering::AcqRel);
                let active = Arc::clone(&active);
                let stat = Arc::clone(&stat);
                let meter = Arc::clone(&meter);
                let router = Arc::clone(&router);
                let tcp = tcp.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_substream(substream, stat, meter, router, tcp, cancel).await
                    {
                        tracing::debug!(error = %e, "mux substream closed with error");
                    }
                    active.fetch_sub(1, Ordering::AcqRel);
                });
            }
        }
    }
    let _ = poll_fn(|cx| conn.poll_close(cx)).await;
    Ok(())
}

async fn handle_substream(
    substream: yamux::Stream,
    stat: Arc<UserStat>,
    meter: Arc<dyn TrafficMeter>,
    router: Arc<Router>,
    tcp: TcpConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut io = substream.compat();
    let header = RequestHeader::read_compact(&mut io).await?;
    if header.command != Command::Connect {
        return Err(Error::Protocol(
            veilgate_protocol::ProtocolError::UnknownCommand(header.command as u8),
        ));
    }
    if router.decide(&header.address) == crate::config::Policy::Block {
        tracing::debug!(target = %header.address, "blocked by rules");
        return Ok(());
    }
    tracing::debug!(user = %stat.hash(), target = %header.address, "mux tunneling");
    let outbound = net::dial(&header.address, tcp.prefer_ipv4, tcp.no_delay).await?;
    relay_stream(io, outbound, Account::for_user(stat, meter), cancel).await
}

type OpenReply = oneshot::Sender<Result<yamux::Stream>>;

/// One client-side physical session. A driver task owns the connection and
/// hands out substreams on request.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<OpenReply>,
    active: Arc<AtomicUsize>,
    idle_since: Arc<Mutex<Instant>>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    pub fn spawn(stream: Box<dyn StreamIo>, cancel: CancellationToken) -> Arc<Self> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<OpenReply>(1);
        let closed = Arc::new(AtomicBool::new(false));
        let session = Arc::new(Self {
            cmd_tx,
            active: Arc::new(AtomicUsize::new(0)),
            idle_since: Arc::new(Mutex::new(Instant::now())),
            closed: Arc::clone(&closed),
        });

        tokio::spawn(async move {
            let mut conn =
                yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Client);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        None => break,
                        Some(reply) => {
                            let res = poll_fn(|cx| conn.poll_new_outbound(cx)).await;
                            let failed = res.is_err();
                            let _ = reply.send(
                                res.map_err(|e| Error::network(format!("mux open failed: {e}"))),
                            );
                            if failed {
                                break;
                            }
                        }
                    },
                    inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => match inbound {
                        // the server never opens streams toward us
                        Some(Ok(stream)) => drop(stream),
                        _ => break,
                    },
                }
            }
            closed.store(true, Ordering::Release);
            let _ = poll_fn(|cx| conn.poll_close(cx)).await;
        });
        session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        if self.active_streams() > 0 {
            Duration::ZERO
        } else {
            self.idle_since.lock().expect("mux lock").elapsed()
        }
    }

    /// Opens one substream and wraps it so the session's stream count and
    /// idle clock stay accurate.
    pub async fn open(&self) -> Result<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(tx)
            .await
            .map_err(|_| Error::network("mux session closed"))?;
        let stream = rx
            .await
            .map_err(|_| Error::network("mux session closed"))??;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(MuxStream {
            inner: stream.compat(),
            active: Arc::clone(&self.active),
            idle_since: Arc::clone(&self.idle_since),
        })
    }
}

/// Client-side pool of physical sessions. A logical open picks the busiest
/// session still under the concurrency cap, or dials a fresh one; sessions
/// that sit streamless past the idle timeout are dropped.
pub struct MuxConnector {
    dialer: Arc<dyn MuxDialer>,
    cfg: MuxConfig,
    sessions: tokio::sync::Mutex<Vec<Arc<MuxSession>>>,
    cancel: CancellationToken,
}

impl MuxConnector {
    pub fn new(dialer: Arc<dyn MuxDialer>, cfg: MuxConfig, cancel: CancellationToken) -> Self {
        Self {
            dialer,
            cfg,
            sessions: tokio::sync::Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Opens a logical stream and writes the compact request header.
    pub async fn open(&self, header: &RequestHeader) -> Result<MuxStream> {
        let session = self.checkout().await?;
        let mut stream = match session.open().await {
            Ok(stream) => stream,
            Err(_) => {
                // session died under us, retry once on a fresh one
                let session = self.dial_session().await?;
                session.open().await?
            }
        };
        header.write_compact(&mut stream).await?;
        Ok(stream)
    }

    async fn checkout(&self) -> Result<Arc<MuxSession>> {
        let idle = Duration::from_secs(self.cfg.idle_timeout.max(1));
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| !s.is_closed() && s.idle_for() < idle);
        if let Some(session) = sessions
            .iter()
            .filter(|s| s.active_streams() < self.cfg.concurrency)
            .max_by_key(|s| s.active_streams())
        {
            return Ok(Arc::clone(session));
        }
        drop(sessions);
        self.dial_session().await
    }

    async fn dial_session(&self) -> Result<Arc<MuxSession>> {
        let stream = self.dialer.dial_mux().await?;
        let session = MuxSession::spawn(stream, self.cancel.child_token());
        self.sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }
}

/// A logical stream handed to the relay. Dropping it updates the owning
/// session's bookkeeping.
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    active: Arc<AtomicUsize>,
    idle_since: Arc<Mutex<Instant>>,
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        *self.idle_since.lock().expect("mux lock") = Instant::now();
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticStore;
    use crate::auth::CredentialStore;
    use crate::config::Policy;
    use crate::meter::NullMeter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use veilgate_protocol::{hash_password, Address};

    struct DuplexDialer {
        ends: tokio::sync::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl MuxDialer for DuplexDialer {
        async fn dial_mux(&self) -> Result<Box<dyn StreamIo>> {
            let end = self
                .ends
                .lock()
                .await
                .pop()
                .ok_or_else(|| Error::network("no test session left"))?;
            Ok(Box::new(end))
        }
    }

    /// Two substreams through one physical session; bytes never cross over.
    #[tokio::test]
    async fn substreams_are_isolated() {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match echo.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 512];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let store = StaticStore::new(&["swordfish".to_string()]);
        let stat = store.authenticate(&hash_password("swordfish")).unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            server_end,
            stat,
            Arc::new(NullMeter) as Arc<dyn TrafficMeter>,
            Arc::new(Router::all(Policy::Proxy)),
            TcpConfig::default(),
            MuxConfig {
                enabled: true,
                concurrency: 8,
                idle_timeout: 60,
            },
            cancel.clone(),
        ));

        let dialer = Arc::new(DuplexDialer {
            ends: tokio::sync::Mutex::new(vec![client_end]),
        });
        let connector = MuxConnector::new(
            dialer,
            MuxConfig {
                enabled: true,
                concurrency: 8,
                idle_timeout: 60,
            },
            cancel.clone(),
        );

        let header = RequestHeader::new(
            Command::Connect,
            Address::from_socket_addr(echo_addr),
        );
        let mut one = connector.open(&header).await.unwrap();
        let mut two = connector.open(&header).await.unwrap();

        one.write_all(b"first stream").await.unwrap();
        two.write_all(b"second stream").await.unwrap();

        let mut buf1 = [0u8; 12];
        one.read_exact(&mut buf1).await.unwrap();
        assert_eq!(&buf1, b"first stream");

        let mut buf2 = [0u8; 13];
        two.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"second stream");

        drop(one);
        drop(two);
        cancel.cancel();
        let _ = server.await;
    }
}
