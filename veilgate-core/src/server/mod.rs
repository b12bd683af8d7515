//! The server runtime: accept, terminate TLS, then decide within the first
//! bytes whether this is an authenticated tunnel session or a visitor for
//! the decoy.
//!
//! The decision never signals failure to the client. An unknown hash, a
//! malformed prefix, or a short read all route the connection, buffered
//! bytes first, to the same decoy that would serve any browser; only a
//! well-formed frame whose hash the credential store accepts is treated as
//! a tunnel request. Validation is a fixed-shape check plus one in-memory
//! lookup, so the timing of the two outcomes is indistinguishable.

mod fallback;
mod record;

pub use fallback::FallbackTarget;
pub use record::RecordingStream;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

use veilgate_protocol::{Command, RequestHeader, CRLF, HASH_LEN};

use crate::auth::CredentialStore;
use crate::config::{Config, Policy};
use crate::error::Result;
use crate::meter::TrafficMeter;
use crate::mux;
use crate::net;
use crate::relay::{relay_stream, relay_udp, Account};
use crate::router::Router;
use crate::tls;

const MAX_SESSIONS: usize = 4096;

/// Everything one session needs; shared by the plain and mux paths.
pub(crate) struct SessionContext {
    store: Arc<dyn CredentialStore>,
    meter: Arc<dyn TrafficMeter>,
    router: Arc<Router>,
    config: Arc<Config>,
    fallback: FallbackTarget,
}

pub struct Server {
    ctx: Arc<SessionContext>,
    tls_config: Arc<rustls::ServerConfig>,
    admission: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn CredentialStore>,
        meter: Arc<dyn TrafficMeter>,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let tls_config = tls::make_server_config(&config)?;
        let fallback = FallbackTarget {
            decoy: config.fallback_addr(),
            http_response: config.http_response().map(Arc::new),
        };
        Ok(Self {
            ctx: Arc::new(SessionContext {
                store,
                meter,
                router,
                config,
                fallback,
            }),
            tls_config,
            admission: Arc::new(Semaphore::new(MAX_SESSIONS)),
            cancel,
        })
    }

    /// Accept loop. Ends when cancelled or when accept fails permanently.
    pub async fn run(&self) -> Result<()> {
        let addr = self.ctx.config.local_addr()?;
        let listener = net::listen(addr, &self.ctx.config.tcp)?;
        tracing::info!(%addr, "server listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let permit = match Arc::clone(&self.admission).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(%peer, "session limit reached, refusing connection");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            let tls_config = Arc::clone(&self.tls_config);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(ctx, tls_config, stream, peer, cancel).await {
                    tracing::debug!(%peer, error = %e, "session closed");
                }
            });
        }
        tracing::info!("server shut down");
        Ok(())
    }
}

/// TLS termination with the raw prefix recorded. A connection that fails
/// at the client hello is handed, recorded bytes and all, to the decoy,
/// which terminates TLS itself.
async fn handle_connection(
    ctx: Arc<SessionContext>,
    tls_config: Arc<rustls::ServerConfig>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    if ctx.config.tcp.no_delay {
        stream.set_nodelay(true).ok();
    }
    let acceptor = LazyConfigAcceptor::new(
        rustls::server::Acceptor::default(),
        RecordingStream::new(stream),
    );
    tokio::pin!(acceptor);
    match acceptor.as_mut().await {
        Ok(start) => match start.into_stream(tls_config).await {
            Ok(mut tls) => {
                tls.get_mut().0.stop_recording();
                dispatch(&ctx, tls, peer, cancel).await
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "tls handshake failed");
                Ok(())
            }
        },
        Err(e) => {
            tracing::debug!(%peer, error = %e, "invalid client hello, relaying to decoy");
            if let Some(recording) = acceptor.take_io() {
                let (raw, recorded) = recording.into_parts();
                fallback::serve(raw, &recorded, &ctx.fallback, cancel).await?;
            }
            Ok(())
        }
    }
}

/// Returns the hash when the prefix has the exact authenticated shape:
/// 56 hex characters terminated by CRLF.
fn parse_hash_prefix(prefix: &[u8]) -> Option<&str> {
    if prefix.len() != HASH_LEN + 2 {
        return None;
    }
    if prefix[HASH_LEN..] != CRLF {
        return None;
    }
    if !prefix[..HASH_LEN].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    std::str::from_utf8(&prefix[..HASH_LEN]).ok()
}

/// The post-handshake state machine: peek, validate, then either serve the
/// framed request or relay everything to the decoy.
async fn dispatch<S>(
    ctx: &SessionContext,
    mut stream: S,
    peer: std::net::SocketAddr,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut prefix = [0u8; HASH_LEN + 2];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = stream.read(&mut prefix[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let stat = parse_hash_prefix(&prefix[..filled])
        .and_then(|hash| ctx.store.authenticate(hash));
    let stat = match stat {
        Some(stat) => stat,
        None => {
            return fallback::serve(stream, &prefix[..filled], &ctx.fallback, cancel).await;
        }
    };

    let header = RequestHeader::read_from(&mut stream).await?;
    let account = Account::for_user(Arc::clone(&stat), Arc::clone(&ctx.meter));
    match header.command {
        Command::Connect => {
            if ctx.router.decide(&header.address) == Policy::Block {
                tracing::debug!(%peer, target = %header.address, "blocked by rules");
                return Ok(());
            }
            tracing::info!(%peer, user = %stat.hash(), target = %header.address, "tunneling");
            let outbound = net::dial(
                &header.address,
                ctx.config.tcp.prefer_ipv4,
                ctx.config.tcp.no_delay,
            )
            .await?;
            relay_stream(stream, outbound, account, cancel).await
        }
        Command::Associate => {
            tracing::info!(%peer, user = %stat.hash(), "udp associated");
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
            relay_udp(
                stream,
                socket,
                account,
                cancel,
                std::time::Duration::from_secs(ctx.config.udp_timeout),
                ctx.config.tcp.prefer_ipv4,
            )
            .await
        }
        Command::Mux => {
            tracing::debug!(%peer, user = %stat.hash(), "mux session started");
            mux::serve(
                stream,
                stat,
                Arc::clone(&ctx.meter),
                Arc::clone(&ctx.router),
                ctx.config.tcp.clone(),
                ctx.config.mux.clone(),
                cancel,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticStore;
    use crate::meter::NullMeter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use veilgate_protocol::hash_password;

    fn test_ctx(fallback: FallbackTarget) -> SessionContext {
        let config = Config::parse(
            r#"{
                "run_type": "server",
                "local_port": 443,
                "remote_host": "127.0.0.1",
                "remote_port": 80,
                "passwords": ["swordfish"],
                "tls": {"cert": "c", "key": "k"}
            }"#,
        )
        .unwrap();
        SessionContext {
            store: Arc::new(StaticStore::new(&["swordfish".to_string()])),
            meter: Arc::new(NullMeter),
            router: Arc::new(Router::all(Policy::Proxy)),
            config: Arc::new(config),
            fallback,
        }
    }

    #[test]
    fn hash_prefix_shapes() {
        let good = format!("{}\r\n", hash_password("swordfish"));
        assert!(parse_hash_prefix(good.as_bytes()).is_some());

        // 58 bytes of 'A' is hex-shaped but has no CRLF
        assert!(parse_hash_prefix(&[b'A'; 58]).is_none());

        // non-hex characters
        let bad = format!("{}zz\r\n", &hash_password("x")[..54]);
        assert!(parse_hash_prefix(bad.as_bytes()).is_none());

        // short prefix
        assert!(parse_hash_prefix(b"abc").is_none());
    }

    /// 58 bytes of garbage reach the decoy byte-for-byte; the client sees
    /// only what the decoy answers.
    #[tokio::test]
    async fn unauthenticated_bytes_replay_to_decoy() {
        let decoy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let decoy_addr = decoy.local_addr().unwrap();
        let decoy_task = tokio::spawn(async move {
            let (mut conn, _) = decoy.accept().await.unwrap();
            let mut seen = [0u8; 58];
            conn.read_exact(&mut seen).await.unwrap();
            conn.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
            seen
        });

        let ctx = test_ctx(FallbackTarget {
            decoy: Some(("127.0.0.1".to_string(), decoy_addr.port())),
            http_response: None,
        });
        let (client, session) = tokio::io::duplex(4096);
        let peer = "203.0.113.9:5000".parse().unwrap();
        let session_task = tokio::spawn(async move {
            dispatch(&ctx, session, peer, CancellationToken::new()).await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&[b'A'; 58]).await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_r.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 400 Bad Request\r\n\r\n");
        assert_eq!(decoy_task.await.unwrap(), [b'A'; 58]);
        session_task.await.unwrap().unwrap();
    }

    /// A valid hash with a truncated address is a protocol error: the
    /// session closes without any response and without a dial.
    #[tokio::test]
    async fn truncated_request_after_auth_closes_silently() {
        let ctx = test_ctx(FallbackTarget {
            decoy: None,
            http_response: None,
        });
        let (client, session) = tokio::io::duplex(4096);
        let peer = "203.0.113.9:5000".parse().unwrap();
        let session_task = tokio::spawn(async move {
            dispatch(&ctx, session, peer, CancellationToken::new()).await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let mut bytes = format!("{}\r\n", hash_password("swordfish")).into_bytes();
        bytes.extend_from_slice(&[0x01, 0x03, 0x07, b'e', b'x', b'a']);
        client_w.write_all(&bytes).await.unwrap();
        client_w.shutdown().await.unwrap();

        let err = session_task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Protocol(veilgate_protocol::ProtocolError::TruncatedAddress)
        ));
        let mut response = Vec::new();
        client_r.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty(), "no bytes are written on protocol errors");
    }

    /// An authenticated Connect pumps payload to the dialed destination.
    #[tokio::test]
    async fn authenticated_connect_relays() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let upstream_task = tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut request = [0u8; 18];
            conn.read_exact(&mut request).await.unwrap();
            conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
            request
        });

        let ctx = test_ctx(FallbackTarget {
            decoy: None,
            http_response: None,
        });
        let (client, session) = tokio::io::duplex(4096);
        let peer = "203.0.113.9:5000".parse().unwrap();
        let session_task = tokio::spawn(async move {
            dispatch(&ctx, session, peer, CancellationToken::new()).await
        });

        let header = RequestHeader::new(
            Command::Connect,
            veilgate_protocol::Address::from_socket_addr(upstream_addr),
        );
        let frame = header.encode(&hash_password("swordfish")).unwrap();
        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(&frame).await.unwrap();
        client_w.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_r.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\n");
        assert_eq!(&upstream_task.await.unwrap(), b"GET / HTTP/1.0\r\n\r\n");
        session_task.await.unwrap().unwrap();
    }
}
