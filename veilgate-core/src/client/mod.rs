//! The client runtime: local SOCKS5/HTTP listeners in front of the tunnel
//! dialer.
//!
//! Both local protocols share one listener; the first byte tells them
//! apart (0x05 is a SOCKS5 greeting, anything else is HTTP). Every request
//! is classified by the router: blocked targets are refused, bypassed
//! targets dialed directly, everything else goes through the tunnel —
//! multiplexed when mux is enabled.

mod http;
mod socks5;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use rustls_pki_types::ServerName;

use veilgate_protocol::{Address, Command, RequestHeader};

use crate::auth::{CredentialStore, UserStat};
use crate::config::{Config, Policy};
use crate::error::{Error, Result};
use crate::mux::{MuxConnector, MuxDialer, StreamIo};
use crate::net;
use crate::relay::Account;
use crate::router::Router;
use crate::tls;

/// Dials the remote server, completes TLS, and writes the request frame.
/// The hash is the first user in the local credential store.
pub struct TrojanDialer {
    remote: Address,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    stat: Arc<UserStat>,
    prefer_ipv4: bool,
    no_delay: bool,
}

impl TrojanDialer {
    pub fn new(config: &Config, store: &dyn CredentialStore) -> Result<Self> {
        let stat = store
            .list_users()
            .into_iter()
            .next()
            .ok_or_else(|| Error::config("no password found"))?;
        let remote = match config.remote_host.parse::<std::net::IpAddr>() {
            Ok(ip) => Address::from((ip, config.remote_port)),
            Err(_) => Address::Domain(config.remote_host.clone(), config.remote_port),
        };
        Ok(Self {
            remote,
            server_name: tls::server_name(config.effective_sni())?,
            connector: TlsConnector::from(tls::make_client_config(config)?),
            stat,
            prefer_ipv4: config.tcp.prefer_ipv4,
            no_delay: config.tcp.no_delay,
        })
    }

    pub fn stat(&self) -> Arc<UserStat> {
        Arc::clone(&self.stat)
    }

    /// Opens a tunnel session carrying the given request.
    pub async fn open(
        &self,
        header: &RequestHeader,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = net::dial(&self.remote, self.prefer_ipv4, self.no_delay).await?;
        let mut stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| Error::tls_with_source("tls handshake with server failed", e))?;
        header.write_to(&mut stream, self.stat.hash()).await?;
        Ok(stream)
    }
}

#[async_trait]
impl MuxDialer for TrojanDialer {
    async fn dial_mux(&self) -> Result<Box<dyn StreamIo>> {
        // the address of a Mux request is carried but never used
        let header = RequestHeader::new(Command::Mux, Address::Domain("mux".to_string(), 0));
        Ok(Box::new(self.open(&header).await?))
    }
}

/// State shared by every local connection, whichever mode accepted it.
pub struct ClientContext {
    pub config: Arc<Config>,
    pub router: Arc<Router>,
    pub dialer: Arc<TrojanDialer>,
    pub mux: Option<MuxConnector>,
}

impl ClientContext {
    pub fn new(
        config: Arc<Config>,
        router: Arc<Router>,
        store: &dyn CredentialStore,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let dialer = Arc::new(TrojanDialer::new(&config, store)?);
        let mux = if config.mux.enabled {
            Some(MuxConnector::new(
                Arc::clone(&dialer) as Arc<dyn MuxDialer>,
                config.mux.clone(),
                cancel.child_token(),
            ))
        } else {
            None
        };
        Ok(Arc::new(Self {
            config,
            router,
            dialer,
            mux,
        }))
    }

    pub fn account(&self) -> Account {
        Account::for_user(self.dialer.stat(), Arc::new(crate::meter::NullMeter))
    }

    /// Opens a proxied stream toward `addr`, multiplexed when enabled.
    pub async fn open_tunnel(&self, header: RequestHeader) -> Result<Box<dyn StreamIo>> {
        match (&self.mux, header.command) {
            (Some(mux), Command::Connect) => Ok(Box::new(mux.open(&header).await?)),
            _ => Ok(Box::new(self.dialer.open(&header).await?)),
        }
    }

    /// Applies routing policy to a Connect request. `Ok(None)` means the
    /// destination is blocked.
    pub async fn open_outbound(&self, addr: &Address) -> Result<Option<Box<dyn StreamIo>>> {
        match self.router.decide(addr) {
            Policy::Block => {
                tracing::debug!(target = %addr, "blocked by rules");
                Ok(None)
            }
            Policy::Bypass => {
                tracing::debug!(target = %addr, "direct connection");
                let stream = net::dial(
                    addr,
                    self.config.tcp.prefer_ipv4,
                    self.config.tcp.no_delay,
                )
                .await?;
                Ok(Some(Box::new(stream)))
            }
            Policy::Proxy => {
                tracing::debug!(target = %addr, "tunneling");
                let header = RequestHeader::new(Command::Connect, addr.clone());
                Ok(Some(self.open_tunnel(header).await?))
            }
        }
    }
}

pub struct ClientRuntime {
    ctx: Arc<ClientContext>,
    cancel: CancellationToken,
}

impl ClientRuntime {
    pub fn new(ctx: Arc<ClientContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.ctx.config.local_addr()?;
        let listener = net::listen(addr, &self.ctx.config.tcp)?;
        tracing::info!(%addr, "client listening");
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
            let ctx = Arc::clone(&self.ctx);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_local(ctx, stream, cancel).await {
                    tracing::debug!(%peer, error = %e, "local connection closed");
                }
            });
        }
        Ok(())
    }
}

async fn handle_local(
    ctx: Arc<ClientContext>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    if ctx.config.tcp.no_delay {
        stream.set_nodelay(true).ok();
    }
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Ok(());
    }
    if first[0] == 0x05 {
        socks5::serve(stream, ctx, cancel).await
    } else {
        http::serve(stream, ctx, cancel).await
    }
}
