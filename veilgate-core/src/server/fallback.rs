//! The decoy relay.
//!
//! Traffic that fails authentication is indistinguishable from traffic to
//! the decoy web server because it *is* traffic to the decoy web server:
//! whatever was already consumed from the client is written to the decoy
//! first, then the two ends are pumped until either closes. Nothing about
//! the failure is ever written to the client by this process.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Where unauthenticated traffic goes.
#[derive(Clone)]
pub struct FallbackTarget {
    /// Decoy host and port; `None` means no decoy is deployed.
    pub decoy: Option<(String, u16)>,
    /// Canned payload used when no decoy is configured.
    pub http_response: Option<Arc<Vec<u8>>>,
}

/// Serves one unauthenticated connection. `buffered` holds every byte the
/// dispatcher already consumed; the decoy must see them before anything
/// else so the request arrives exactly as sent.
pub async fn serve<S>(
    client: S,
    buffered: &[u8],
    target: &FallbackTarget,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match (&target.decoy, &target.http_response) {
        (Some((host, port)), _) => {
            let decoy = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| {
                    Error::network_with_source(format!("cannot reach decoy {host}:{port}"), e)
                })?;
            decoy.set_nodelay(true).ok();
            relay_with_decoy(client, buffered, decoy, cancel).await
        }
        (None, Some(response)) => {
            let mut client = client;
            client.write_all(response).await?;
            let _ = client.shutdown().await;
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

async fn relay_with_decoy<C, D>(
    mut client: C,
    buffered: &[u8],
    mut decoy: D,
    cancel: CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    decoy.write_all(buffered).await?;
    decoy.flush().await?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = tokio::io::copy_bidirectional(&mut client, &mut decoy) => {
            r.map(|_| ()).map_err(Error::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn buffered_bytes_reach_the_decoy_first() {
        let (client_near, client_far) = tokio::io::duplex(256);
        let (decoy_near, decoy_far) = tokio::io::duplex(256);

        let buffered = vec![b'A'; 58];
        let relay = tokio::spawn(async move {
            relay_with_decoy(client_far, &buffered, decoy_far, CancellationToken::new()).await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client_near);
        let (mut decoy_r, mut decoy_w) = tokio::io::split(decoy_near);

        // decoy sees the replayed prefix before anything the client sends next
        let mut prefix = [0u8; 58];
        decoy_r.read_exact(&mut prefix).await.unwrap();
        assert_eq!(prefix, [b'A'; 58]);

        client_w.write_all(b" more").await.unwrap();
        client_w.shutdown().await.unwrap();
        let mut rest = Vec::new();
        decoy_r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" more");

        decoy_w.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
        decoy_w.shutdown().await.unwrap();
        let mut response = Vec::new();
        client_r.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 400 Bad Request\r\n\r\n");

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn canned_response_without_decoy() {
        let (near, far) = tokio::io::duplex(256);
        let target = FallbackTarget {
            decoy: None,
            http_response: Some(Arc::new(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec())),
        };
        let relay = tokio::spawn(async move {
            serve(far, b"", &target, CancellationToken::new()).await
        });
        let mut out = Vec::new();
        let (mut r, _w) = tokio::io::split(near);
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HTTP/1.1 404 Not Found\r\n\r\n");
        relay.await.unwrap().unwrap();
    }
}
