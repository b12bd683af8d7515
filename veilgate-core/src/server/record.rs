use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps the raw TCP stream underneath the TLS acceptor and keeps a copy of
/// every byte read until recording is stopped. If the handshake is rejected,
/// the recorded bytes are exactly what the client sent and can be replayed
/// to the decoy; the TLS layer's internal buffers are never consulted.
pub struct RecordingStream<S> {
    inner: S,
    record: Option<Vec<u8>>,
}

impl<S> RecordingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            record: Some(Vec::new()),
        }
    }

    /// Stops buffering; called once the handshake has succeeded so an
    /// established session does not accumulate its whole inbound stream.
    pub fn stop_recording(&mut self) {
        self.record = None;
    }

    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.inner, self.record.unwrap_or_default())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(record)) = (&result, this.record.as_mut()) {
            record.extend_from_slice(&buf.filled()[before..]);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordingStream<S> {
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn records_reads_until_stopped() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut rec = RecordingStream::new(far);

        near.write_all(b"hello ").await.unwrap();
        let mut buf = [0u8; 6];
        rec.read_exact(&mut buf).await.unwrap();

        rec.stop_recording();
        near.write_all(b"world").await.unwrap();
        let mut buf2 = [0u8; 5];
        rec.read_exact(&mut buf2).await.unwrap();

        let (_inner, recorded) = rec.into_parts();
        assert_eq!(recorded, b"");
    }

    #[tokio::test]
    async fn recorded_bytes_match_the_wire() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut rec = RecordingStream::new(far);

        near.write_all(b"\x16\x03\x01junk").await.unwrap();
        let mut buf = [0u8; 7];
        rec.read_exact(&mut buf).await.unwrap();

        let (_inner, recorded) = rec.into_parts();
        assert_eq!(recorded, b"\x16\x03\x01junk");
    }

    #[tokio::test]
    async fn writes_pass_through_unrecorded() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut rec = RecordingStream::new(far);
        rec.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
        let (_inner, recorded) = rec.into_parts();
        assert!(recorded.is_empty());
    }
}
