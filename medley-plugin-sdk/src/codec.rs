//! Length-delimited framing over an async byte stream.
//!
//! Each frame is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON envelope. [`FrameReader`] and [`FrameWriter`] wrap the two
//! halves of a split stream; both enforce [`crate::wire::MAX_FRAME_LEN`] so
//! a corrupt peer cannot make the host allocate unbounded memory.

use crate::error::TransportError;
use crate::wire::MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads length-prefixed frames from the read half of a stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame body.
    ///
    /// Returns `Ok(None)` on clean EOF at a frame boundary and
    /// [`TransportError::ConnectionClosed`] when the stream ends mid-frame.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
                _ => TransportError::Io(e),
            })?;
        Ok(Some(body))
    }
}

/// Writes length-prefixed frames to the write half of a stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        self.inner
            .write_all(&(body.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, _w) = tokio::io::split(server);
        let (_r, write_half) = tokio::io::split(client);
        let mut writer = FrameWriter::new(write_half);
        let mut reader = FrameReader::new(read_half);

        writer.write_frame(b"{\"id\":1}").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"second").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"id\":1}");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _w) = tokio::io::split(server);
        drop(client);
        let mut reader = FrameReader::new(read_half);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_a_closed_connection() {
        let (mut client, server) = tokio::io::duplex(64);
        let (read_half, _w) = tokio::io::split(server);
        // Announce 8 bytes, deliver 3, then hang up.
        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc")
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(read_half);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let (read_half, _w) = tokio::io::split(server);
        let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge)
            .await
            .unwrap();

        let mut reader = FrameReader::new(read_half);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }
}
