use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, RpcError};
use crate::transport::codec::{Frame, FrameKind, MAX_FRAME_SIZE};

/// Async framed TCP transport.
///
/// Every message on the wire is a frame:
///
/// ```text
/// [4-byte length as u32 big-endian] [1-byte kind] [payload]
/// ```
///
/// The length counts the payload only. Publish frames carry a JSON
/// envelope (or an array of them); ping frames have an empty payload.
///
/// # Example
///
/// ```no_run
/// use courier_common::transport::{Frame, TcpTransport};
/// use std::time::Duration;
///
/// # async fn demo() -> courier_common::Result<()> {
/// let mut stream = TcpTransport::connect("127.0.0.1:3723", Duration::from_secs(5)).await?;
/// TcpTransport::send_frame(&mut stream, &Frame::ping_req()).await?;
/// let reply = TcpTransport::receive_frame(&mut stream).await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport;

impl TcpTransport {
    /// Connects to `addr`, failing with `Timeout` after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RpcError::Timeout(format!(
                    "connect to {} timeout after {}ms",
                    addr,
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| RpcError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Transport(format!("Failed to set TCP_NODELAY: {}", e)))?;

        Ok(stream)
    }

    /// Writes one frame and flushes.
    pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = frame.encode()?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| Self::map_io_error(e, "writing frame"))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;
        Ok(())
    }

    /// Reads one frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly
    /// between frames.
    pub async fn receive_frame<R>(reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 5];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Self::map_io_error(e, "reading frame header")),
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = FrameKind::from_byte(header[4])?;

        // Validate length to prevent allocation of excessively large buffers
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::InvalidMessage(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Self::map_io_error(e, "reading frame payload"))?;

        Ok(Some(Frame { kind, payload }))
    }

    /// Map IO errors to RpcError variants
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Connection errors -> `ServerClosed`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                RpcError::Timeout(format!("{}: timed out", context))
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                RpcError::ServerClosed(format!("{}: connection lost", context))
            }
            _ => RpcError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        TcpTransport::send_frame(&mut a, &Frame::publish(b"[1,2]".to_vec()))
            .await
            .unwrap();
        TcpTransport::send_frame(&mut a, &Frame::ping_resp()).await.unwrap();

        let first = TcpTransport::receive_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Publish);
        assert_eq!(first.payload, b"[1,2]");

        let second = TcpTransport::receive_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::PingResp);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(TcpTransport::receive_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        header.push(0x01);
        a.write_all(&header).await.unwrap();
        let err = TcpTransport::receive_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = TcpTransport::connect(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
