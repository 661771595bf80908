//! Byte-stream channel with exact-count reads/writes and per-call deadlines.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{map_io_error, AdbError, Result};

/// Sentinel for "no deadline": streaming reads (e.g. waiting for the next
/// `track-devices` snapshot) block until data arrives or the peer closes.
pub(crate) const INFINITE_TIMEOUT: Duration = Duration::MAX;

/// A connection to the ADB server.
///
/// Every read and write moves an exact number of bytes under an explicit
/// deadline. A deadline overrun fails with [`AdbError::Timeout`] and poisons
/// the channel: the stream position is indeterminate once an in-flight exact
/// read has been abandoned, so all subsequent operations fail.
#[derive(Debug)]
pub struct AdbChannel {
    stream: TcpStream,
    poisoned: bool,
}

impl AdbChannel {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = with_deadline(timeout, TcpStream::connect(addr))
            .await?
            .map_err(AdbError::Io)?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            poisoned: false,
        })
    }

    pub async fn read_exactly(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.check_poisoned()?;
        match with_deadline(timeout, self.stream.read_exact(buf)).await {
            Ok(res) => {
                res.map_err(map_io_error)?;
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    pub async fn write_exactly(&mut self, buf: &[u8], timeout: Duration) -> Result<()> {
        self.check_poisoned()?;
        match with_deadline(timeout, self.stream.write_all(buf)).await {
            Ok(res) => {
                res.map_err(map_io_error)?;
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Read whatever is available, up to `buf.len()` bytes. Returns 0 on a
    /// clean end-of-stream. Used for services that stream raw output until
    /// the daemon closes the connection (e.g. legacy `shell:`).
    pub async fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.check_poisoned()?;
        match with_deadline(timeout, self.stream.read(buf)).await {
            Ok(res) => res.map_err(map_io_error),
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Hand the raw stream to a protocol layered on top (e.g. JDWP after a
    /// `jdwp:<pid>` service request succeeds).
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(AdbError::ConnectionClosed);
        }
        Ok(())
    }
}

async fn with_deadline<F, T>(timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = T>,
{
    if timeout == INFINITE_TIMEOUT {
        return Ok(fut.await);
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AdbError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exact_read_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut channel = AdbChannel::connect(addr, Duration::from_secs(5))
            .await
            .unwrap();
        channel
            .write_exactly(b"ping", Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        channel
            .read_exactly(&mut buf, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn timeout_poisons_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never write, so the client read can only time out.
        let guard = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let mut channel = AdbChannel::connect(addr, Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            channel.read_exactly(&mut buf, Duration::from_millis(50)).await,
            Err(AdbError::Timeout)
        ));
        // Channel is unusable after the deadline fired mid-read.
        assert!(matches!(
            channel.read_exactly(&mut buf, Duration::from_millis(50)).await,
            Err(AdbError::ConnectionClosed)
        ));
        guard.abort();
    }

    #[tokio::test]
    async fn eof_maps_to_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut channel = AdbChannel::connect(addr, Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            channel.read_exactly(&mut buf, Duration::from_secs(5)).await,
            Err(AdbError::ConnectionClosed)
        ));
    }
}
