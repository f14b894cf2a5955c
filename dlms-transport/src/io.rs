//! Transport over any tokio byte stream
//!
//! Used for in-process links (`tokio::io::duplex`) and for wrapping the
//! halves of an already split socket.

use crate::error::DlmsResult;
use crate::stream::{StreamAccessor, StreamReader, StreamWriter};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read half adapter for any `AsyncRead`
pub struct IoReader<R>(pub R);

/// Write half adapter for any `AsyncWrite`
pub struct IoWriter<W>(pub W);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> StreamReader for IoReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> DlmsResult<usize> {
        Ok(self.0.read(buf).await?)
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StreamWriter for IoWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> DlmsResult<usize> {
        Ok(self.0.write(buf).await?)
    }

    async fn flush(&mut self) -> DlmsResult<()> {
        Ok(self.0.flush().await?)
    }

    async fn shutdown(&mut self) -> DlmsResult<()> {
        Ok(self.0.shutdown().await?)
    }
}

/// Transport wrapping an already connected tokio stream
pub struct IoTransport<S> {
    stream: S,
    closed: bool,
}

impl<S> IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> StreamReader for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> DlmsResult<usize> {
        let n = self.stream.read(buf).await?;
        if n == 0 && !buf.is_empty() {
            self.closed = true;
        }
        Ok(n)
    }
}

#[async_trait]
impl<S> StreamWriter for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, buf: &[u8]) -> DlmsResult<usize> {
        Ok(self.stream.write(buf).await?)
    }

    async fn flush(&mut self) -> DlmsResult<()> {
        Ok(self.stream.flush().await?)
    }

    async fn shutdown(&mut self) -> DlmsResult<()> {
        self.closed = true;
        Ok(self.stream.shutdown().await?)
    }
}

impl<S> StreamAccessor for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn split(self: Box<Self>) -> DlmsResult<(Box<dyn StreamReader>, Box<dyn StreamWriter>)> {
        let (r, w) = tokio::io::split(self.stream);
        Ok((Box::new(IoReader(r)), Box::new(IoWriter(w))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_halves() {
        let (a, b) = tokio::io::duplex(64);
        let (mut ar, mut aw) = Box::new(IoTransport::new(a)).split().unwrap();
        let (mut br, mut bw) = Box::new(IoTransport::new(b)).split().unwrap();

        aw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        br.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        bw.write_all(b"pong").await.unwrap();
        ar.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_read_exact_eof() {
        let (a, b) = tokio::io::duplex(64);
        let mut t = IoTransport::new(a);
        t.write_all(&[1, 2]).await.unwrap();
        t.shutdown().await.unwrap();
        assert!(t.is_closed());

        let (mut r, _w) = Box::new(IoTransport::new(b)).split().unwrap();
        let mut buf = [0u8; 3];
        let err = r.read_exact(&mut buf).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
