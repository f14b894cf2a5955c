//! TCP transport implementation

use crate::error::{DlmsError, DlmsResult};
use crate::io::{IoReader, IoWriter};
use crate::stream::{not_connected, StreamAccessor, StreamReader, StreamWriter, TransportLayer};
use async_trait::async_trait;
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP transport layer settings
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub address: SocketAddr,
    /// Connect timeout; `None` waits for the operating system
    pub timeout: Option<Duration>,
}

impl TcpSettings {
    /// Create new TCP settings
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create TCP settings with timeout
    pub fn with_timeout(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            address,
            timeout: Some(timeout),
        }
    }
}

/// TCP transport layer implementation
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    settings: TcpSettings,
    closed: bool,
}

impl TcpTransport {
    /// Create a new TCP transport layer
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            stream: None,
            settings,
            closed: true,
        }
    }

    /// Create TCP transport from address string
    pub fn from_address(address: &str) -> DlmsResult<Self> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| DlmsError::InvalidData(format!("Invalid TCP address: {}", e)))?;
        Ok(Self::new(TcpSettings::new(addr)))
    }

    /// Wrap an already connected stream
    pub fn from_connected_stream(stream: TcpStream) -> DlmsResult<Self> {
        let address = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            settings: TcpSettings::new(address),
            closed: false,
        })
    }

    fn stream_mut(&mut self) -> DlmsResult<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

#[async_trait]
impl TransportLayer for TcpTransport {
    async fn open(&mut self) -> DlmsResult<()> {
        if !self.closed {
            return Err(DlmsError::Connection(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Connection has already been opened",
            )));
        }

        let connect = TcpStream::connect(self.settings.address);
        let stream = match self.settings.timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| DlmsError::Timeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        debug!("tcp: connected to {}", self.settings.address);

        self.stream = Some(stream);
        self.closed = false;
        Ok(())
    }
}

#[async_trait]
impl StreamReader for TcpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> DlmsResult<usize> {
        let result = self.stream_mut()?.read(buf).await;
        match result {
            Ok(0) => {
                self.closed = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.closed = true;
                Err(DlmsError::Connection(e))
            }
        }
    }
}

#[async_trait]
impl StreamWriter for TcpTransport {
    async fn write(&mut self, buf: &[u8]) -> DlmsResult<usize> {
        Ok(self.stream_mut()?.write(buf).await?)
    }

    async fn flush(&mut self) -> DlmsResult<()> {
        Ok(self.stream_mut()?.flush().await?)
    }

    async fn shutdown(&mut self) -> DlmsResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.closed = true;
        Ok(())
    }
}

impl StreamAccessor for TcpTransport {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn split(self: Box<Self>) -> DlmsResult<(Box<dyn StreamReader>, Box<dyn StreamWriter>)> {
        let stream = self.stream.ok_or_else(not_connected)?;
        let (r, w) = stream.into_split();
        Ok((Box::new(IoReader(r)), Box::new(IoWriter(w))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_settings() {
        let addr: SocketAddr = "127.0.0.1:4059".parse().unwrap();
        let settings = TcpSettings::new(addr);
        assert_eq!(settings.address, addr);
        assert!(settings.timeout.is_some());
        assert!(TcpTransport::from_address("not an address").is_err());
    }

    #[tokio::test]
    async fn test_open_and_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut t = TcpTransport::new(TcpSettings::with_timeout(addr, Duration::from_secs(5)));
        t.open().await.unwrap();
        assert!(!t.is_closed());
        assert!(t.open().await.is_err());

        let (mut r, mut w) = Box::new(t).split().unwrap();
        w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[test]
    fn test_split_unopened() {
        let addr: SocketAddr = "127.0.0.1:4059".parse().unwrap();
        assert!(Box::new(TcpTransport::new(TcpSettings::new(addr))).split().is_err());
    }
}
