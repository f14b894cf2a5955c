//! Stream accessor traits for the transport layer

use crate::error::{DlmsError, DlmsResult};
use async_trait::async_trait;

/// Read half of a physical stream to a remote meter
#[async_trait]
pub trait StreamReader: Send {
    /// Read data from the stream
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer to read into
    ///
    /// # Returns
    ///
    /// Number of bytes read, or 0 if EOF
    async fn read(&mut self, buf: &mut [u8]) -> DlmsResult<usize>;

    /// Read exact number of bytes from the stream
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer to read into, will be filled completely
    ///
    /// # Returns
    ///
    /// An `UnexpectedEof` connection error if the stream ends first
    async fn read_exact(&mut self, mut buf: &mut [u8]) -> DlmsResult<()> {
        while !buf.is_empty() {
            let n = self.read(buf).await?;
            if n == 0 {
                return Err(DlmsError::eof("Failed to read exact number of bytes"));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

/// Write half of a physical stream to a remote meter
#[async_trait]
pub trait StreamWriter: Send {
    /// Write data to the stream
    ///
    /// # Arguments
    ///
    /// * `buf` - Data to write
    ///
    /// # Returns
    ///
    /// Number of bytes written
    async fn write(&mut self, buf: &[u8]) -> DlmsResult<usize>;

    /// Write all data to the stream
    ///
    /// # Arguments
    ///
    /// * `buf` - Data to write
    ///
    /// # Returns
    ///
    /// A `WriteZero` connection error if the stream stops accepting data
    async fn write_all(&mut self, buf: &[u8]) -> DlmsResult<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(DlmsError::Connection(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Failed to write all data",
                )));
            }
            written += n;
        }
        Ok(())
    }

    /// Flush any buffered data
    async fn flush(&mut self) -> DlmsResult<()>;

    /// Shut down the write direction, signalling EOF to the peer
    async fn shutdown(&mut self) -> DlmsResult<()>;
}

/// Stream accessor interface to access a physical stream to a remote meter
pub trait StreamAccessor: StreamReader + StreamWriter {
    /// Check if the stream is closed
    fn is_closed(&self) -> bool;

    /// Split an open stream into its read and write halves
    fn split(self: Box<Self>) -> DlmsResult<(Box<dyn StreamReader>, Box<dyn StreamWriter>)>;
}

/// Transport layer trait that extends StreamAccessor
#[async_trait]
pub trait TransportLayer: StreamAccessor {
    /// Open the physical layer connection
    async fn open(&mut self) -> DlmsResult<()>;
}

pub(crate) fn not_connected() -> DlmsError {
    DlmsError::Connection(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "stream not connected",
    ))
}
