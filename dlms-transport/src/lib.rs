//! Transport layer module for the DLMS/COSEM client
//!
//! A transport is an ordered, reliable byte stream to the meter. Once opened it
//! is split into independent read and write halves so that a receive loop and
//! the senders above it never contend for the same handle.

pub mod error;
pub mod io;
pub mod stream;
pub mod tcp;

pub use error::{DlmsError, DlmsResult};
pub use io::{IoReader, IoTransport, IoWriter};
pub use stream::{StreamAccessor, StreamReader, StreamWriter, TransportLayer};
pub use tcp::{TcpSettings, TcpTransport};
