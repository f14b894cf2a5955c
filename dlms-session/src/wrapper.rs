//! Wrapper session layer for DLMS/COSEM over TCP
//!
//! Every PDU is preceded by an 8 byte big-endian header:
//! version (always 1), source wPort, destination wPort, payload length.

use crate::channel::{PduReceiver, PduSender};
use crate::error::{DlmsError, DlmsResult};
use async_trait::async_trait;
use dlms_transport::{StreamReader, StreamWriter};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wrapper header length
pub const WRAPPER_HEADER_LENGTH: usize = 8;

/// Only supported wrapper protocol version
pub const WRAPPER_VERSION: u16 = 1;

/// Wrapper header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperHeader {
    pub version: u16,
    pub src_wport: u16,
    pub dst_wport: u16,
    pub length: u16,
}

impl WrapperHeader {
    pub fn new(src_wport: u16, dst_wport: u16, length: u16) -> Self {
        Self {
            version: WRAPPER_VERSION,
            src_wport,
            dst_wport,
            length,
        }
    }

    pub fn encode(&self) -> [u8; WRAPPER_HEADER_LENGTH] {
        let mut out = [0u8; WRAPPER_HEADER_LENGTH];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.src_wport.to_be_bytes());
        out[4..6].copy_from_slice(&self.dst_wport.to_be_bytes());
        out[6..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> DlmsResult<Self> {
        if data.len() < WRAPPER_HEADER_LENGTH {
            return Err(DlmsError::InvalidData(format!(
                "Wrapper header too short: expected {}, got {}",
                WRAPPER_HEADER_LENGTH,
                data.len()
            )));
        }
        let field = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Ok(Self {
            version: field(0),
            src_wport: field(2),
            dst_wport: field(4),
            length: field(6),
        })
    }
}

/// Build one wrapper PDU
pub fn make_wpdu(src_wport: u16, dst_wport: u16, pdu: &[u8]) -> DlmsResult<Vec<u8>> {
    let length = u16::try_from(pdu.len()).map_err(|_| {
        DlmsError::InvalidValue(format!("PDU of {} bytes does not fit a wrapper frame", pdu.len()))
    })?;
    let mut out = Vec::with_capacity(WRAPPER_HEADER_LENGTH + pdu.len());
    out.extend_from_slice(&WrapperHeader::new(src_wport, dst_wport, length).encode());
    out.extend_from_slice(pdu);
    Ok(out)
}

fn broken_stream(msg: String) -> DlmsError {
    DlmsError::Connection(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Sending half of a wrapper session
#[derive(Clone)]
pub struct WrapperSender {
    writer: Arc<Mutex<Box<dyn StreamWriter>>>,
    src_wport: u16,
    dst_wport: u16,
}

impl WrapperSender {
    /// `local` is the application client, `remote` the logical device
    pub fn new(writer: Box<dyn StreamWriter>, local: u16, remote: u16) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            src_wport: local,
            dst_wport: remote,
        }
    }

    /// Shut down the write direction of the stream
    pub async fn shutdown(&self) -> DlmsResult<()> {
        self.writer.lock().await.shutdown().await
    }
}

#[async_trait]
impl PduSender for WrapperSender {
    async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
        let wpdu = make_wpdu(self.src_wport, self.dst_wport, pdu)?;
        log::trace!("wrapper >> {:02X?}", wpdu);
        let mut writer = self.writer.lock().await;
        writer.write_all(&wpdu).await?;
        writer.flush().await
    }
}

/// Receiving half of a wrapper session
pub struct WrapperReceiver {
    reader: Box<dyn StreamReader>,
    local: u16,
    remote: u16,
}

impl WrapperReceiver {
    /// Accepts PDUs sent by `remote` to `local`
    pub fn new(reader: Box<dyn StreamReader>, local: u16, remote: u16) -> Self {
        Self { reader, local, remote }
    }
}

#[async_trait]
impl PduReceiver for WrapperReceiver {
    async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
        let mut raw = [0u8; WRAPPER_HEADER_LENGTH];
        self.reader.read_exact(&mut raw).await?;
        let header = WrapperHeader::decode(&raw)?;

        if header.version != WRAPPER_VERSION {
            return Err(broken_stream(format!(
                "Header version was {}, this stack is only compatible to version 1",
                header.version
            )));
        }
        if header.src_wport != self.remote || header.dst_wport != self.local {
            return Err(broken_stream(format!(
                "wrapper ports {}->{} do not match {}->{}",
                header.src_wport, header.dst_wport, self.remote, self.local
            )));
        }

        let mut pdu = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut pdu).await?;
        log::trace!("wrapper << {:02X?}", pdu);
        Ok(pdu)
    }
}
