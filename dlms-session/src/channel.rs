//! PDU channel traits shared by the HDLC and wrapper session layers

use crate::error::DlmsResult;
use crate::hdlc::{HdlcReader, HdlcWriter};
use async_trait::async_trait;

/// Sends complete application PDUs
#[async_trait]
pub trait PduSender: Send + Sync {
    async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()>;
}

/// Receives complete application PDUs
///
/// A fatal error (see [`crate::DlmsError::is_fatal`]) means the channel is
/// unusable and no further PDUs will arrive.
#[async_trait]
pub trait PduReceiver: Send {
    async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>>;
}

#[async_trait]
impl PduSender for HdlcWriter {
    async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
        self.write(pdu).await
    }
}

#[async_trait]
impl PduReceiver for HdlcReader {
    async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
        self.read().await
    }
}

#[async_trait]
impl<S: PduSender + ?Sized> PduSender for std::sync::Arc<S> {
    async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
        (**self).send_pdu(pdu).await
    }
}

#[async_trait]
impl<R: PduReceiver + ?Sized> PduReceiver for Box<R> {
    async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
        (**self).receive_pdu().await
    }
}
