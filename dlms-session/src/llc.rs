//! LLC header carried in front of every DLMS PDU on an HDLC link

use crate::channel::{PduReceiver, PduSender};
use crate::error::{DlmsError, DlmsResult};
use async_trait::async_trait;

/// LLC header of a client request
pub const LLC_REQUEST: [u8; 3] = [0xE6, 0xE6, 0x00];

/// LLC header of a server response
pub const LLC_RESPONSE: [u8; 3] = [0xE6, 0xE7, 0x00];

/// Prefixes every outgoing PDU with an LLC header
pub struct LlcSender<S> {
    inner: S,
    header: [u8; 3],
}

impl<S: PduSender> LlcSender<S> {
    /// Client side: sends requests
    pub fn client(inner: S) -> Self {
        Self {
            inner,
            header: LLC_REQUEST,
        }
    }

    /// Server side: sends responses
    pub fn server(inner: S) -> Self {
        Self {
            inner,
            header: LLC_RESPONSE,
        }
    }
}

#[async_trait]
impl<S: PduSender> PduSender for LlcSender<S> {
    async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
        let mut framed = Vec::with_capacity(pdu.len() + self.header.len());
        framed.extend_from_slice(&self.header);
        framed.extend_from_slice(pdu);
        self.inner.send_pdu(&framed).await
    }
}

/// Checks and strips the LLC header of every incoming PDU
pub struct LlcReceiver<R> {
    inner: R,
    expected: [u8; 3],
}

impl<R: PduReceiver> LlcReceiver<R> {
    /// Client side: expects responses
    pub fn client(inner: R) -> Self {
        Self {
            inner,
            expected: LLC_RESPONSE,
        }
    }

    /// Server side: expects requests
    pub fn server(inner: R) -> Self {
        Self {
            inner,
            expected: LLC_REQUEST,
        }
    }
}

#[async_trait]
impl<R: PduReceiver> PduReceiver for LlcReceiver<R> {
    async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
        let mut pdu = self.inner.receive_pdu().await?;
        if !pdu.starts_with(&self.expected) {
            return Err(DlmsError::Decode(format!(
                "wrong LLC header {:02X?}, expected {:02X?}",
                &pdu[..pdu.len().min(3)],
                self.expected
            )));
        }
        pdu.drain(..self.expected.len());
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl PduSender for Recorder {
        async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
            self.0.lock().unwrap().push(pdu.to_vec());
            Ok(())
        }
    }

    struct Script(VecDeque<Vec<u8>>);

    #[async_trait]
    impl PduReceiver for Script {
        async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
            self.0.pop_front().ok_or(DlmsError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn test_request_header_prepended() {
        let sender = LlcSender::client(Recorder::default());
        sender.send_pdu(&[0xC0, 0x01]).await.unwrap();
        assert_eq!(sender.inner.0.lock().unwrap()[0], vec![0xE6, 0xE6, 0x00, 0xC0, 0x01]);
    }

    #[tokio::test]
    async fn test_response_header_checked() {
        let mut receiver = LlcReceiver::client(Script(VecDeque::from(vec![
            vec![0xE6, 0xE7, 0x00, 0xC4, 0x01],
            vec![0xE6, 0xE6, 0x00, 0xC4, 0x01],
            vec![0xE6],
        ])));
        assert_eq!(receiver.receive_pdu().await.unwrap(), vec![0xC4, 0x01]);
        assert!(matches!(receiver.receive_pdu().await, Err(DlmsError::Decode(_))));
        assert!(matches!(receiver.receive_pdu().await, Err(DlmsError::Decode(_))));
        assert!(receiver.receive_pdu().await.unwrap_err().is_fatal());
    }
}
