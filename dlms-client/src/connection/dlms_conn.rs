//! DLMS connection: a byte stream to the meter plus its session layer
//!
//! Two dialers exist:
//! - [`DlmsConn::tcp_connect`]: plain TCP, PDUs framed by the wrapper header
//! - [`DlmsConn::hdlc_connect`]: TCP carrying an HDLC link, PDUs prefixed by
//!   the LLC header
//!
//! The PDU channel itself is opened by the association, which knows the
//! application client and logical device the wrapper header needs.

use dlms_core::{DlmsError, DlmsResult, WrongState};
use dlms_session::{
    HdlcLink, HdlcSettings, HdlcStatisticsSnapshot, LlcReceiver, LlcSender, PduReceiver, PduSender, ServerAddress,
    WrapperReceiver, WrapperSender,
};
use dlms_transport::{StreamAccessor, StreamReader, StreamWriter, TcpSettings, TcpTransport, TransportLayer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Session layer in use on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Wrapper,
    Hdlc,
}

/// Both halves of an open PDU channel
pub struct PduChannel {
    pub sender: Arc<dyn PduSender>,
    pub receiver: Box<dyn PduReceiver>,
}

enum Session {
    Wrapper {
        reader: Option<Box<dyn StreamReader>>,
        writer: Option<Box<dyn StreamWriter>>,
        sender: Option<WrapperSender>,
    },
    Hdlc {
        link: HdlcLink,
        disc_timeout: Duration,
    },
}

/// An open connection to a meter
pub struct DlmsConn {
    label: String,
    session: Session,
}

impl DlmsConn {
    /// Connect over TCP using the wrapper session
    pub async fn tcp_connect(address: SocketAddr, timeout: Duration) -> DlmsResult<Self> {
        let (reader, writer) = open_tcp(address, timeout).await?;
        log::info!("connected to {} (wrapper)", address);
        Ok(Self::wrapper(format!("tcp[{}]", address), reader, writer))
    }

    /// Use an already open stream with the wrapper session
    pub fn wrapper(label: impl Into<String>, reader: Box<dyn StreamReader>, writer: Box<dyn StreamWriter>) -> Self {
        Self {
            label: label.into(),
            session: Session::Wrapper {
                reader: Some(reader),
                writer: Some(writer),
                sender: None,
            },
        }
    }

    /// Connect over TCP and bring up an HDLC link (SNRM/UA within the SNRM timeout)
    pub async fn hdlc_connect(
        address: SocketAddr,
        application_client: u8,
        logical_device: u16,
        physical_device: Option<u16>,
        settings: HdlcSettings,
    ) -> DlmsResult<Self> {
        let (reader, writer) = open_tcp(address, settings.snrm_timeout).await?;
        let server = ServerAddress::new(logical_device, physical_device);
        let conn = Self::hdlc(format!("hdlc[{}]", address), reader, writer, application_client, server, settings).await?;
        log::info!("connected to {} (HDLC, server {})", address, server);
        Ok(conn)
    }

    /// Bring up an HDLC link over an already open stream
    pub async fn hdlc(
        label: impl Into<String>,
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        application_client: u8,
        server: ServerAddress,
        settings: HdlcSettings,
    ) -> DlmsResult<Self> {
        let disc_timeout = settings.disc_timeout;
        let link = HdlcLink::client(reader, writer, application_client, server, settings)?;
        if let Err(e) = link.connect().await {
            log::warn!("{} SNRM failed: {}", link.label(), e);
            link.shutdown().await;
            return Err(e);
        }
        Ok(Self {
            label: label.into(),
            session: Session::Hdlc { link, disc_timeout },
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn session_kind(&self) -> SessionKind {
        match self.session {
            Session::Wrapper { .. } => SessionKind::Wrapper,
            Session::Hdlc { .. } => SessionKind::Hdlc,
        }
    }

    /// Link statistics, for HDLC connections
    pub fn hdlc_statistics(&self) -> Option<HdlcStatisticsSnapshot> {
        match &self.session {
            Session::Hdlc { link, .. } => Some(link.statistics()),
            Session::Wrapper { .. } => None,
        }
    }

    /// Open the PDU channel between `application_client` and `logical_device`
    ///
    /// The channel can be opened once per connection.
    pub fn open_channel(&mut self, application_client: u16, logical_device: u16) -> DlmsResult<PduChannel> {
        match &mut self.session {
            Session::Wrapper { reader, writer, sender } => {
                let (Some(r), Some(w)) = (reader.take(), writer.take()) else {
                    return Err(DlmsError::WrongState(WrongState::NotAllowed));
                };
                let wrapper = WrapperSender::new(w, application_client, logical_device);
                *sender = Some(wrapper.clone());
                Ok(PduChannel {
                    sender: Arc::new(wrapper),
                    receiver: Box::new(WrapperReceiver::new(r, application_client, logical_device)),
                })
            }
            Session::Hdlc { link, .. } => {
                let reader = link
                    .take_reader()
                    .ok_or(DlmsError::WrongState(WrongState::NotAllowed))?;
                Ok(PduChannel {
                    sender: Arc::new(LlcSender::client(link.writer())),
                    receiver: Box::new(LlcReceiver::client(reader)),
                })
            }
        }
    }

    /// Close the connection; HDLC sends DISC first, bounded by the disconnect timeout
    pub async fn close(self) -> DlmsResult<()> {
        match self.session {
            Session::Wrapper { writer, sender, .. } => {
                let result = match (writer, sender) {
                    (Some(mut w), _) => w.shutdown().await,
                    (None, Some(s)) => s.shutdown().await,
                    (None, None) => Ok(()),
                };
                log::info!("{} closed", self.label);
                result
            }
            Session::Hdlc { link, disc_timeout } => {
                let disc = tokio::time::timeout(disc_timeout, link.disconnect()).await;
                let result = match disc {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        log::warn!("{} DISC failed: {}", self.label, e);
                        Err(e)
                    }
                    Err(_) => {
                        log::warn!("{} DISC timed out", self.label);
                        Err(DlmsError::Timeout)
                    }
                };
                link.shutdown().await;
                log::info!("{} closed", self.label);
                result
            }
        }
    }
}

async fn open_tcp(address: SocketAddr, timeout: Duration) -> DlmsResult<(Box<dyn StreamReader>, Box<dyn StreamWriter>)> {
    let settings = if timeout.is_zero() {
        TcpSettings {
            address,
            timeout: None,
        }
    } else {
        TcpSettings::with_timeout(address, timeout)
    };
    let mut transport = Box::new(TcpTransport::new(settings));
    transport.open().await?;
    transport.split()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlms_session::{HdlcReader, HdlcWriter, LinkState, ServerAddressLength};
    use dlms_transport::{IoReader, IoWriter};
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn halves(stream: tokio::io::DuplexStream) -> (Box<dyn StreamReader>, Box<dyn StreamWriter>) {
        let (r, w) = tokio::io::split(stream);
        (Box::new(IoReader(r)), Box::new(IoWriter(w)))
    }

    fn settings() -> HdlcSettings {
        HdlcSettings {
            server_address_length: ServerAddressLength::One,
            snrm_timeout: Duration::from_secs(2),
            disc_timeout: Duration::from_secs(2),
            ..HdlcSettings::default()
        }
    }

    #[tokio::test]
    async fn test_wrapper_channel_frames_pdus() {
        let (client, meter) = duplex(1024);
        let (r, w) = halves(client);
        let mut conn = DlmsConn::wrapper("test", r, w);
        assert_eq!(conn.session_kind(), SessionKind::Wrapper);
        let channel = conn.open_channel(0x10, 0x01).unwrap();
        assert!(conn.open_channel(0x10, 0x01).is_err());

        let (mut meter_r, mut meter_w) = halves(meter);
        channel.sender.send_pdu(&[0xC0, 0x01]).await.unwrap();
        let mut raw = [0u8; 10];
        meter_r.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0x00, 0x01, 0x00, 0x10, 0x00, 0x01, 0x00, 0x02, 0xC0, 0x01]);

        let mut receiver = channel.receiver;
        meter_w
            .write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x10, 0x00, 0x01, 0xC4])
            .await
            .unwrap();
        assert_eq!(receiver.receive_pdu().await.unwrap(), vec![0xC4]);

        conn.close().await.unwrap();
        let mut rest = [0u8; 1];
        assert_eq!(meter_r.read(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hdlc_connect_and_close() {
        let (client, meter) = duplex(4096);
        let (cr, cw) = halves(client);
        let (mr, mw) = halves(meter);
        let server = ServerAddress::new(1, None);
        let mut meter_link = HdlcLink::server(mr, mw, 0x10, server, settings()).unwrap();

        let mut conn = DlmsConn::hdlc("test", cr, cw, 0x10, server, settings()).await.unwrap();
        assert_eq!(conn.session_kind(), SessionKind::Hdlc);
        meter_link.wait_for_state(LinkState::Connected).await.unwrap();

        let channel = conn.open_channel(0x10, 0x01).unwrap();
        channel.sender.send_pdu(&[0xC0, 0x01, 0x81]).await.unwrap();
        let mut meter_reader: HdlcReader = meter_link.take_reader().unwrap();
        assert_eq!(meter_reader.read().await.unwrap(), vec![0xE6, 0xE6, 0x00, 0xC0, 0x01, 0x81]);

        let meter_writer: HdlcWriter = meter_link.writer();
        meter_writer.write(&[0xE6, 0xE7, 0x00, 0xC4, 0x01, 0x81]).await.unwrap();
        let mut receiver = channel.receiver;
        assert_eq!(receiver.receive_pdu().await.unwrap(), vec![0xC4, 0x01, 0x81]);

        assert!(conn.hdlc_statistics().unwrap().frames_sent >= 2);
        conn.close().await.unwrap();
        meter_link.wait_for_state(LinkState::Disconnected).await.unwrap();
        meter_link.shutdown().await;
    }

    #[tokio::test]
    async fn test_hdlc_connect_without_answer_fails() {
        let (client, _meter) = duplex(4096);
        let (r, w) = halves(client);
        let settings = HdlcSettings {
            snrm_timeout: Duration::from_millis(100),
            response_timeout: Duration::from_millis(50),
            ..settings()
        };
        let result = DlmsConn::hdlc("test", r, w, 0x10, ServerAddress::new(1, None), settings).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let conn = DlmsConn::tcp_connect(address, Duration::from_secs(2)).await.unwrap();
        let peer = TcpTransport::from_connected_stream(accept.await.unwrap().unwrap()).unwrap();
        assert!(!peer.is_closed());
        assert!(conn.label().starts_with("tcp["));
        conn.close().await.unwrap();
    }
}
